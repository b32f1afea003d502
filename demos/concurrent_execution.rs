//! Example of concurrent Lua execution over one interpreter pool.
//!
//! Tasks share a single sandbox; the pool bounds how many interpreters
//! exist and the bytecode cache skips recompiling repeated scripts.
//!
//! Run with: cargo run --example concurrent_execution

use std::sync::Arc;
use std::time::{Duration, Instant};

use lua_sandbox_rs::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Concurrent Execution Example ===\n");

    let config = SandboxConfig::builder()
        .timeout(Duration::from_secs(10))
        .min_size(2)
        .max_size(4)
        .build();
    let sandbox = Arc::new(LuaSandbox::new(config)?);

    let tasks = vec![
        (
            "Task 1",
            "local s = 0 for i = 1, 100 do s = s + i * i end return s",
            "Sum of squares",
        ),
        (
            "Task 2",
            "local n = 0 for x = 0, 999 do if x % 3 == 0 then n = n + 1 end end return n",
            "Count divisible by 3",
        ),
        (
            "Task 3",
            "local t = {} for i = 0, 49 do t[#t + 1] = string.char(65 + i % 26) end return table.concat(t)",
            "Generate letters",
        ),
        (
            "Task 4",
            "local m = 0 for i = 0, 100 do m = math.max(m, i * (100 - i)) end return m",
            "Maximum product",
        ),
    ];

    println!("Starting {} concurrent tasks...\n", tasks.len());
    let start = Instant::now();

    let mut handles = Vec::new();
    for (name, code, description) in tasks {
        let sandbox = Arc::clone(&sandbox);
        handles.push(tokio::spawn(async move {
            let report = sandbox
                .execute_detailed(&CallContext::new(), ScriptRequest::new(code))
                .await?;
            Ok::<_, SandboxError>((name, description, report))
        }));
    }

    println!("Results:");
    println!("{:-<60}", "");
    for handle in handles {
        match handle.await {
            Ok(Ok((name, description, report))) => {
                println!(
                    "{}: {} = {} (instance {}, took {:?})",
                    name, description, report.value, report.instance_id, report.exec_time
                );
            }
            Ok(Err(e)) => println!("Task error: {}", e),
            Err(e) => println!("Join error: {}", e),
        }
    }
    println!("{:-<60}", "");
    println!("\nTotal wall-clock time: {:?}", start.elapsed());

    // A batch runs concurrently and keeps input order.
    let requests = (1..=8)
        .map(|n| ScriptRequest::new("return n * n").param("n", n))
        .collect();
    let squares: Vec<String> = sandbox
        .batch_execute(requests)
        .await
        .into_iter()
        .map(|r| r.map(|v| v.to_string()).unwrap_or_else(|e| e.to_string()))
        .collect();
    println!("Batch: {}", squares.join(", "));

    println!("\nMetrics: {:?}", sandbox.metrics().pool);
    sandbox.shutdown(Duration::from_secs(1)).await
}
