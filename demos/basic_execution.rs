//! Basic example of executing Lua code in the sandbox.
//!
//! Run with: cargo run --example basic_execution

use std::time::Duration;

use lua_sandbox_rs::prelude::*;
use serde_json::json;

#[tokio::main]
async fn main() -> Result<()> {
    // Configure the sandbox
    let config = SandboxConfig::builder()
        .security_level(SecurityLevel::Standard)
        .timeout(Duration::from_secs(5))
        .max_memory(32 * 1024 * 1024) // 32MB
        .build();

    println!("Creating sandbox with config: {:?}", config);
    let sandbox = LuaSandbox::new(config)?;

    println!("\n=== Test 1: Simple arithmetic ===");
    match sandbox.execute("return 1 + 1").await {
        Ok(value) => println!("result: {}", value),
        Err(e) => eprintln!("Error: {}", e),
    }

    println!("\n=== Test 2: Parameters and output ===");
    let code = r#"
local lines = {}
for i, name in ipairs(names) do
    print(string.format("%d: %s", i, name))
    lines[#lines + 1] = name:upper()
end
return { count = #lines, upper = lines }
"#;
    let request = ScriptRequest::new(code)
        .filename("names.lua")
        .param("names", json!(["ada", "grace", "edsger"]));
    match sandbox.execute_detailed(&CallContext::new(), request).await {
        Ok(report) => {
            println!("output:\n{}", report.output);
            println!("value: {}", report.value);
            println!("cache_hit: {}", report.cache_hit);
            println!("exec_time: {:?}", report.exec_time);
            println!("memory_used: {} bytes", report.memory_used);
            println!("peak_memory: {} bytes", report.peak_memory);
        }
        Err(e) => eprintln!("Error: {}", e),
    }

    println!("\n=== Test 3: Lua error ===");
    match sandbox.execute("error('test error')").await {
        Ok(value) => println!("unexpected value: {}", value),
        Err(e) => eprintln!("Execution error: {}", e),
    }

    let metrics = sandbox.metrics();
    println!("\n=== Metrics ===");
    println!("pool: {:?}", metrics.pool);
    println!("cache hit rate: {:.2}", metrics.pipeline.cache_hit_rate());

    sandbox.shutdown(Duration::from_secs(1)).await
}
