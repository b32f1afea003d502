//! Example demonstrating error handling patterns.
//!
//! This example shows how to handle the error kinds a call can produce:
//! syntax errors, runtime errors, timeouts, memory limits and blocked
//! capabilities.
//!
//! Run with: cargo run --example error_handling

use std::time::Duration;

use lua_sandbox_rs::prelude::*;
use lua_sandbox_rs::ErrorKind;

async fn classify(sandbox: &LuaSandbox, code: &str) -> String {
    match sandbox.execute(code).await {
        Ok(value) => format!("Success: {}", value),
        Err(SandboxError::Syntax { chunk, line, message }) => {
            format!("Syntax error in {} at line {:?}: {}", chunk, line, message)
        }
        Err(e) if e.is_timeout() => "Timeout".to_string(),
        Err(e) if e.is_memory_limit() => "Memory limit".to_string(),
        Err(e) if e.kind() == ErrorKind::Runtime => format!("Runtime: {}", e),
        Err(e) => format!("Sandbox error: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Error Handling Example ===\n");

    let config = SandboxConfig::builder()
        .security_level(SecurityLevel::Strict)
        .timeout(Duration::from_millis(500))
        .max_memory(8 * 1024 * 1024)
        .max_instructions(0)
        .build();
    let sandbox = LuaSandbox::new(config)?;

    let test_cases = vec![
        ("return 6 * 7", "Simple value"),
        ("return 1 +", "Syntax error"),
        ("local t = nil return t.x", "Nil index"),
        ("error({ code = 42 })", "Error object"),
        ("return io.open('/etc/passwd')", "Blocked library"),
        ("local function f() return f() + 1 end return f()", "Stack overflow"),
        ("while true do end", "Infinite loop"),
        (
            "local t = {} for i = 1, 1e8 do t[i] = string.rep('x', 64) .. i end",
            "Memory exhaustion",
        ),
    ];

    println!("Classification results:");
    for (code, description) in test_cases {
        let classification = classify(&sandbox, code).await;
        println!("  {}: {}", description, classification);
    }

    // Configuration problems surface before any script runs.
    println!("\n--- Invalid configuration ---");
    let bad = SandboxConfig::builder().min_size(4).max_size(2).build();
    match LuaSandbox::new(bad) {
        Ok(_) => println!("unexpectedly accepted"),
        Err(e) => println!("Rejected: {}", e),
    }

    println!("\n=== Error Handling Example Complete ===");
    sandbox.shutdown(Duration::from_secs(1)).await
}
