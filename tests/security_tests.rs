//! Security tests to verify sandbox isolation.
//!
//! These tests attempt various escape techniques to verify the sandbox
//! properly restricts access to the host system.

use std::time::Duration;

use lua_sandbox_rs::prelude::*;
use serde_json::json;

/// Helper to create a sandbox at `level`.
fn sandbox(level: SecurityLevel) -> LuaSandbox {
    let config = SandboxConfig::builder()
        .security_level(level)
        .timeout(Duration::from_secs(5))
        .max_size(2)
        .build();
    LuaSandbox::new(config).unwrap()
}

/// Runs `body` inside pcall and reports whether it was blocked.
async fn blocked(sandbox: &LuaSandbox, body: &str) -> bool {
    let script = format!(
        "local ok, err = pcall(function() {body} end) \
         if ok then return 'SECURITY_BREACH' end return 'BLOCKED'"
    );
    match sandbox.execute(&script).await {
        Ok(value) => value == json!("BLOCKED"),
        Err(_) => true,
    }
}

/// Test that infinite loops are properly terminated.
#[tokio::test]
async fn test_infinite_loop_timeout() {
    let config = SandboxConfig::builder()
        .timeout(Duration::from_millis(200))
        .max_instructions(0)
        .build();
    let sandbox = LuaSandbox::new(config).unwrap();

    let result = sandbox.execute("while true do end").await;
    assert!(
        matches!(result, Err(SandboxError::Timeout(_))),
        "infinite loop should timeout"
    );
}

/// Test that filesystem and environment access is unavailable in strict mode.
#[tokio::test]
async fn test_strict_blocks_filesystem_and_environment() {
    let sandbox = sandbox(SecurityLevel::Strict);

    for attempt in [
        "io.open('/etc/passwd', 'r')",
        "os.getenv('HOME')",
        "os.execute('echo BREACH')",
        "dofile('/etc/passwd')",
        "loadfile('/etc/passwd')",
        "require('io')",
        "require('os')",
        "package.loadlib('libc.so.6', 'system')",
    ] {
        assert!(blocked(&sandbox, attempt).await, "{attempt} should be blocked");
    }
}

/// Test that os operations are sanitized in standard mode.
#[tokio::test]
async fn test_standard_sanitizes_os() {
    let sandbox = sandbox(SecurityLevel::Standard);

    for attempt in [
        "os.execute('echo BREACH')",
        "os.exit(1)",
        "os.getenv('HOME')",
        "os.remove('/tmp/x')",
        "os.rename('/tmp/a', '/tmp/b')",
        "io.open('/etc/passwd')",
        "require('socket')",
    ] {
        assert!(blocked(&sandbox, attempt).await, "{attempt} should be blocked");
    }

    let clock = sandbox.execute("return type(os.time())").await.unwrap();
    assert_eq!(clock, json!("number"));
}

/// Test that process control is stripped even in minimal mode.
#[tokio::test]
async fn test_minimal_strips_process_control() {
    let sandbox = sandbox(SecurityLevel::Minimal);

    for attempt in ["os.execute('true')", "os.exit(0)", "io.popen('ls')", "require('ffi')"] {
        assert!(blocked(&sandbox, attempt).await, "{attempt} should be blocked");
    }
}

/// Test that the debug library is never exposed.
#[tokio::test]
async fn test_debug_library_never_available() {
    for level in [
        SecurityLevel::Minimal,
        SecurityLevel::Standard,
        SecurityLevel::Strict,
    ] {
        let sandbox = sandbox(level);
        let value = sandbox.execute("return debug == nil").await.unwrap();
        assert_eq!(value, json!(true), "debug exposed at {level}");
    }

    let config = SandboxConfig::builder()
        .security(SecurityConfig::custom(["base", "string", "debug"]))
        .build();
    assert!(matches!(
        LuaSandbox::new(config),
        Err(SandboxError::Config(_))
    ));
}

/// Test that bytecode cannot be produced or loaded by scripts.
#[tokio::test]
async fn test_bytecode_forgery_blocked() {
    let sandbox = sandbox(SecurityLevel::Minimal);

    let dump = sandbox.execute("return string.dump == nil").await.unwrap();
    assert_eq!(dump, json!(true));

    let message = sandbox
        .execute("local f, err = load('\\27LuaT\\0') return tostring(err)")
        .await
        .unwrap();
    assert!(message.as_str().unwrap().contains("binary"));

    let value = sandbox.execute("return load('return 5')()").await.unwrap();
    assert_eq!(value, json!(5));
}

/// Test that the shared string metatable cannot be reached.
#[tokio::test]
async fn test_string_metatable_escape_blocked() {
    let sandbox = sandbox(SecurityLevel::Standard);

    let hidden = sandbox.execute("return getmetatable('')").await.unwrap();
    assert_eq!(hidden, json!(false));

    assert!(blocked(&sandbox, "getmetatable('').__index = { len = function() return 0 end }").await);
    let value = sandbox.execute("return ('abc'):len()").await.unwrap();
    assert_eq!(value, json!(3));
}

/// Test that garbage collector control is disabled.
#[tokio::test]
async fn test_collectgarbage_disabled() {
    let sandbox = sandbox(SecurityLevel::Standard);
    let err = sandbox.execute("collectgarbage('stop')").await.unwrap_err();
    assert!(err.to_string().contains("disabled for security"));
}

/// Test that custom denied functions are stripped.
#[tokio::test]
async fn test_custom_denied_functions() {
    let config = SandboxConfig::builder()
        .security(SecurityConfig::custom(["base", "string", "table", "os"]).deny("os.date"))
        .timeout(Duration::from_secs(5))
        .build();
    let sandbox = LuaSandbox::new(config).unwrap();

    let value = sandbox
        .execute("return { date = os.date == nil, execute = os.execute == nil, math = math == nil }")
        .await
        .unwrap();
    assert_eq!(value, json!({ "date": true, "execute": true, "math": true }));
}

/// Test that memory exhaustion is contained.
#[tokio::test]
async fn test_memory_limit() {
    let config = SandboxConfig::builder()
        .security_level(SecurityLevel::Strict)
        .max_memory(2 * 1024 * 1024)
        .max_instructions(0)
        .timeout(Duration::from_secs(10))
        .build();
    let sandbox = LuaSandbox::new(config).unwrap();

    let result = sandbox
        .execute("local t = {} for i = 1, 1e8 do t[i] = string.rep('x', 64) .. i end")
        .await;
    match result {
        Err(SandboxError::MemoryLimitExceeded(_)) => {}
        Err(e) if e.to_string().contains("not enough memory") => {}
        other => panic!("expected memory error, got {other:?}"),
    }
}

/// Test that state does not leak between calls on the same instance.
#[tokio::test]
async fn test_globals_do_not_leak_between_calls() {
    let config = SandboxConfig::builder()
        .security_level(SecurityLevel::Standard)
        .min_size(1)
        .max_size(1)
        .build();
    let sandbox = LuaSandbox::new(config).unwrap();

    sandbox
        .execute("secret = 'token' string.upper = function() return 'pwned' end")
        .await
        .unwrap();
    let value = sandbox
        .execute("return { secret = secret == nil, upper = ('a'):upper() }")
        .await
        .unwrap();
    assert_eq!(value, json!({ "secret": true, "upper": "A" }));
}

/// Test that module caches written by one call are invisible to the next.
#[tokio::test]
async fn test_loaded_modules_do_not_leak_between_calls() {
    let config = SandboxConfig::builder()
        .security_level(SecurityLevel::Standard)
        .min_size(1)
        .max_size(1)
        .build();
    let modules = ModuleRegistry::new().register("secret", |lua| {
        let module = lua.create_table()?;
        module.set("value", "host")?;
        Ok(module)
    });
    let sandbox =
        LuaSandbox::new_with_options(config, SandboxOptions::new().modules(modules)).unwrap();

    sandbox
        .execute(
            "package.loaded.secret = { value = 'tenant-A' } \
             package.loaded.string = { upper = function() return 'pwned' end }",
        )
        .await
        .unwrap();
    let value = sandbox
        .execute("return require('secret').value .. ' ' .. require('string').upper('x')")
        .await
        .unwrap();
    assert_eq!(value, json!("host X"));
}

/// Test that protected calls cannot shield a script from its instruction budget.
#[tokio::test]
async fn test_protected_calls_cannot_catch_limits() {
    let config = SandboxConfig::builder()
        .security_level(SecurityLevel::Strict)
        .max_instructions(100_000)
        .timeout(Duration::from_secs(10))
        .build();
    let sandbox = LuaSandbox::new(config).unwrap();

    for script in [
        "while true do pcall(function() while true do end end) end",
        "while true do xpcall(function() while true do end end, function(e) return e end) end",
        "local co = coroutine.create(function() while true do end end) \
         while true do coroutine.resume(co) end",
    ] {
        let err = sandbox.execute(script).await.unwrap_err();
        assert!(
            err.to_string().contains("instruction limit exceeded"),
            "{script}: {err}"
        );
    }

    // Ordinary errors are still caught.
    let value = sandbox
        .execute("local ok, err = pcall(error, 'plain', 0) return { ok = ok, err = err }")
        .await
        .unwrap();
    assert_eq!(value, json!({ "ok": false, "err": "plain" }));
}
