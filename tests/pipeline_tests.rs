//! End-to-end pipeline scenarios.

use std::sync::Arc;
use std::time::{Duration, Instant};

use lua_sandbox_rs::prelude::*;
use lua_sandbox_rs::{
    BytecodeCache, CacheConfig, ExecutionPipeline, InterpreterFactory, InterpreterPool,
    PipelineConfig, PoolConfig, SecurityEnforcer,
};
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

/// Instruction counting is off so deadlines, not budgets, stop runaway loops.
fn pipeline(max_size: usize, call_timeout: Duration) -> ExecutionPipeline {
    let mut security = SecurityConfig::new(SecurityLevel::Standard);
    security.limits.max_instructions = 0;
    let enforcer = SecurityEnforcer::new(&security).unwrap();
    let pool = InterpreterPool::new(
        PoolConfig {
            min_size: 1,
            max_size,
            ..PoolConfig::default()
        },
        InterpreterFactory::new(Arc::new(enforcer)),
    )
    .unwrap();
    let cache = Arc::new(BytecodeCache::new(CacheConfig::default()));
    ExecutionPipeline::new(pool, cache, PipelineConfig { call_timeout }).unwrap()
}

#[tokio::test]
async fn test_cache_miss_then_hit() {
    let pipeline = pipeline(2, Duration::from_secs(5));
    let ctx = CallContext::new();

    let first = assert_ok!(
        pipeline
            .execute_detailed(&ctx, ScriptRequest::new("return 1+1"))
            .await
    );
    let second = assert_ok!(
        pipeline
            .execute_detailed(&ctx, ScriptRequest::new("return 1+1"))
            .await
    );

    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    assert_eq!(first.value, json!(2));
    assert_eq!(second.value, json!(2));

    let metrics = pipeline.metrics();
    assert_eq!(metrics.cache_misses, 1);
    assert_eq!(metrics.cache_hits, 1);
    assert_eq!(metrics.calls_executed, 2);
    assert_eq!(metrics.errors, 0);
}

#[tokio::test]
async fn test_filename_is_part_of_cache_key() {
    let pipeline = pipeline(2, Duration::from_secs(5));
    let ctx = CallContext::new();

    for name in ["a.lua", "b.lua"] {
        let report = assert_ok!(
            pipeline
                .execute_detailed(&ctx, ScriptRequest::new("return 1").filename(name))
                .await
        );
        assert!(!report.cache_hit);
    }
    assert_eq!(pipeline.cache().len(), 2);
}

#[tokio::test]
async fn test_infinite_loop_times_out_and_abandons() {
    let pipeline = pipeline(2, Duration::from_millis(30));
    let before = pipeline.pool().metrics();

    let started = Instant::now();
    let err = assert_err!(
        pipeline
            .execute(&CallContext::new(), ScriptRequest::new("while true do end"))
            .await
    );
    assert!(err.is_timeout(), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(1));

    let after = pipeline.pool().metrics();
    assert_eq!(after.total_abandoned, 1);
    assert_eq!(after.in_use, 0);
    assert!(after.available < before.available + 1);
    assert_eq!(pipeline.metrics().timeouts, 1);

    // The pool keeps serving once the abandoned call has unwound.
    let value = assert_ok!(
        pipeline
            .execute(&CallContext::new(), ScriptRequest::new("return 'alive'"))
            .await
    );
    assert_eq!(value, json!("alive"));
}

#[tokio::test]
async fn test_syntax_error_is_not_cached() {
    let pipeline = pipeline(2, Duration::from_secs(5));
    let ctx = CallContext::new();

    for _ in 0..2 {
        let err = assert_err!(
            pipeline
                .execute(&ctx, ScriptRequest::new("return +").filename("broken.lua"))
                .await
        );
        match err {
            SandboxError::Syntax { chunk, line, .. } => {
                assert_eq!(chunk, "broken.lua");
                assert_eq!(line, Some(1));
            }
            other => panic!("expected syntax error, got {other:?}"),
        }
    }
    assert!(pipeline.cache().is_empty());
    assert_eq!(pipeline.metrics().errors, 2);
}

#[tokio::test]
async fn test_parameters_are_injected() {
    let pipeline = pipeline(2, Duration::from_secs(5));
    let request = ScriptRequest::new(
        "local total = 0 \
         for _, item in ipairs(order.items) do total = total + item.price * item.qty end \
         return { customer = order.customer, total = total * (1 - discount) }",
    )
    .param(
        "order",
        json!({
            "customer": "ada",
            "items": [{ "price": 10, "qty": 2 }, { "price": 5, "qty": 1 }]
        }),
    )
    .param("discount", 0.5);

    let value = assert_ok!(pipeline.execute(&CallContext::new(), request).await);
    assert_eq!(value, json!({ "customer": "ada", "total": 12.5 }));
}

#[tokio::test]
async fn test_parameters_do_not_leak() {
    let pipeline = pipeline(1, Duration::from_secs(5));
    let ctx = CallContext::new();

    assert_ok!(
        pipeline
            .execute(&ctx, ScriptRequest::new("return x").param("x", 1))
            .await
    );
    let value = assert_ok!(pipeline.execute(&ctx, ScriptRequest::new("return x")).await);
    assert_eq!(value, json!(null));
}

#[tokio::test]
async fn test_batch_preserves_order() {
    let pipeline = pipeline(3, Duration::from_secs(5));
    let requests = (0..8)
        .map(|i| ScriptRequest::new("return n * n").param("n", i))
        .chain(std::iter::once(ScriptRequest::new("error('nope')")))
        .collect();

    let results = pipeline.batch_execute(&CallContext::new(), requests).await;
    assert_eq!(results.len(), 9);
    for (i, result) in results.iter().take(8).enumerate() {
        assert_eq!(result.as_ref().unwrap(), &json!(i * i));
    }
    assert!(results[8].as_ref().unwrap_err().is_runtime());
}

#[tokio::test]
async fn test_cancelled_caller_gets_timeout_mid_execution() {
    let pipeline = pipeline(2, Duration::from_secs(5));
    let ctx = CallContext::new();
    let canceller = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            ctx.cancel();
        })
    };

    let err = assert_err!(
        pipeline
            .execute(&ctx, ScriptRequest::new("local i = 0 while true do i = i + 1 end"))
            .await
    );
    canceller.await.unwrap();
    assert!(err.is_timeout());
    assert_eq!(pipeline.pool().metrics().total_abandoned, 1);
}

#[tokio::test]
async fn test_runtime_error_reports_location() {
    let pipeline = pipeline(2, Duration::from_secs(5));
    let err = assert_err!(
        pipeline
            .execute(
                &CallContext::new(),
                ScriptRequest::new("local t = nil\nreturn t.field").filename("calc.lua"),
            )
            .await
    );
    assert!(err.is_runtime());
    assert!(err.to_string().contains("calc.lua:2"), "got {err}");
}

#[tokio::test]
async fn test_instruction_budget_is_a_runtime_error() {
    let config = SandboxConfig::builder()
        .security_level(SecurityLevel::Strict)
        .max_instructions(100_000)
        .timeout(Duration::from_secs(10))
        .build();
    let sandbox = assert_ok!(LuaSandbox::new(config));

    let err = assert_err!(sandbox.execute("while true do end").await);
    assert!(err.is_runtime(), "got {err:?}");
    assert!(err.to_string().contains("instruction limit exceeded"));
    assert_eq!(sandbox.metrics().pool.total_abandoned, 0);
}

#[tokio::test]
async fn test_pcall_loop_is_stopped_and_instance_reclaimed() {
    let config = SandboxConfig::builder()
        .security_level(SecurityLevel::Strict)
        .min_size(1)
        .max_size(1)
        .timeout(Duration::from_millis(50))
        .max_instructions(0)
        .build();
    let sandbox = assert_ok!(LuaSandbox::new(config));

    let err = assert_err!(
        sandbox
            .execute("while true do pcall(function() while true do end end) end")
            .await
    );
    assert!(err.is_timeout(), "got {err:?}");

    // The abandoned call must unwind on its own despite catching every error.
    let deadline = Instant::now() + Duration::from_secs(2);
    while sandbox.metrics().pool.abandoned > 0 {
        assert!(Instant::now() < deadline, "abandoned call never unwound");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let value = assert_ok!(sandbox.execute("return 1").await);
    assert_eq!(value, json!(1));
}

#[tokio::test]
async fn test_coroutine_loop_is_stopped_and_instance_reclaimed() {
    let config = SandboxConfig::builder()
        .security_level(SecurityLevel::Strict)
        .min_size(1)
        .max_size(1)
        .timeout(Duration::from_millis(50))
        .max_instructions(0)
        .build();
    let sandbox = assert_ok!(LuaSandbox::new(config));

    let err = assert_err!(
        sandbox
            .execute("coroutine.wrap(function() while true do end end)()")
            .await
    );
    assert!(err.is_timeout(), "got {err:?}");

    let deadline = Instant::now() + Duration::from_secs(2);
    while sandbox.metrics().pool.abandoned > 0 {
        assert!(Instant::now() < deadline, "abandoned coroutine never unwound");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let value = assert_ok!(sandbox.execute("return 2").await);
    assert_eq!(value, json!(2));
}

#[tokio::test]
async fn test_facade_end_to_end() {
    let config = SandboxConfig::builder()
        .security_level(SecurityLevel::Strict)
        .timeout(Duration::from_secs(5))
        .build();
    let sandbox = assert_ok!(LuaSandbox::new(config));

    let report = assert_ok!(
        sandbox
            .execute_detailed(
                &CallContext::new(),
                ScriptRequest::new("print('sum', a + b) return a + b")
                    .param("a", 2)
                    .param("b", 3),
            )
            .await
    );
    assert_eq!(report.value, json!(5));
    assert_eq!(report.output, "sum\t5\n");

    let metrics = sandbox.metrics();
    assert_eq!(metrics.pipeline.calls_executed, 1);
    assert_eq!(metrics.health.total_executions, 1);
    assert_ok!(sandbox.shutdown(Duration::from_secs(1)).await);
}
