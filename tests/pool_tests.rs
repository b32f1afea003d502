//! Pool lifecycle and accounting tests.

use std::sync::Arc;
use std::time::Duration;

use lua_sandbox_rs::{
    CallContext, InterpreterFactory, InterpreterPool, PoolConfig, SandboxError, SecurityConfig,
    SecurityEnforcer, SecurityLevel,
};
use tokio_test::{assert_err, assert_ok};

fn pool(min_size: usize, max_size: usize) -> Arc<InterpreterPool> {
    let enforcer = SecurityEnforcer::new(&SecurityConfig::new(SecurityLevel::Strict)).unwrap();
    let factory = InterpreterFactory::new(Arc::new(enforcer));
    InterpreterPool::new(
        PoolConfig {
            min_size,
            max_size,
            ..PoolConfig::default()
        },
        factory,
    )
    .unwrap()
}

#[tokio::test]
async fn test_exhausted_pool_cancels_on_deadline() {
    let pool = pool(1, 2);

    let first = assert_ok!(pool.get(&CallContext::new()).await);
    let second = assert_ok!(pool.get(&CallContext::new()).await);

    let ctx = CallContext::new().with_timeout(Duration::from_millis(50));
    let started = std::time::Instant::now();
    let err = assert_err!(pool.get(&ctx).await);
    assert!(matches!(err, SandboxError::Cancelled(_)), "got {err:?}");
    assert!(started.elapsed() >= Duration::from_millis(40));

    let metrics = pool.metrics();
    assert_eq!(metrics.in_use, 2);
    assert_eq!(metrics.available, 0);

    pool.put(first);
    pool.put(second);
    assert_eq!(pool.metrics().available, 2);
}

#[tokio::test]
async fn test_capacity_never_exceeded_under_contention() {
    let pool = pool(1, 3);
    let mut tasks = Vec::new();
    for _ in 0..12 {
        let pool = Arc::clone(&pool);
        tasks.push(tokio::spawn(async move {
            let ctx = CallContext::new().with_timeout(Duration::from_secs(5));
            let instance = pool.get(&ctx).await?;
            let metrics = pool.metrics();
            assert!(metrics.available + metrics.in_use <= 3);
            tokio::time::sleep(Duration::from_millis(5)).await;
            pool.put(instance);
            Ok::<_, SandboxError>(())
        }));
    }
    for task in tasks {
        assert_ok!(task.await.unwrap());
    }

    let metrics = pool.metrics();
    assert!(metrics.total_created <= 3);
    assert_eq!(metrics.in_use, 0);
}

#[tokio::test]
async fn test_abandoned_instance_never_returns() {
    let pool = pool(1, 2);
    let ctx = CallContext::new();

    let instance = assert_ok!(pool.get(&ctx).await);
    let id = instance.id();
    let running = instance.completion().start();
    pool.abandon(id);

    let metrics = pool.metrics();
    assert_eq!(metrics.in_use, 0);
    assert_eq!(metrics.abandoned, 1);
    assert_eq!(metrics.total_abandoned, 1);

    // The straggler eventually hands its instance back; it must be discarded.
    pool.put(instance);
    drop(running);
    tokio::time::sleep(Duration::from_millis(20)).await;

    for _ in 0..4 {
        let leased = assert_ok!(pool.get(&ctx).await);
        assert_ne!(leased.id(), id);
        pool.put(leased);
    }
    assert_eq!(pool.metrics().abandoned, 0);
}

#[tokio::test]
async fn test_abandoned_running_instance_counts_against_capacity() {
    let pool = pool(1, 1);
    let instance = assert_ok!(pool.get(&CallContext::new()).await);
    let running = instance.completion().start();
    pool.abandon(instance.id());

    let ctx = CallContext::new().with_timeout(Duration::from_millis(30));
    assert!(assert_err!(pool.get(&ctx).await).is_cancelled());

    drop(running);
    drop(instance);
    let ctx = CallContext::new().with_timeout(Duration::from_secs(1));
    assert_ok!(pool.get(&ctx).await);
}

#[tokio::test]
async fn test_shutdown_waits_for_returns() {
    let pool = pool(1, 2);
    let instance = assert_ok!(pool.get(&CallContext::new()).await);

    let returner = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            pool.put(instance);
        })
    };

    assert_ok!(pool.shutdown(Duration::from_secs(1)).await);
    returner.await.unwrap();
    assert!(pool.is_shutting_down());
    assert_eq!(pool.metrics().available, 0);
}

#[tokio::test]
async fn test_waiters_released_on_shutdown() {
    let pool = pool(1, 1);
    let held = assert_ok!(pool.get(&CallContext::new()).await);

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.get(&CallContext::new()).await.map(|i| i.id()) })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = assert_err!(pool.shutdown(Duration::from_millis(20)).await);
    assert!(matches!(err, SandboxError::ShutdownTimeout { in_use: 1 }));
    assert!(matches!(
        waiter.await.unwrap(),
        Err(SandboxError::PoolShutdown)
    ));
    pool.put(held);
}

#[tokio::test]
async fn test_shutdown_grace_waits_for_running_call() {
    let pool = pool(1, 1);
    let instance = assert_ok!(pool.get(&CallContext::new()).await);
    let running = instance.completion().start();

    // The call finishes well after the shutdown timeout but inside the grace period.
    let finisher = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            pool.put(instance);
            drop(running);
        })
    };

    let started = std::time::Instant::now();
    assert_ok!(pool.shutdown(Duration::from_millis(20)).await);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(100), "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "returned after {elapsed:?}");

    finisher.await.unwrap();
    let metrics = pool.metrics();
    assert_eq!(metrics.in_use, 0);
    assert_eq!(metrics.available, 0);
}

#[tokio::test]
async fn test_failing_factory_surfaces_on_get() {
    let enforcer = SecurityEnforcer::new(&SecurityConfig::new(SecurityLevel::Strict)).unwrap();
    let factory = InterpreterFactory::new(Arc::new(enforcer)).with_init_script("error('x')");
    let pool = assert_ok!(InterpreterPool::new(
        PoolConfig {
            min_size: 2,
            max_size: 4,
            ..PoolConfig::default()
        },
        factory,
    ));

    let metrics = pool.metrics();
    assert_eq!(metrics.available, 0);
    assert_eq!(metrics.total_created, 0);

    let err = assert_err!(pool.get(&CallContext::new()).await);
    assert!(matches!(err, SandboxError::Creation(_)), "got {err:?}");

    // Failed creations release their reservation.
    pool.cleanup();
    let err = assert_err!(pool.get(&CallContext::new()).await);
    assert!(matches!(err, SandboxError::Creation(_)), "got {err:?}");
    assert_eq!(pool.metrics().in_use, 0);
}
