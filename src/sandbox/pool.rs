//! Bounded pool of reusable sandboxed interpreters.
//!
//! Every instance is in exactly one of three places: the available queue, the
//! in-use registry, or the abandoned registry. Abandoned instances belong to a
//! call that timed out while guest code may still be running; they are never
//! handed out again and keep counting against `max_size` until that call
//! finishes and the instance is dropped by whoever still owns it.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SandboxError};
use crate::sandbox::context::CallContext;
use crate::sandbox::factory::{Interpreter, InterpreterFactory};
use crate::sandbox::health::HealthMonitor;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// How long shutdown waits on instances whose guest call is still running.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

/// Pool sizing and recycling policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolConfig {
    /// Instances kept ready at all times.
    pub min_size: usize,
    /// Upper bound on live instances, abandoned ones included.
    pub max_size: usize,
    /// Available instances idle longer than this are destroyed by cleanup.
    pub idle_timeout: Duration,
    /// Instances scoring below this are recycled.
    pub health_threshold: f64,
    /// Period of the background cleanup pass.
    pub cleanup_interval: Duration,
    /// Demand-driven resizing run by every cleanup pass.
    pub scaling: ScalingConfig,
}

impl PoolConfig {
    /// Default floor.
    pub const DEFAULT_MIN_SIZE: usize = 1;
    /// Default ceiling.
    pub const DEFAULT_MAX_SIZE: usize = 10;
    /// Default idle timeout.
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
    /// Default recycling threshold.
    pub const DEFAULT_HEALTH_THRESHOLD: f64 = 0.7;
    /// Default cleanup period.
    pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

    /// Replace zero values with defaults.
    pub fn normalized(mut self) -> Self {
        if self.min_size == 0 {
            self.min_size = Self::DEFAULT_MIN_SIZE;
        }
        if self.max_size == 0 {
            self.max_size = Self::DEFAULT_MAX_SIZE;
        }
        if self.idle_timeout.is_zero() {
            self.idle_timeout = Self::DEFAULT_IDLE_TIMEOUT;
        }
        if self.health_threshold <= 0.0 {
            self.health_threshold = Self::DEFAULT_HEALTH_THRESHOLD;
        }
        if self.cleanup_interval.is_zero() {
            self.cleanup_interval = Self::DEFAULT_CLEANUP_INTERVAL;
        }
        self.scaling = self.scaling.normalized();
        self
    }

    /// Reject inconsistent sizing.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(SandboxError::Config("pool max_size must be positive".to_string()));
        }
        if self.min_size > self.max_size {
            return Err(SandboxError::Config(format!(
                "pool min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if !(0.0..=1.0).contains(&self.health_threshold) {
            return Err(SandboxError::Config(format!(
                "health_threshold must be within [0, 1]: {}",
                self.health_threshold
            )));
        }
        self.scaling.validate()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: Self::DEFAULT_MIN_SIZE,
            max_size: Self::DEFAULT_MAX_SIZE,
            idle_timeout: Self::DEFAULT_IDLE_TIMEOUT,
            health_threshold: Self::DEFAULT_HEALTH_THRESHOLD,
            cleanup_interval: Self::DEFAULT_CLEANUP_INTERVAL,
            scaling: ScalingConfig::default(),
        }
    }
}

/// Predictive sizing between `min_size` and `max_size`.
///
/// Each cleanup pass samples the in-use ratio, fits a line through the recent
/// samples and extrapolates one pass ahead. A prediction above
/// `scale_up_threshold` warms extra instances; one below
/// `scale_down_threshold`, while current usage is also below it, releases
/// idle ones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingConfig {
    /// Whether cleanup passes resize the pool at all.
    pub enabled: bool,
    /// Predicted usage above which instances are added.
    pub scale_up_threshold: f64,
    /// Usage below which idle instances are released.
    pub scale_down_threshold: f64,
    /// Most instances added by a single pass.
    pub max_scale_up: usize,
    /// Usage samples kept for prediction.
    pub window: usize,
    /// Move the thresholds with the variance of a full window.
    pub adaptive_thresholds: bool,
}

impl ScalingConfig {
    /// Default scale-up threshold.
    pub const DEFAULT_SCALE_UP_THRESHOLD: f64 = 0.8;
    /// Default scale-down threshold.
    pub const DEFAULT_SCALE_DOWN_THRESHOLD: f64 = 0.2;
    /// Default per-pass growth cap.
    pub const DEFAULT_MAX_SCALE_UP: usize = 5;
    /// Default sample window.
    pub const DEFAULT_WINDOW: usize = 10;

    /// Scaling switched off; only the floor is maintained.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Replace zero values with defaults.
    pub fn normalized(mut self) -> Self {
        if self.scale_up_threshold <= 0.0 {
            self.scale_up_threshold = Self::DEFAULT_SCALE_UP_THRESHOLD;
        }
        if self.scale_down_threshold <= 0.0 {
            self.scale_down_threshold = Self::DEFAULT_SCALE_DOWN_THRESHOLD;
        }
        if self.max_scale_up == 0 {
            self.max_scale_up = Self::DEFAULT_MAX_SCALE_UP;
        }
        if self.window == 0 {
            self.window = Self::DEFAULT_WINDOW;
        }
        self
    }

    /// Thresholds must be ordered ratios.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.scale_up_threshold)
            || !(0.0..=1.0).contains(&self.scale_down_threshold)
        {
            return Err(SandboxError::Config(format!(
                "scaling thresholds must be within [0, 1]: up {} down {}",
                self.scale_up_threshold, self.scale_down_threshold
            )));
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(SandboxError::Config(format!(
                "scale_down_threshold ({}) must be below scale_up_threshold ({})",
                self.scale_down_threshold, self.scale_up_threshold
            )));
        }
        Ok(())
    }
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scale_up_threshold: Self::DEFAULT_SCALE_UP_THRESHOLD,
            scale_down_threshold: Self::DEFAULT_SCALE_DOWN_THRESHOLD,
            max_scale_up: Self::DEFAULT_MAX_SCALE_UP,
            window: Self::DEFAULT_WINDOW,
            adaptive_thresholds: true,
        }
    }
}

/// Usage history and the live thresholds it has tuned.
#[derive(Debug)]
struct ScalingState {
    history: VecDeque<f64>,
    scale_up_threshold: f64,
    scale_down_threshold: f64,
}

impl ScalingState {
    fn new(config: &ScalingConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(config.window),
            scale_up_threshold: config.scale_up_threshold,
            scale_down_threshold: config.scale_down_threshold,
        }
    }

    fn record(&mut self, usage: f64, window: usize) {
        self.history.push_back(usage);
        while self.history.len() > window {
            self.history.pop_front();
        }
    }

    /// Volatile usage widens the band between the thresholds; steady usage narrows it.
    fn adjust_thresholds(&mut self, window: usize) {
        if self.history.len() < window {
            return;
        }
        let n = self.history.len() as f64;
        let mean = self.history.iter().sum::<f64>() / n;
        let variance = self.history.iter().map(|u| (u - mean).powi(2)).sum::<f64>() / n;
        if variance > 0.1 {
            self.scale_up_threshold = (self.scale_up_threshold - 0.05).max(0.7);
            self.scale_down_threshold = (self.scale_down_threshold + 0.05).min(0.3);
        } else if variance < 0.05 {
            self.scale_up_threshold = (self.scale_up_threshold + 0.05).min(0.9);
            self.scale_down_threshold = (self.scale_down_threshold - 0.05).max(0.1);
        }
    }
}

/// Least-squares extrapolation of `history` one sample ahead, clamped to `[0, 1]`.
///
/// Fewer than three samples predict `0.5`, which triggers neither direction
/// with the default thresholds.
fn predict_usage(history: &VecDeque<f64>) -> f64 {
    if history.len() < 3 {
        return 0.5;
    }
    let n = history.len() as f64;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_xx) = (0.0, 0.0, 0.0, 0.0);
    for (i, y) in history.iter().enumerate() {
        let x = i as f64;
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_xx += x * x;
    }
    let slope = (n * sum_xy - sum_x * sum_y) / (n * sum_xx - sum_x * sum_x);
    let intercept = (sum_y - slope * sum_x) / n;
    (slope * n + intercept).clamp(0.0, 1.0)
}

/// Tracks whether a guest call is running on an instance.
#[derive(Debug, Default)]
pub struct Completion {
    executing: AtomicBool,
    notify: Notify,
}

impl Completion {
    /// Mark a call as started; the returned guard marks it finished on drop.
    pub fn start(self: &Arc<Self>) -> CompletionGuard {
        self.executing.store(true, Ordering::SeqCst);
        CompletionGuard {
            completion: Arc::clone(self),
        }
    }

    /// Whether a call is running right now.
    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    /// Resolve once no call is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_executing() {
                return;
            }
            notified.await;
        }
    }

    fn finish(&self) {
        self.executing.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Finishes its [`Completion`] when dropped, including during unwinding.
#[derive(Debug)]
pub struct CompletionGuard {
    completion: Arc<Completion>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.completion.finish();
    }
}

/// A leased or idle interpreter owned by a pool.
pub struct PooledInstance {
    id: u64,
    pool_id: u64,
    interpreter: Interpreter,
    created: Instant,
    last_used: Instant,
    use_count: u64,
    health: f64,
    completion: Arc<Completion>,
}

impl fmt::Debug for PooledInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledInstance")
            .field("id", &self.id)
            .field("pool_id", &self.pool_id)
            .field("use_count", &self.use_count)
            .field("health", &self.health)
            .field("executing", &self.is_executing())
            .finish()
    }
}

impl PooledInstance {
    /// Pool-unique instance id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Id of the owning pool.
    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    /// The sandboxed interpreter.
    pub fn interpreter(&self) -> &Interpreter {
        &self.interpreter
    }

    /// Shorthand for the interpreter's Lua state.
    pub fn lua(&self) -> &mlua::Lua {
        self.interpreter.lua()
    }

    /// When the instance was built.
    pub fn created(&self) -> Instant {
        self.created
    }

    /// When the instance was last returned.
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Number of leases so far.
    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    /// Health score recorded at the last return.
    pub fn health(&self) -> f64 {
        self.health
    }

    /// Whether a guest call is running on this instance.
    pub fn is_executing(&self) -> bool {
        self.completion.is_executing()
    }

    /// The completion signal of this instance.
    pub fn completion(&self) -> &Arc<Completion> {
        &self.completion
    }
}

/// A point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PoolMetrics {
    /// Instances ready to lease.
    pub available: usize,
    /// Instances currently leased.
    pub in_use: usize,
    /// Abandoned instances whose call has not finished yet.
    pub abandoned: usize,
    /// Instances ever built.
    pub total_created: u64,
    /// Instances destroyed for low health on return.
    pub total_recycled: u64,
    /// Instances destroyed by cleanup passes.
    pub total_cleaned_up: u64,
    /// Instances ever abandoned.
    pub total_abandoned: u64,
    /// Instances destroyed for any reason.
    pub total_destroyed: u64,
    /// Instances added ahead of predicted demand.
    pub total_scaled_up: u64,
    /// Idle instances released for low demand.
    pub total_scaled_down: u64,
}

#[derive(Debug)]
struct Lease {
    completion: Arc<Completion>,
}

#[derive(Debug, Default)]
struct PoolState {
    available: VecDeque<PooledInstance>,
    in_use: HashMap<u64, Lease>,
    abandoned: HashMap<u64, Arc<Completion>>,
    creating: usize,
    shutting_down: bool,
}

impl PoolState {
    fn occupied(&self) -> usize {
        self.available.len() + self.in_use.len() + self.abandoned.len() + self.creating
    }

    fn purge_abandoned(&mut self) -> usize {
        let before = self.abandoned.len();
        self.abandoned.retain(|_, completion| completion.is_executing());
        before - self.abandoned.len()
    }
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    recycled: AtomicU64,
    cleaned_up: AtomicU64,
    abandoned: AtomicU64,
    destroyed: AtomicU64,
    scaled_up: AtomicU64,
    scaled_down: AtomicU64,
}

enum Step {
    Ready(PooledInstance),
    Create,
    Wait,
}

/// A bounded, health-aware pool of sandboxed interpreters.
pub struct InterpreterPool {
    id: u64,
    config: PoolConfig,
    factory: InterpreterFactory,
    health: Arc<HealthMonitor>,
    state: Mutex<PoolState>,
    scaling: Mutex<ScalingState>,
    available_notify: Notify,
    next_instance_id: AtomicU64,
    counters: Counters,
    shutdown_token: CancellationToken,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<InterpreterPool>,
}

impl fmt::Debug for InterpreterPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterpreterPool")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl InterpreterPool {
    /// Build a pool and pre-populate `min_size` instances.
    ///
    /// Creation failures during pre-population are logged, not returned. When
    /// called inside a tokio runtime the periodic cleanup task is started.
    pub fn new(config: PoolConfig, factory: InterpreterFactory) -> Result<Arc<Self>> {
        Self::with_health(config, factory, Arc::new(HealthMonitor::new()))
    }

    /// Like [`Self::new`] with a shared health monitor.
    pub fn with_health(
        config: PoolConfig,
        factory: InterpreterFactory,
        health: Arc<HealthMonitor>,
    ) -> Result<Arc<Self>> {
        let config = config.normalized();
        config.validate()?;

        let pool = Arc::new_cyclic(|weak_self| Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            config,
            factory,
            health,
            state: Mutex::new(PoolState::default()),
            scaling: Mutex::new(ScalingState::new(&config.scaling)),
            available_notify: Notify::new(),
            next_instance_id: AtomicU64::new(1),
            counters: Counters::default(),
            shutdown_token: CancellationToken::new(),
            cleanup_task: Mutex::new(None),
            weak_self: weak_self.clone(),
        });

        for _ in 0..config.min_size {
            match pool.create_instance() {
                Ok(instance) => pool.state.lock().available.push_back(instance),
                Err(e) => warn!(pool_id = pool.id, error = %e, "failed to pre-populate instance"),
            }
        }

        pool.start_cleanup_task();
        info!(
            pool_id = pool.id,
            min_size = config.min_size,
            max_size = config.max_size,
            available = pool.state.lock().available.len(),
            "interpreter pool created"
        );
        Ok(pool)
    }

    /// Pool id carried by every instance it creates.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The effective configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The health monitor fed by callers.
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// The factory used for new instances.
    pub fn factory(&self) -> &InterpreterFactory {
        &self.factory
    }

    /// Lease an instance.
    ///
    /// Returns an idle instance if one exists, creates one while below
    /// `max_size`, and otherwise waits until an instance is returned or `ctx`
    /// ends. Every leased instance has been reset to its post-creation globals.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Bounds the wait for a free instance; creation itself is not
    ///   interrupted.
    ///
    /// # Returns
    ///
    /// The leased instance, which must go back through [`Self::put`] or
    /// [`Self::abandon`]. Fails with [`SandboxError::Cancelled`] when `ctx`
    /// ends first, [`SandboxError::PoolShutdown`] once shutdown has started, or
    /// [`SandboxError::Creation`] when a new instance cannot be built.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let ctx = CallContext::new().with_timeout(Duration::from_secs(1));
    /// let instance = pool.get(&ctx).await?;
    /// let value: i64 = instance.lua().load("return 1 + 1").eval()?;
    /// pool.put(instance);
    /// ```
    pub async fn get(&self, ctx: &CallContext) -> Result<PooledInstance> {
        loop {
            let notified = self.available_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return Err(SandboxError::PoolShutdown);
                }
                state.purge_abandoned();
                if let Some(instance) = state.available.pop_front() {
                    state.in_use.insert(
                        instance.id,
                        Lease {
                            completion: Arc::clone(&instance.completion),
                        },
                    );
                    Step::Ready(instance)
                } else if state.occupied() < self.config.max_size {
                    state.creating += 1;
                    Step::Create
                } else {
                    Step::Wait
                }
            };

            match step {
                Step::Ready(mut instance) => match instance.interpreter.reset() {
                    Ok(()) => {
                        instance.use_count += 1;
                        self.health.touch(instance.id);
                        return Ok(instance);
                    }
                    Err(e) => {
                        warn!(instance_id = instance.id, error = %e, "reset failed, destroying instance");
                        self.state.lock().in_use.remove(&instance.id);
                        self.destroy(instance);
                        self.available_notify.notify_one();
                    }
                },
                Step::Create => {
                    let created = self.create_instance();
                    let mut state = self.state.lock();
                    state.creating -= 1;
                    match created {
                        Ok(mut instance) if !state.shutting_down => {
                            state.in_use.insert(
                                instance.id,
                                Lease {
                                    completion: Arc::clone(&instance.completion),
                                },
                            );
                            drop(state);
                            instance.use_count += 1;
                            self.health.touch(instance.id);
                            debug!(instance_id = instance.id, "created instance on demand");
                            return Ok(instance);
                        }
                        Ok(instance) => {
                            drop(state);
                            self.destroy(instance);
                            return Err(SandboxError::PoolShutdown);
                        }
                        Err(e) => {
                            drop(state);
                            self.available_notify.notify_one();
                            return Err(e);
                        }
                    }
                }
                Step::Wait => {
                    if ctx.is_done() {
                        return Err(SandboxError::Cancelled(format!(
                            "waiting for instance: {}",
                            ctx.reason()
                        )));
                    }
                    tokio::select! {
                        _ = notified.as_mut() => {}
                        _ = ctx.done() => {
                            return Err(SandboxError::Cancelled(format!(
                                "waiting for instance: {}",
                                ctx.reason()
                            )));
                        }
                    }
                }
            }
        }
    }

    /// Return a leased instance.
    ///
    /// Foreign or untracked instances are destroyed. Instances scoring below the
    /// health threshold are recycled, and so are returns that would push the
    /// available queue past `max_size`.
    pub fn put(&self, mut instance: PooledInstance) {
        if instance.pool_id != self.id {
            warn!(
                instance_id = instance.id,
                pool_id = instance.pool_id,
                "instance returned to a foreign pool"
            );
            drop(instance);
            return;
        }

        instance.last_used = Instant::now();
        instance.health = self.health.score(instance.id);
        instance.interpreter.guard().disarm();

        let mut state = self.state.lock();
        if state.in_use.remove(&instance.id).is_none() {
            drop(state);
            warn!(instance_id = instance.id, "returned instance was not leased");
            self.destroy(instance);
            return;
        }

        let discard = if state.shutting_down {
            Some("pool shutting down")
        } else if instance.health < self.config.health_threshold {
            self.counters.recycled.fetch_add(1, Ordering::Relaxed);
            Some("health below threshold")
        } else if state.available.len() >= self.config.max_size {
            Some("available queue saturated")
        } else {
            None
        };

        match discard {
            Some(reason) => {
                drop(state);
                debug!(instance_id = instance.id, health = instance.health, reason, "recycling instance");
                self.destroy(instance);
            }
            None => state.available.push_back(instance),
        }
        self.available_notify.notify_one();
    }

    /// Stop tracking a leased instance whose guest call could not be stopped.
    ///
    /// The instance leaves the in-use registry without being destroyed and is
    /// never returned to the available queue. It counts against `max_size`
    /// until its call finishes.
    pub fn abandon(&self, id: u64) {
        let completion = {
            let mut state = self.state.lock();
            let Some(lease) = state.in_use.remove(&id) else {
                return;
            };
            if lease.completion.is_executing() {
                state.abandoned.insert(id, Arc::clone(&lease.completion));
            }
            lease.completion
        };
        self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
        self.health.forget(id);
        warn!(instance_id = id, "instance abandoned while executing");

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let pool = self.weak_self.clone();
            handle.spawn(async move {
                completion.wait_idle().await;
                if let Some(pool) = pool.upgrade() {
                    pool.reap_abandoned(id);
                }
            });
        }
        self.available_notify.notify_one();
    }

    fn reap_abandoned(&self, id: u64) {
        let removed = self.state.lock().abandoned.remove(&id).is_some();
        if removed {
            debug!(instance_id = id, "abandoned instance finished");
            self.available_notify.notify_one();
        }
    }

    /// Evict idle and unhealthy available instances, restore `min_size`, then
    /// resize from predicted demand when [`ScalingConfig::enabled`] is set.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let evicted: Vec<PooledInstance> = {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            state.purge_abandoned();
            let mut evicted = Vec::new();
            let mut survivors = VecDeque::with_capacity(state.available.len());
            for instance in state.available.drain(..) {
                let idle = now.saturating_duration_since(instance.last_used);
                if idle > self.config.idle_timeout
                    || self
                        .health
                        .should_recycle(instance.id, self.config.health_threshold)
                {
                    evicted.push(instance);
                } else {
                    survivors.push_back(instance);
                }
            }
            state.available = survivors;
            evicted
        };

        let cleaned = evicted.len();
        for instance in evicted {
            self.counters.cleaned_up.fetch_add(1, Ordering::Relaxed);
            self.destroy(instance);
        }

        let min_size = self.config.min_size;
        let created = self.replenish("restore pool floor", |state, _| {
            state.available.len() + state.in_use.len() + state.creating < min_size
        });

        if cleaned > 0 || created > 0 {
            self.available_notify.notify_one();
            debug!(pool_id = self.id, cleaned, created, "cleanup pass finished");
        }

        self.scale();
    }

    /// Resize from the predicted in-use ratio.
    fn scale(&self) {
        let scaling = self.config.scaling;
        if !scaling.enabled {
            return;
        }
        let (available, in_use) = {
            let state = self.state.lock();
            if state.shutting_down {
                return;
            }
            (state.available.len(), state.in_use.len())
        };
        let current = available + in_use;
        if current == 0 {
            return;
        }
        let usage = in_use as f64 / current as f64;

        let (predicted, up, down) = {
            let mut state = self.scaling.lock();
            state.record(usage, scaling.window);
            let decision = (
                predict_usage(&state.history),
                state.scale_up_threshold,
                state.scale_down_threshold,
            );
            if scaling.adaptive_thresholds {
                state.adjust_thresholds(scaling.window);
            }
            decision
        };

        if predicted > up {
            let target = (current as f64 * (1.0 + predicted - up)).ceil() as usize;
            let wanted = target.saturating_sub(current).clamp(1, scaling.max_scale_up);
            let added = self.replenish("scale up", |_, created| created < wanted);
            if added > 0 {
                self.counters.scaled_up.fetch_add(added as u64, Ordering::Relaxed);
                self.available_notify.notify_one();
                debug!(pool_id = self.id, usage, predicted, added, "scaled pool up");
            }
        } else if predicted < down && usage < down {
            let released: Vec<PooledInstance> = {
                let mut state = self.state.lock();
                let live = state.available.len() + state.in_use.len() + state.creating;
                let surplus = live
                    .saturating_sub(self.config.min_size)
                    .min(state.available.len());
                let step = (state.available.len() / 5).max(1).min(surplus);
                (0..step).filter_map(|_| state.available.pop_front()).collect()
            };
            let removed = released.len();
            for instance in released {
                self.destroy(instance);
            }
            if removed > 0 {
                self.counters
                    .scaled_down
                    .fetch_add(removed as u64, Ordering::Relaxed);
                debug!(pool_id = self.id, usage, predicted, removed, "scaled pool down");
            }
        }
    }

    /// Build instances into the available queue while `more` holds and
    /// capacity remains. Returns how many were added.
    fn replenish<F>(&self, reason: &'static str, more: F) -> usize
    where
        F: Fn(&PoolState, usize) -> bool,
    {
        let mut created = 0;
        loop {
            {
                let mut state = self.state.lock();
                if state.shutting_down
                    || state.occupied() >= self.config.max_size
                    || !more(&*state, created)
                {
                    break;
                }
                state.creating += 1;
            }
            let result = self.create_instance();
            let mut state = self.state.lock();
            state.creating -= 1;
            match result {
                Ok(instance) if !state.shutting_down => {
                    state.available.push_back(instance);
                    created += 1;
                }
                Ok(instance) => {
                    drop(state);
                    self.destroy(instance);
                    break;
                }
                Err(e) => {
                    warn!(pool_id = self.id, error = %e, reason, "failed to create instance");
                    break;
                }
            }
        }
        created
    }

    /// Stop leasing and tear the pool down.
    ///
    /// Waits up to `timeout` for leased instances to come back, destroys every
    /// available instance, then gives instances still running a guest call a
    /// short grace period. Instances still leased afterwards are reported in
    /// [`SandboxError::ShutdownTimeout`]; they are never destroyed from here.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.shutting_down {
                return Ok(());
            }
            state.shutting_down = true;
        }
        self.shutdown_token.cancel();
        if let Some(task) = self.cleanup_task.lock().take() {
            task.abort();
        }
        self.available_notify.notify_waiters();
        info!(pool_id = self.id, "shutting down interpreter pool");

        let deadline = tokio::time::Instant::now() + timeout;
        while !self.state.lock().in_use.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }

        let available: Vec<PooledInstance> = self.state.lock().available.drain(..).collect();
        for instance in available {
            self.destroy(instance);
        }

        let running: Vec<Arc<Completion>> = {
            let state = self.state.lock();
            let running = state
                .in_use
                .values()
                .map(|lease| &lease.completion)
                .chain(state.abandoned.values())
                .filter(|completion| completion.is_executing())
                .cloned()
                .collect();
            running
        };
        if !running.is_empty() {
            let grace = tokio::time::Instant::now() + SHUTDOWN_GRACE;
            for completion in running {
                if tokio::time::timeout_at(grace, completion.wait_idle())
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }

        let in_use = {
            let mut state = self.state.lock();
            state.purge_abandoned();
            state.in_use.len()
        };
        if in_use > 0 {
            warn!(pool_id = self.id, in_use, "shutdown timed out");
            return Err(SandboxError::ShutdownTimeout { in_use });
        }
        info!(pool_id = self.id, "interpreter pool shut down");
        Ok(())
    }

    /// Whether shutdown has started.
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Current pool gauges and totals.
    pub fn metrics(&self) -> PoolMetrics {
        let (available, in_use, abandoned) = {
            let state = self.state.lock();
            (
                state.available.len(),
                state.in_use.len(),
                state.abandoned.len(),
            )
        };
        PoolMetrics {
            available,
            in_use,
            abandoned,
            total_created: self.counters.created.load(Ordering::Relaxed),
            total_recycled: self.counters.recycled.load(Ordering::Relaxed),
            total_cleaned_up: self.counters.cleaned_up.load(Ordering::Relaxed),
            total_abandoned: self.counters.abandoned.load(Ordering::Relaxed),
            total_destroyed: self.counters.destroyed.load(Ordering::Relaxed),
            total_scaled_up: self.counters.scaled_up.load(Ordering::Relaxed),
            total_scaled_down: self.counters.scaled_down.load(Ordering::Relaxed),
        }
    }

    fn create_instance(&self) -> Result<PooledInstance> {
        let interpreter = self.factory.create()?;
        let id = self.next_instance_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        Ok(PooledInstance {
            id,
            pool_id: self.id,
            interpreter,
            created: now,
            last_used: now,
            use_count: 0,
            health: 1.0,
            completion: Arc::new(Completion::default()),
        })
    }

    fn destroy(&self, instance: PooledInstance) {
        self.health.forget(instance.id);
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
        debug!(instance_id = instance.id, uses = instance.use_count, "destroying instance");
        drop(instance);
    }

    fn start_cleanup_task(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pool = self.weak_self.clone();
        let token = self.shutdown_token.clone();
        let period = self.config.cleanup_interval;
        let task = handle.spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => match pool.upgrade() {
                        Some(pool) => pool.cleanup(),
                        None => break,
                    },
                }
            }
        });
        *self.cleanup_task.lock() = Some(task);
    }
}

impl Drop for InterpreterPool {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}
