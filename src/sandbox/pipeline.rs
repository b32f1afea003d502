//! Per-call orchestration: lease, prepare, compile or reuse, run under a
//! deadline, extract, release.
//!
//! The guest call runs on a blocking worker while the calling task races it
//! against the call's [`CallContext`]. When the context wins, the instance is
//! abandoned: it stays with the worker until the call finishes and is never
//! handed back to the pool.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mlua::{ChunkMode, Lua, LuaOptions, MultiValue, StdLib, Value};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::error::{ErrorKind, Result, SandboxError};
use crate::sandbox::cache::{generate_key, Bytecode, BytecodeCache};
use crate::sandbox::context::CallContext;
use crate::sandbox::convert::{HostValue, JsonConverter, TypeConverter};
use crate::sandbox::metrics::{PipelineMetrics, PipelineSnapshot};
use crate::sandbox::modules::{ModuleLoader, NoModules};
use crate::sandbox::pool::{InterpreterPool, PooledInstance};

/// Pipeline settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Upper bound on one call, from lease to release.
    pub call_timeout: Duration,
}

impl PipelineConfig {
    /// Default per-call timeout.
    pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

    /// Reject a zero timeout.
    pub fn validate(&self) -> Result<()> {
        if self.call_timeout.is_zero() {
            return Err(SandboxError::Config(
                "call_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            call_timeout: Self::DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// A script plus the globals it should see.
///
/// Deserializes from `{"script": ..., "filename": ..., "params": {...}}`;
/// only `script` is required.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScriptRequest {
    script: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    params: BTreeMap<String, HostValue>,
}

impl ScriptRequest {
    /// A request for `script` with no filename and no parameters.
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            ..Default::default()
        }
    }

    /// Name the script; shows up in error messages and in the cache key.
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    /// Bind `value` to the global `name`.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<HostValue>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Bind every entry of `params`.
    pub fn params<I, K>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, HostValue)>,
        K: Into<String>,
    {
        self.params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v)));
        self
    }

    /// The script text.
    pub fn script(&self) -> &str {
        &self.script
    }

    /// The script's filename, possibly empty.
    pub fn name(&self) -> &str {
        &self.filename
    }

    fn chunk_name(&self) -> String {
        if self.filename.is_empty() {
            "=script".to_string()
        } else {
            format!("={}", self.filename)
        }
    }
}

/// What one successful call produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    /// The script's last return value, converted to a host value.
    pub value: HostValue,
    /// Everything the script printed.
    pub output: String,
    /// Whether compilation was skipped.
    pub cache_hit: bool,
    /// Time spent compiling; zero on a hit.
    pub compile_time: Duration,
    /// Time spent running guest code.
    pub exec_time: Duration,
    /// Wall time from lease request to release.
    pub total_time: Duration,
    /// The instance the call ran on.
    pub instance_id: u64,
    /// The instance's heap size after the call.
    pub memory_used: usize,
    /// The highest heap size sampled while the call ran.
    pub peak_memory: usize,
}

/// Per-call bookkeeping.
#[derive(Debug)]
struct ExecutionContext {
    context: CallContext,
    key: String,
    instance_id: u64,
    started: Instant,
    cache_hit: bool,
    compile_time: Duration,
}

/// Ties pool, cache and converter together for each call.
#[derive(Clone)]
pub struct ExecutionPipeline {
    pool: Arc<InterpreterPool>,
    cache: Arc<BytecodeCache>,
    converter: Arc<dyn TypeConverter>,
    modules: Arc<dyn ModuleLoader>,
    metrics: Arc<PipelineMetrics>,
    config: PipelineConfig,
}

impl fmt::Debug for ExecutionPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionPipeline")
            .field("pool", &self.pool)
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish()
    }
}

impl ExecutionPipeline {
    /// A pipeline using [`JsonConverter`] and no host modules.
    pub fn new(
        pool: Arc<InterpreterPool>,
        cache: Arc<BytecodeCache>,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pool,
            cache,
            converter: Arc::new(JsonConverter::default()),
            modules: Arc::new(NoModules),
            metrics: Arc::new(PipelineMetrics::new()),
            config,
        })
    }

    /// Replace the type converter.
    pub fn with_converter(mut self, converter: Arc<dyn TypeConverter>) -> Self {
        self.converter = converter;
        self
    }

    /// Replace the module loader.
    pub fn with_modules(mut self, modules: Arc<dyn ModuleLoader>) -> Self {
        self.modules = modules;
        self
    }

    /// The pool calls lease from.
    pub fn pool(&self) -> &Arc<InterpreterPool> {
        &self.pool
    }

    /// The shared bytecode cache.
    pub fn cache(&self) -> &Arc<BytecodeCache> {
        &self.cache
    }

    /// Current pipeline counters.
    pub fn metrics(&self) -> PipelineSnapshot {
        self.metrics.snapshot()
    }

    /// Run one request and return its converted result.
    pub async fn execute(&self, ctx: &CallContext, request: ScriptRequest) -> Result<HostValue> {
        self.execute_detailed(ctx, request)
            .await
            .map(|report| report.value)
    }

    /// Run one request and return the full report.
    ///
    /// # Arguments
    ///
    /// * `ctx` - The caller's cancellation signal. The pipeline's call timeout
    ///   is layered on top, and whichever ends first bounds both the wait for
    ///   an instance and the guest call.
    /// * `request` - Script text, chunk name and parameters bound as globals.
    ///
    /// # Returns
    ///
    /// The converted last return value with captured output, timings, cache
    /// outcome and memory figures. A call cut off mid-execution fails with
    /// [`SandboxError::Timeout`] and its instance is abandoned, never reused.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let request = ScriptRequest::new("print('hi') return n * 2").param("n", 21);
    /// let report = pipeline.execute_detailed(&CallContext::new(), request).await?;
    /// assert_eq!(report.value, serde_json::json!(42));
    /// assert_eq!(report.output, "hi\n");
    /// ```
    pub async fn execute_detailed(
        &self,
        ctx: &CallContext,
        request: ScriptRequest,
    ) -> Result<ExecutionReport> {
        self.metrics.record_call();
        let result = self.run(ctx, request).await;
        if let Err(e) = &result {
            self.metrics.record_error();
            debug!(error = %e, "script call failed");
        }
        result
    }

    /// Run every request concurrently; results keep the input order.
    pub async fn batch_execute(
        &self,
        ctx: &CallContext,
        requests: Vec<ScriptRequest>,
    ) -> Vec<Result<HostValue>> {
        let count = requests.len();
        let mut set = JoinSet::new();
        for (index, request) in requests.into_iter().enumerate() {
            let pipeline = self.clone();
            let ctx = ctx.clone();
            set.spawn(async move { (index, pipeline.execute(&ctx, request).await) });
        }

        let mut results: Vec<Option<Result<HostValue>>> = (0..count).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => warn!(error = %e, "batch task failed"),
            }
        }
        results
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Err(SandboxError::Runtime("panic during execution".to_string()))
                })
            })
            .collect()
    }

    /// Compile `script` without running it.
    pub fn validate(&self, script: &str, filename: &str) -> Result<()> {
        let lua = Lua::new_with(StdLib::NONE, LuaOptions::new())
            .map_err(|e| SandboxError::Creation(anyhow::anyhow!("{}", e)))?;
        let request = ScriptRequest::new(script).filename(filename);
        lua.load(request.script())
            .set_name(request.chunk_name())
            .into_function()
            .map(|_| ())
            .map_err(|e| SandboxError::from_lua(e, ErrorKind::Syntax))
    }

    async fn run(&self, ctx: &CallContext, request: ScriptRequest) -> Result<ExecutionReport> {
        let started = Instant::now();
        let context = ctx.clone().with_timeout(self.config.call_timeout);

        let instance = self.pool.get(&context).await?;
        instance.interpreter().guard().arm(context.clone());

        let mut call = ExecutionContext {
            context,
            key: generate_key(request.script(), request.name()),
            instance_id: instance.id(),
            started,
            cache_hit: false,
            compile_time: Duration::ZERO,
        };

        let bytecode = match self.prepare(&instance, &request, &mut call) {
            Ok(bytecode) => bytecode,
            Err(e) => {
                self.pool.put(instance);
                return Err(e);
            }
        };

        if call.context.is_done() {
            self.pool.put(instance);
            return Err(SandboxError::Cancelled(format!(
                "before execution: {}",
                call.context.reason()
            )));
        }

        self.run_guest(instance, bytecode, call).await
    }

    /// Load modules, inject parameters and resolve bytecode. No guest code runs.
    fn prepare(
        &self,
        instance: &PooledInstance,
        request: &ScriptRequest,
        call: &mut ExecutionContext,
    ) -> Result<Arc<Bytecode>> {
        let lua = instance.lua();
        self.modules.load_modules(lua)?;

        let globals = lua.globals();
        for (name, value) in &request.params {
            let guest = self.converter.to_guest(lua, value)?;
            globals.raw_set(name.as_str(), guest).map_err(|e| {
                SandboxError::Conversion(format!("failed to bind parameter '{name}': {e}"))
            })?;
        }

        if let Some(bytecode) = self.cache.get(&call.key) {
            self.metrics.record_cache_hit();
            call.cache_hit = true;
            trace!(key = %call.key, "bytecode cache hit");
            return Ok(bytecode);
        }

        let compile_started = Instant::now();
        let chunk_name = request.chunk_name();
        let function = lua
            .load(request.script())
            .set_name(chunk_name.as_str())
            .into_function()
            .map_err(|e| SandboxError::from_lua(e, ErrorKind::Syntax))?;
        let bytecode = Arc::new(Bytecode::new(function.dump(false), chunk_name));
        call.compile_time = compile_started.elapsed();
        self.metrics.record_cache_miss(call.compile_time);
        self.cache.put(call.key.clone(), Arc::clone(&bytecode));
        trace!(key = %call.key, bytes = bytecode.len(), "compiled and cached");
        Ok(bytecode)
    }

    async fn run_guest(
        &self,
        instance: PooledInstance,
        bytecode: Arc<Bytecode>,
        call: ExecutionContext,
    ) -> Result<ExecutionReport> {
        let id = call.instance_id;
        let converter = Arc::clone(&self.converter);
        let running = instance.completion().start();
        let exec_started = Instant::now();

        let mut handle = tokio::task::spawn_blocking(move || {
            let _running = running;
            let result = call_chunk(instance.lua(), &bytecode, converter.as_ref());
            (result, instance)
        });

        let joined = tokio::select! {
            biased;
            joined = &mut handle => Some(joined),
            _ = call.context.done() => None,
        };
        let exec_time = exec_started.elapsed();
        self.metrics.record_exec_time(exec_time);

        let (result, instance) = match joined {
            None => return Err(self.abandon(id, exec_time)),
            Some(Err(e)) => {
                warn!(instance_id = id, error = %e, "guest call panicked");
                self.pool.abandon(id);
                return Err(SandboxError::Runtime("panic during execution".to_string()));
            }
            Some(Ok((Err(_), instance))) if call.context.is_done() => {
                // The hook stopped the script because the context ended first.
                let err = self.abandon(id, exec_time);
                drop(instance);
                return Err(err);
            }
            Some(Ok(finished)) => finished,
        };

        let memory_used = instance.interpreter().used_memory();
        let guard = instance.interpreter().guard();
        guard.observe_memory(memory_used);
        let peak_memory = guard.peak_memory();
        self.metrics.record_memory(memory_used, peak_memory);
        let health = self.pool.health();
        health.update_memory_usage(id, memory_used);
        health.record_execution(id, exec_time, result.is_err());

        let output = instance.interpreter().output().take();
        self.pool.put(instance);

        let value = result?;
        Ok(ExecutionReport {
            value,
            output,
            cache_hit: call.cache_hit,
            compile_time: call.compile_time,
            exec_time,
            total_time: call.started.elapsed(),
            instance_id: id,
            memory_used,
            peak_memory,
        })
    }

    fn abandon(&self, id: u64, elapsed: Duration) -> SandboxError {
        self.metrics.record_timeout();
        self.pool.abandon(id);
        SandboxError::Timeout(elapsed)
    }
}

/// Load `bytecode` into `lua`, run it, and convert its last return value.
fn call_chunk(lua: &Lua, bytecode: &Bytecode, converter: &dyn TypeConverter) -> Result<HostValue> {
    let function = lua
        .load(bytecode.as_bytes())
        .set_name(bytecode.chunk_name())
        .set_mode(ChunkMode::Binary)
        .into_function()
        .map_err(|e| SandboxError::from_lua(e, ErrorKind::Runtime))?;
    let values: MultiValue = function
        .call(())
        .map_err(|e| SandboxError::from_lua(e, ErrorKind::Runtime))?;
    let top = values.into_iter().last().unwrap_or(Value::Nil);
    converter.from_guest(&top)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::cache::CacheConfig;
    use crate::sandbox::factory::InterpreterFactory;
    use crate::sandbox::pool::PoolConfig;
    use crate::sandbox::security::{SecurityConfig, SecurityEnforcer, SecurityLevel};
    use serde_json::json;

    fn pipeline(max_size: usize, call_timeout: Duration) -> ExecutionPipeline {
        let enforcer = SecurityEnforcer::new(&SecurityConfig::new(SecurityLevel::Standard)).unwrap();
        let factory = InterpreterFactory::new(Arc::new(enforcer));
        let pool = InterpreterPool::new(
            PoolConfig {
                min_size: 1,
                max_size,
                ..PoolConfig::default()
            },
            factory,
        )
        .unwrap();
        let cache = Arc::new(BytecodeCache::new(CacheConfig::default()));
        ExecutionPipeline::new(pool, cache, PipelineConfig { call_timeout }).unwrap()
    }

    #[tokio::test]
    async fn test_returns_last_value_and_output() {
        let pipeline = pipeline(2, Duration::from_secs(5));
        let report = pipeline
            .execute_detailed(
                &CallContext::new(),
                ScriptRequest::new("print('hi', n) return 1, n * 2").param("n", 21),
            )
            .await
            .unwrap();
        assert_eq!(report.value, json!(42));
        assert_eq!(report.output, "hi\t21\n");
        assert!(!report.cache_hit);
    }

    #[tokio::test]
    async fn test_report_carries_peak_memory() {
        let pipeline = pipeline(1, Duration::from_secs(5));
        let report = pipeline
            .execute_detailed(
                &CallContext::new(),
                ScriptRequest::new(
                    "local t = {} for i = 1, 20000 do t[i] = tostring(i) end t = nil return 1",
                ),
            )
            .await
            .unwrap();
        assert!(report.memory_used > 0);
        assert!(report.peak_memory >= report.memory_used);
        assert!(pipeline.metrics().memory_peak >= report.peak_memory);
    }

    #[tokio::test]
    async fn test_runtime_error_releases_instance() {
        let pipeline = pipeline(1, Duration::from_secs(5));
        let err = pipeline
            .execute(&CallContext::new(), ScriptRequest::new("error('boom')"))
            .await
            .unwrap_err();
        assert!(err.is_runtime());
        assert!(err.to_string().contains("boom"));

        let metrics = pipeline.pool().metrics();
        assert_eq!(metrics.in_use, 0);
        assert_eq!(metrics.total_abandoned, 0);
        assert_eq!(pipeline.metrics().errors, 1);
    }

    #[tokio::test]
    async fn test_conversion_error_aborts_before_execution() {
        let pipeline = pipeline(1, Duration::from_secs(5));
        let nested = (0..40).fold(json!(1), |acc, _| json!([acc]));
        let err = pipeline
            .execute(
                &CallContext::new(),
                ScriptRequest::new("ran = true").param("deep", nested),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Conversion(_)));
        assert_eq!(pipeline.metrics().cache_misses, 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_acquire() {
        let pipeline = pipeline(1, Duration::from_secs(5));
        let held = pipeline.pool().get(&CallContext::new()).await.unwrap();

        let ctx = CallContext::new();
        ctx.cancel();
        let err = pipeline
            .execute(&ctx, ScriptRequest::new("return 1"))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        pipeline.pool().put(held);
    }

    #[tokio::test]
    async fn test_unreturnable_value_is_conversion_error() {
        let pipeline = pipeline(1, Duration::from_secs(5));
        let err = pipeline
            .execute(&CallContext::new(), ScriptRequest::new("return function() end"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Conversion(_)));
        assert_eq!(pipeline.pool().metrics().in_use, 0);
    }

    #[test]
    fn test_request_from_json() {
        let request: ScriptRequest = serde_json::from_value(json!({
            "script": "return n + 1",
            "params": { "n": 1 }
        }))
        .unwrap();
        assert_eq!(request, ScriptRequest::new("return n + 1").param("n", 1));
        assert_eq!(request.chunk_name(), "=script");
        assert!(serde_json::from_value::<ScriptRequest>(json!({ "filename": "x.lua" })).is_err());
    }

    #[test]
    fn test_validate() {
        let pipeline = pipeline(1, Duration::from_secs(5));
        assert!(pipeline.validate("return 1", "ok.lua").is_ok());
        match pipeline.validate("return +", "bad.lua").unwrap_err() {
            SandboxError::Syntax { chunk, line, .. } => {
                assert_eq!(chunk, "bad.lua");
                assert_eq!(line, Some(1));
            }
            other => panic!("expected syntax error, got {other:?}"),
        }
    }
}
