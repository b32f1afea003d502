//! Engine facade tying the sandbox components together.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use mlua::Lua;
use tracing::info;

use crate::error::Result;
use crate::sandbox::cache::BytecodeCache;
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::context::CallContext;
use crate::sandbox::convert::{HostValue, JsonConverter, TypeConverter};
use crate::sandbox::factory::InterpreterFactory;
use crate::sandbox::health::HealthMonitor;
use crate::sandbox::metrics::EngineMetrics;
use crate::sandbox::modules::{ModuleLoader, NoModules};
use crate::sandbox::pipeline::{ExecutionPipeline, ExecutionReport, ScriptRequest};
use crate::sandbox::pool::InterpreterPool;
use crate::sandbox::security::SecurityEnforcer;

/// Collaborators plugged into a [`LuaSandbox`].
#[derive(Clone, Default)]
pub struct SandboxOptions {
    modules: Option<Arc<dyn ModuleLoader>>,
    converter: Option<Arc<dyn TypeConverter>>,
    warmup: Option<Arc<dyn Fn(&Lua) -> mlua::Result<()> + Send + Sync>>,
}

impl fmt::Debug for SandboxOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxOptions")
            .field("modules", &self.modules.is_some())
            .field("converter", &self.converter.is_some())
            .field("warmup", &self.warmup.is_some())
            .finish()
    }
}

impl SandboxOptions {
    /// Default options: JSON conversion, no host modules, no warmup.
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose host modules to every call.
    pub fn modules(mut self, modules: impl ModuleLoader + 'static) -> Self {
        self.modules = Some(Arc::new(modules));
        self
    }

    /// Replace the JSON converter.
    pub fn converter(mut self, converter: impl TypeConverter + 'static) -> Self {
        self.converter = Some(Arc::new(converter));
        self
    }

    /// Run `hook` in every fresh instance after the init script.
    pub fn warmup<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Lua) -> mlua::Result<()> + Send + Sync + 'static,
    {
        self.warmup = Some(Arc::new(hook));
        self
    }
}

/// A pooled, sandboxed Lua execution engine.
///
/// Building one resolves the security configuration, pre-populates the pool
/// and wires the bytecode cache into the execution pipeline. Must be created
/// inside a tokio runtime for the background cleanup task to run.
pub struct LuaSandbox {
    config: SandboxConfig,
    pipeline: ExecutionPipeline,
}

impl fmt::Debug for LuaSandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LuaSandbox")
            .field("config", &self.config)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

impl LuaSandbox {
    /// Create a new Lua sandbox with the given configuration.
    pub fn new(config: SandboxConfig) -> Result<Self> {
        Self::new_with_options(config, SandboxOptions::default())
    }

    /// Create a sandbox with custom collaborators.
    pub fn new_with_options(config: SandboxConfig, options: SandboxOptions) -> Result<Self> {
        config.validate()?;

        let enforcer = Arc::new(SecurityEnforcer::new(&config.security)?);
        let mut factory =
            InterpreterFactory::new(enforcer).with_output_limit(config.output_limit);
        if let Some(script) = &config.init_script {
            factory = factory.with_init_script(script.as_str());
        }
        if let Some(warmup) = options.warmup {
            factory = factory.with_warmup(move |lua| warmup(lua));
        }

        let pool = InterpreterPool::with_health(
            config.pool,
            factory,
            Arc::new(HealthMonitor::new()),
        )?;
        let cache = Arc::new(BytecodeCache::new(config.cache));

        let converter = options
            .converter
            .unwrap_or_else(|| Arc::new(JsonConverter::new(config.max_conversion_depth)));
        let modules = options.modules.unwrap_or_else(|| Arc::new(NoModules));
        let pipeline = ExecutionPipeline::new(pool, cache, config.pipeline())?
            .with_converter(converter)
            .with_modules(modules);

        info!(
            level = %config.security.level,
            max_size = config.pool.max_size,
            "lua sandbox ready"
        );
        Ok(Self { config, pipeline })
    }

    /// The configuration the sandbox was built from.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// The underlying pipeline.
    pub fn pipeline(&self) -> &ExecutionPipeline {
        &self.pipeline
    }

    /// Execute `script` with no parameters.
    pub async fn execute(&self, script: &str) -> Result<HostValue> {
        self.pipeline
            .execute(&CallContext::new(), ScriptRequest::new(script))
            .await
    }

    /// Execute a request under the caller's context.
    pub async fn execute_request(
        &self,
        ctx: &CallContext,
        request: ScriptRequest,
    ) -> Result<HostValue> {
        self.pipeline.execute(ctx, request).await
    }

    /// Execute a request and return timings, output and cache status.
    pub async fn execute_detailed(
        &self,
        ctx: &CallContext,
        request: ScriptRequest,
    ) -> Result<ExecutionReport> {
        self.pipeline.execute_detailed(ctx, request).await
    }

    /// Execute every request concurrently; results keep the input order.
    pub async fn batch_execute(&self, requests: Vec<ScriptRequest>) -> Vec<Result<HostValue>> {
        self.pipeline
            .batch_execute(&CallContext::new(), requests)
            .await
    }

    /// Check that `script` compiles.
    pub fn validate(&self, script: &str) -> Result<()> {
        self.pipeline.validate(script, "")
    }

    /// Pool, pipeline, cache and health figures.
    pub fn metrics(&self) -> EngineMetrics {
        let pool = self.pipeline.pool();
        EngineMetrics {
            pool: pool.metrics(),
            pipeline: self.pipeline.metrics(),
            cache: self.pipeline.cache().stats(),
            health: pool.health().statistics(),
        }
    }

    /// Stop leasing and tear the pool down within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.pipeline.pool().shutdown(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SandboxError;
    use crate::sandbox::modules::ModuleRegistry;
    use crate::sandbox::security::SecurityLevel;
    use serde_json::json;

    fn test_config() -> SandboxConfig {
        SandboxConfig::builder()
            .timeout(Duration::from_secs(5))
            .max_size(2)
            .build()
    }

    #[tokio::test]
    async fn test_simple_execution() {
        let sandbox = LuaSandbox::new(test_config()).unwrap();
        let value = sandbox.execute("return 1 + 1").await.unwrap();
        assert_eq!(value, json!(2));
    }

    #[tokio::test]
    async fn test_timeout() {
        let config = SandboxConfig::builder()
            .timeout(Duration::from_millis(100))
            .max_instructions(0)
            .build();

        let sandbox = LuaSandbox::new(config).unwrap();
        let result = sandbox.execute("while true do end").await;

        assert!(matches!(result, Err(SandboxError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_options_are_wired() {
        let options = SandboxOptions::new()
            .warmup(|lua| lua.globals().set("base", 10))
            .modules(ModuleRegistry::new().register("util", |lua| {
                let module = lua.create_table()?;
                module.set("double", lua.create_function(|_, n: i64| Ok(n * 2))?)?;
                Ok(module)
            }));
        let config = SandboxConfig::builder()
            .security_level(SecurityLevel::Standard)
            .init_script("offset = 1")
            .build();
        let sandbox = LuaSandbox::new_with_options(config, options).unwrap();

        let value = sandbox
            .execute("return require('util').double(base) + offset")
            .await
            .unwrap();
        assert_eq!(value, json!(21));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = SandboxConfig::builder().min_size(3).max_size(1).build();
        assert!(matches!(
            LuaSandbox::new(config),
            Err(SandboxError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_metrics_and_shutdown() {
        let sandbox = LuaSandbox::new(test_config()).unwrap();
        sandbox.execute("return 'x'").await.unwrap();
        assert!(sandbox.validate("return (").is_err());

        let metrics = sandbox.metrics();
        assert_eq!(metrics.pipeline.calls_executed, 1);
        assert_eq!(metrics.cache.size, 1);
        assert_eq!(metrics.pool.in_use, 0);

        let report = serde_json::to_value(metrics).unwrap();
        assert_eq!(report["pipeline"]["calls_executed"], json!(1));
        assert_eq!(report["pool"]["in_use"], json!(0));

        sandbox.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            sandbox.execute("return 1").await,
            Err(SandboxError::PoolShutdown)
        ));
    }
}
