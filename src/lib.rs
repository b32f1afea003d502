//! # Lua Sandbox
//!
//! Pooled, sandboxed execution of short Lua 5.4 scripts inside a host process.
//!
//! This crate keeps a bounded pool of interpreter instances, each restricted
//! once at creation by a layered security policy, and runs scripts through a
//! pipeline that caches compiled bytecode and enforces per-call deadlines:
//!
//! - **Capability restriction**: per-level library tables, stripped functions,
//!   global allow-lists, a protected string metatable and a module-load gate
//! - **Resource limits**: heap limit, instruction count, stack depth and wall time
//! - **Bytecode caching**: content-addressed LRU with a time-to-live
//! - **Health-based recycling**: instances that fail or grow are replaced
//! - **Abandonment**: a call that outlives its deadline gives up its instance
//!   rather than reusing interpreter state that may still be mid-call
//!
//! ## Example
//!
//! ```rust,no_run
//! use lua_sandbox_rs::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = SandboxConfig::builder()
//!         .security_level(SecurityLevel::Strict)
//!         .timeout(Duration::from_secs(5))
//!         .max_memory(16 * 1024 * 1024)
//!         .build();
//!
//!     let sandbox = LuaSandbox::new(config)?;
//!     let request = ScriptRequest::new("return x * 2").param("x", 21);
//!     let value = sandbox.execute_request(&CallContext::new(), request).await?;
//!
//!     assert_eq!(value, serde_json::json!(42));
//!     sandbox.shutdown(Duration::from_secs(1)).await
//! }
//! ```
//!
//! ## Security Model
//!
//! Restrictions are applied in order to every fresh instance:
//!
//! 1. **Library loading**: only the level's libraries; `debug` never
//! 2. **Function stripping**: process, environment and file mutation calls
//! 3. **Stand-ins**: `dofile`, `loadfile` and `collectgarbage` raise errors
//! 4. **Global filtering**: anything not allow-listed is removed
//! 5. **Metatable protection**: the string metatable is hidden
//! 6. **Module gate**: `require` is disabled, allow-listed or deny-listed

pub mod error;
pub mod prelude;
pub mod sandbox;

// Re-export main types at crate root for convenience
pub use error::{ErrorKind, Result, SandboxError};
pub use sandbox::cache::{generate_key, Bytecode, BytecodeCache, CacheConfig, CacheStats};
pub use sandbox::config::{SandboxConfig, SandboxConfigBuilder};
pub use sandbox::context::CallContext;
pub use sandbox::convert::{HostValue, JsonConverter, TypeConverter};
pub use sandbox::executor::{LuaSandbox, SandboxOptions};
pub use sandbox::factory::{Interpreter, InterpreterFactory};
pub use sandbox::health::{HealthMetrics, HealthMonitor, HealthStatistics};
pub use sandbox::limits::{ExecutionGuard, ResourceLimits};
pub use sandbox::metrics::{EngineMetrics, PipelineMetrics, PipelineSnapshot};
pub use sandbox::modules::{ModuleLoader, ModuleRegistry, NoModules};
pub use sandbox::pipeline::{ExecutionPipeline, ExecutionReport, PipelineConfig, ScriptRequest};
pub use sandbox::pool::{InterpreterPool, PoolConfig, PoolMetrics, PooledInstance, ScalingConfig};
pub use sandbox::security::{Capability, SecurityConfig, SecurityEnforcer, SecurityLevel};
