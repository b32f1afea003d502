//! Construction and per-lease reset of sandboxed interpreters.

use std::fmt;
use std::sync::Arc;

use mlua::{Lua, LuaOptions, StdLib, Table, Value};
use tracing::debug;

use crate::error::{Result, SandboxError};
use crate::sandbox::context::CallContext;
use crate::sandbox::io::{CapturedOutput, DEFAULT_OUTPUT_LIMIT};
use crate::sandbox::limits::{watch_thread, ExecutionGuard};
use crate::sandbox::security::SecurityEnforcer;

const BASELINE_MEMBERS: &str = "lua_sandbox.baseline_members";
const BASELINE_METATABLES: &str = "lua_sandbox.baseline_metatables";
/// Tables up to this many hops from `_G` are restored on reset; two hops
/// reach `package.loaded` and `package.preload`.
const BASELINE_DEPTH: usize = 2;

/// A hook run against every fresh interpreter after the init script.
pub type WarmupHook = Arc<dyn Fn(&Lua) -> mlua::Result<()> + Send + Sync>;

/// One sandboxed interpreter with its guard and output buffer.
pub struct Interpreter {
    lua: Lua,
    guard: Arc<ExecutionGuard>,
    output: CapturedOutput,
}

impl fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("used_memory", &self.lua.used_memory())
            .field("guard", &self.guard)
            .finish()
    }
}

impl Interpreter {
    /// The underlying Lua state.
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// The guard polled by the instruction hook.
    pub fn guard(&self) -> &Arc<ExecutionGuard> {
        &self.guard
    }

    /// Output captured from `print` since the last reset.
    pub fn output(&self) -> &CapturedOutput {
        &self.output
    }

    /// Current heap size in bytes.
    pub fn used_memory(&self) -> usize {
        self.lua.used_memory()
    }

    /// Record the current heap as the global state every lease starts from.
    fn snapshot_baseline(&self) -> mlua::Result<()> {
        let members = self.lua.create_table()?;
        let metatables = self.lua.create_table()?;
        let mut frontier = vec![self.lua.globals()];
        for depth in 0..=BASELINE_DEPTH {
            let mut next = Vec::new();
            for table in frontier {
                if members.contains_key(table.clone())? {
                    continue;
                }
                members.raw_set(table.clone(), shallow_copy(&self.lua, &table)?)?;
                let metatable = table.metatable().map_or(Value::Boolean(false), Value::Table);
                metatables.raw_set(table.clone(), metatable)?;
                if depth < BASELINE_DEPTH {
                    for pair in table.pairs::<Value, Value>() {
                        if let (_, Value::Table(child)) = pair? {
                            next.push(child);
                        }
                    }
                }
            }
            frontier = next;
        }
        self.lua.set_named_registry_value(BASELINE_MEMBERS, members)?;
        self.lua.set_named_registry_value(BASELINE_METATABLES, metatables)?;
        Ok(())
    }

    /// Strip bindings left by the previous lease.
    ///
    /// Every table reachable from the globals within two hops (library tables,
    /// `package.loaded`, `package.preload`) gets its original members and
    /// metatable back. Captured output is discarded and the hook is pointed
    /// back at the main thread.
    pub fn reset(&self) -> Result<()> {
        self.guard.disarm();
        self.output.clear();
        watch_thread(&self.lua.current_thread(), Arc::clone(&self.guard));
        self.restore_baseline()
            .map_err(|e| SandboxError::Runtime(format!("failed to reset interpreter: {e}")))
    }

    fn restore_baseline(&self) -> mlua::Result<()> {
        let members: Table = self.lua.named_registry_value(BASELINE_MEMBERS)?;
        let metatables: Table = self.lua.named_registry_value(BASELINE_METATABLES)?;

        for pair in members.pairs::<Table, Table>() {
            let (table, baseline) = pair?;
            let metatable = match metatables.raw_get::<Value>(table.clone())? {
                Value::Table(metatable) => Some(metatable),
                _ => None,
            };
            table.set_metatable(metatable);
            restore_table(&table, &baseline)?;
        }
        Ok(())
    }
}

/// Builds correctly sandboxed interpreters.
///
/// Each call to [`InterpreterFactory::create`] allocates a raw state, applies the
/// sandbox, runs the optional init script and warmup hook, and snapshots the
/// resulting globals. Any failure drops the partial state.
#[derive(Clone)]
pub struct InterpreterFactory {
    enforcer: Arc<SecurityEnforcer>,
    init_script: Option<Arc<str>>,
    warmup: Option<WarmupHook>,
    output_limit: usize,
}

impl fmt::Debug for InterpreterFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterpreterFactory")
            .field("level", &self.enforcer.level())
            .field("init_script", &self.init_script.is_some())
            .field("warmup", &self.warmup.is_some())
            .field("output_limit", &self.output_limit)
            .finish()
    }
}

impl InterpreterFactory {
    /// A factory applying `enforcer` to every instance.
    pub fn new(enforcer: Arc<SecurityEnforcer>) -> Self {
        Self {
            enforcer,
            init_script: None,
            warmup: None,
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    /// Run `script` in every fresh instance after sandboxing.
    pub fn with_init_script(mut self, script: impl Into<Arc<str>>) -> Self {
        self.init_script = Some(script.into());
        self
    }

    /// Run `hook` in every fresh instance after the init script.
    pub fn with_warmup<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Lua) -> mlua::Result<()> + Send + Sync + 'static,
    {
        self.warmup = Some(Arc::new(hook));
        self
    }

    /// Bound the per-lease `print` buffer.
    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    /// The enforcer applied to every instance.
    pub fn enforcer(&self) -> &Arc<SecurityEnforcer> {
        &self.enforcer
    }

    /// Build one sandboxed instance.
    pub fn create(&self) -> Result<Interpreter> {
        // SAFETY: unsafe mode is needed to load cached binary chunks. Guest code
        // never gets the debug library, `string.dump` or a binary-capable `load`.
        let lua = unsafe { Lua::unsafe_new_with(StdLib::NONE, LuaOptions::new()) };
        let limits = *self.enforcer.limits();
        let guard = Arc::new(ExecutionGuard::new(limits));
        let output = CapturedOutput::with_limit(self.output_limit);

        self.enforcer
            .apply_sandbox(&lua, Arc::clone(&guard), &output)?;

        let interpreter = Interpreter { lua, guard, output };

        if self.init_script.is_some() || self.warmup.is_some() {
            let mut context = CallContext::new();
            if !limits.max_duration.is_zero() {
                context = context.with_timeout(limits.max_duration);
            }
            interpreter.guard.arm(context);
            let result = self.initialize(&interpreter);
            interpreter.guard.disarm();
            result?;
        }

        interpreter.snapshot_baseline().map_err(|e| {
            SandboxError::Creation(anyhow::anyhow!("failed to snapshot globals: {}", e))
        })?;
        interpreter.output.clear();

        debug!(
            level = %self.enforcer.level(),
            memory = interpreter.used_memory(),
            "interpreter created"
        );
        Ok(interpreter)
    }

    fn initialize(&self, interpreter: &Interpreter) -> Result<()> {
        if let Some(script) = &self.init_script {
            interpreter
                .lua
                .load(script.as_ref())
                .set_name("=init")
                .exec()
                .map_err(|e| SandboxError::Creation(anyhow::anyhow!("init script failed: {}", e)))?;
        }
        if let Some(warmup) = &self.warmup {
            warmup(&interpreter.lua)
                .map_err(|e| SandboxError::Creation(anyhow::anyhow!("warmup failed: {}", e)))?;
        }
        Ok(())
    }
}
