//! Resource limiting for sandboxed interpreters.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mlua::{Function, HookTriggers, Lua, Table, Thread, Value, VmState};
use parking_lot::Mutex;

use crate::error::{Result, SandboxError};
use crate::sandbox::context::CallContext;

/// Execution resource limits applied to every instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum VM instructions per call; `0` disables the check.
    pub max_instructions: u64,
    /// Maximum interpreter heap in bytes; `0` disables the limit.
    pub max_memory: usize,
    /// Maximum wall time per call; zero disables the check.
    pub max_duration: Duration,
    /// Maximum call stack depth; `0` disables the check.
    pub max_stack_depth: usize,
    /// How often, in VM instructions, the limits are checked.
    pub check_interval: u32,
}

impl ResourceLimits {
    /// Generous limits for trusted scripts.
    pub const fn minimal() -> Self {
        Self {
            max_instructions: 100_000_000,
            max_memory: 100 * 1024 * 1024,
            max_duration: Duration::from_secs(5 * 60),
            max_stack_depth: 1000,
            check_interval: 10_000,
        }
    }

    /// Limits for semi-trusted scripts.
    pub const fn standard() -> Self {
        Self {
            max_instructions: 10_000_000,
            max_memory: 50 * 1024 * 1024,
            max_duration: Duration::from_secs(30),
            max_stack_depth: 500,
            check_interval: 5_000,
        }
    }

    /// Aggressive limits for untrusted scripts.
    pub const fn strict() -> Self {
        Self {
            max_instructions: 1_000_000,
            max_memory: 10 * 1024 * 1024,
            max_duration: Duration::from_secs(5),
            max_stack_depth: 100,
            check_interval: 1_000,
        }
    }

    /// Reject limits that cannot be enforced sensibly.
    pub fn validate(&self) -> Result<()> {
        if self.max_stack_depth == 0 {
            return Err(SandboxError::Config(
                "max_stack_depth must be positive".to_string(),
            ));
        }
        if self.check_interval == 0 {
            return Err(SandboxError::Config(
                "check_interval must be positive".to_string(),
            ));
        }
        if self.max_memory > 0 && self.max_memory < 1024 * 1024 {
            return Err(SandboxError::Config(format!(
                "max_memory too low (< 1MB): {} bytes",
                self.max_memory
            )));
        }
        if !self.max_duration.is_zero() && self.max_duration < Duration::from_millis(1) {
            return Err(SandboxError::Config(format!(
                "max_duration too low (< 1ms): {:?}",
                self.max_duration
            )));
        }
        Ok(())
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug, Default)]
struct ArmedCall {
    context: Option<CallContext>,
    started: Option<Instant>,
    /// First limit the call ran into; every later check re-raises it.
    tripped: Option<String>,
}

/// Per-instance execution guard polled by the interpreter hook.
///
/// The guard is armed with the current call's [`CallContext`] for the duration
/// of a lease and disarmed on release. While disarmed the hook still enforces
/// instruction, stack and memory limits, but never the call deadline.
///
/// A tripped limit stays tripped until the guard is re-armed, so a script that
/// catches the error with `pcall` is stopped again at the next check.
#[derive(Debug)]
pub struct ExecutionGuard {
    limits: ResourceLimits,
    armed: Mutex<ArmedCall>,
    instructions: AtomicU64,
    peak_memory: AtomicUsize,
}

impl ExecutionGuard {
    /// Create a disarmed guard for `limits`.
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            armed: Mutex::new(ArmedCall::default()),
            instructions: AtomicU64::new(0),
            peak_memory: AtomicUsize::new(0),
        }
    }

    /// The limits this guard enforces.
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Bind a call's cancellation signal and reset the per-call counters.
    pub fn arm(&self, context: CallContext) {
        let mut armed = self.armed.lock();
        armed.context = Some(context);
        armed.started = Some(Instant::now());
        armed.tripped = None;
        self.instructions.store(0, Ordering::Relaxed);
        self.peak_memory.store(0, Ordering::Relaxed);
    }

    /// Release the bound signal.
    pub fn disarm(&self) {
        let mut armed = self.armed.lock();
        armed.context = None;
        armed.started = None;
        armed.tripped = None;
    }

    /// Instructions counted since the guard was last armed, at check granularity.
    pub fn instructions(&self) -> u64 {
        self.instructions.load(Ordering::Relaxed)
    }

    /// Whether a limit has stopped the current call.
    pub fn is_tripped(&self) -> bool {
        self.armed.lock().tripped.is_some()
    }

    /// Record an interpreter heap size.
    pub fn observe_memory(&self, bytes: usize) {
        self.peak_memory.fetch_max(bytes, Ordering::Relaxed);
    }

    /// Highest heap size seen since the guard was last armed.
    ///
    /// Sampled at every hook check and at every [`observe_memory`] call.
    ///
    /// [`observe_memory`]: ExecutionGuard::observe_memory
    pub fn peak_memory(&self) -> usize {
        self.peak_memory.load(Ordering::Relaxed)
    }

    fn check(&self, lua: &Lua) -> mlua::Result<()> {
        let count = self
            .instructions
            .fetch_add(u64::from(self.limits.check_interval), Ordering::Relaxed)
            + u64::from(self.limits.check_interval);
        self.observe_memory(lua.used_memory());

        let mut armed = self.armed.lock();
        if let Some(message) = armed.tripped.as_ref() {
            return Err(mlua::Error::runtime(message.clone()));
        }
        match self.violation(lua, &armed, count) {
            Some(message) => {
                armed.tripped = Some(message.clone());
                Err(mlua::Error::runtime(message))
            }
            None => Ok(()),
        }
    }

    fn checkpoint(&self) -> mlua::Result<()> {
        match self.armed.lock().tripped.as_ref() {
            Some(message) => Err(mlua::Error::runtime(message.clone())),
            None => Ok(()),
        }
    }

    fn violation(&self, lua: &Lua, armed: &ArmedCall, count: u64) -> Option<String> {
        if let Some(context) = armed.context.as_ref() {
            if context.is_done() {
                return Some("script execution cancelled".to_string());
            }
        }
        if let Some(started) = armed.started {
            let elapsed = started.elapsed();
            if !self.limits.max_duration.is_zero() && elapsed > self.limits.max_duration {
                return Some(format!(
                    "execution time limit exceeded: {:?} > {:?}",
                    elapsed, self.limits.max_duration
                ));
            }
        }

        if self.limits.max_instructions > 0 && count > self.limits.max_instructions {
            return Some(format!(
                "instruction limit exceeded: {}",
                self.limits.max_instructions
            ));
        }

        if self.limits.max_stack_depth > 0
            && lua.inspect_stack(self.limits.max_stack_depth).is_some()
        {
            return Some(format!(
                "stack depth limit exceeded: {}",
                self.limits.max_stack_depth
            ));
        }

        None
    }
}

/// Wraps `pcall` and `xpcall` so a tripped limit is raised again once the
/// protected call returns.
const PROTECTED_CALLS: &str = r#"
local raw_pcall, raw_xpcall, checkpoint = ...
local function settle(...)
    checkpoint()
    return ...
end
return function(f, ...)
    return settle(raw_pcall(f, ...))
end, function(f, handler, ...)
    return settle(raw_xpcall(f, handler, ...))
end
"#;

/// Moves the hook onto a coroutine for as long as it runs.
const COROUTINE_SWITCHES: &str = r#"
local raw_create, raw_resume, raw_error, enter, leave, checkpoint = ...
local function finish(...)
    leave()
    checkpoint()
    return ...
end
local function resume(co, ...)
    enter(co)
    return finish(raw_resume(co, ...))
end
local function unwrap(ok, ...)
    if not ok then
        raw_error((...), 0)
    end
    return ...
end
local function wrap(f)
    local co = raw_create(f)
    return function(...)
        return unwrap(resume(co, ...))
    end
end
return resume, wrap
"#;

/// Apply the memory limit and install the instruction-count hook.
///
/// Must run after the globals are filtered: it replaces `pcall`, `xpcall`,
/// `coroutine.resume` and `coroutine.wrap` with guarded versions, and only
/// where they are still present.
pub fn install_guard(lua: &Lua, guard: Arc<ExecutionGuard>) -> Result<()> {
    let limits = *guard.limits();
    if limits.max_memory > 0 {
        lua.set_memory_limit(limits.max_memory).map_err(|e| {
            SandboxError::Creation(anyhow::anyhow!("failed to set memory limit: {}", e))
        })?;
    }

    watch_thread(&lua.current_thread(), Arc::clone(&guard));
    install_checkpoints(lua, guard).map_err(|e| {
        SandboxError::Creation(anyhow::anyhow!("failed to install guard checkpoints: {}", e))
    })
}

/// Point the instruction hook at `thread`.
///
/// Only one thread is hooked at a time; others drop the hook when they run.
pub(crate) fn watch_thread(thread: &Thread, guard: Arc<ExecutionGuard>) {
    let triggers = HookTriggers::new().every_nth_instruction(guard.limits().check_interval);
    thread.set_hook(triggers, move |lua, _debug| {
        guard.check(lua)?;
        Ok(VmState::Continue)
    });
}

fn install_checkpoints(lua: &Lua, guard: Arc<ExecutionGuard>) -> mlua::Result<()> {
    let globals = lua.globals();
    let checkpoint = {
        let guard = Arc::clone(&guard);
        lua.create_function(move |_, ()| guard.checkpoint())?
    };

    let pcall: Option<Function> = globals.raw_get("pcall")?;
    let xpcall: Option<Function> = globals.raw_get("xpcall")?;
    if pcall.is_some() || xpcall.is_some() {
        let (guarded_pcall, guarded_xpcall): (Function, Function) = lua
            .load(PROTECTED_CALLS)
            .set_name("=sandbox")
            .call((pcall.clone(), xpcall.clone(), checkpoint.clone()))?;
        if pcall.is_some() {
            globals.raw_set("pcall", guarded_pcall)?;
        }
        if xpcall.is_some() {
            globals.raw_set("xpcall", guarded_xpcall)?;
        }
    }

    let Some(coroutine) = globals.raw_get::<Option<Table>>("coroutine")? else {
        return Ok(());
    };
    let create: Option<Function> = coroutine.raw_get("create")?;
    let resume: Option<Function> = coroutine.raw_get("resume")?;
    let raise: Option<Function> = globals.raw_get("error")?;
    let (Some(create), Some(resume), Some(raise)) = (create, resume, raise) else {
        return Ok(());
    };

    let enter = {
        let guard = Arc::clone(&guard);
        lua.create_function(move |_, co: Value| {
            if let Value::Thread(thread) = co {
                watch_thread(&thread, Arc::clone(&guard));
            }
            Ok(())
        })?
    };
    let leave = lua.create_function(move |lua, ()| {
        watch_thread(&lua.current_thread(), Arc::clone(&guard));
        Ok(())
    })?;

    let (guarded_resume, guarded_wrap): (Function, Function) = lua
        .load(COROUTINE_SWITCHES)
        .set_name("=sandbox")
        .call((create, resume, raise, enter, leave, checkpoint))?;
    coroutine.raw_set("resume", guarded_resume)?;
    if coroutine.contains_key("wrap")? {
        coroutine.raw_set("wrap", guarded_wrap)?;
    }
    Ok(())
}
