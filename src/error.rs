//! Error types for the Lua sandbox.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while configuring the sandbox or running scripts.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Invalid pool, cache, pipeline or security configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Building or sandboxing a fresh interpreter failed. The instance is discarded.
    #[error("failed to create interpreter: {0}")]
    Creation(#[source] anyhow::Error),

    /// The script did not compile. Compile failures are never cached.
    #[error("syntax error in {chunk}{}: {message}", .line.map(|l| format!(":{l}")).unwrap_or_default())]
    Syntax {
        /// The chunk name the script was compiled under.
        chunk: String,
        /// The offending line, if Lua reported one.
        line: Option<u32>,
        /// The compiler message without the location prefix.
        message: String,
    },

    /// A guest-level fault during execution, including recovered panics.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The interpreter allocator refused to grow past the configured limit.
    #[error("memory limit exceeded: {0}")]
    MemoryLimitExceeded(String),

    /// The deadline expired while the guest call was running.
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// The caller's signal ended before any guest code ran.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A parameter or result could not be marshaled between host and guest.
    #[error("conversion error: {0}")]
    Conversion(String),

    /// The module loader failed to expose host capabilities.
    #[error("failed to load modules: {0}")]
    ModuleLoad(#[source] anyhow::Error),

    /// The pool no longer hands out instances.
    #[error("pool is shut down")]
    PoolShutdown,

    /// Shutdown gave up waiting for leased instances.
    #[error("shutdown timeout: {in_use} instances still in use")]
    ShutdownTimeout {
        /// Number of instances still leased when the deadline passed.
        in_use: usize,
    },
}

/// Coarse classification of [`SandboxError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid configuration, fatal at startup.
    Config,
    /// Interpreter construction failure.
    Creation,
    /// Compile failure.
    Syntax,
    /// Guest fault, conversion or module loading failure.
    Runtime,
    /// Deadline exceeded mid-execution.
    Timeout,
    /// Signal ended while waiting, or the pool is closed.
    Cancelled,
}

impl SandboxError {
    /// Translate an interpreter error into a sandbox error.
    ///
    /// `kind` decides how a plain error message is classified: a failure while
    /// compiling is a [`SandboxError::Syntax`], anything else is a runtime fault.
    /// Callback errors are unwrapped to their innermost cause.
    pub fn from_lua(err: mlua::Error, kind: ErrorKind) -> Self {
        match err {
            mlua::Error::SyntaxError { message, .. } => Self::syntax_from_message(&message),
            mlua::Error::MemoryError(message) => Self::MemoryLimitExceeded(message),
            mlua::Error::CallbackError { cause, .. } => {
                Self::from_lua(unwrap_cause(&cause), kind)
            }
            mlua::Error::RuntimeError(message) if kind == ErrorKind::Syntax => {
                Self::syntax_from_message(&message)
            }
            mlua::Error::RuntimeError(message) => Self::Runtime(message),
            other if kind == ErrorKind::Syntax => Self::syntax_from_message(&other.to_string()),
            other => Self::Runtime(other.to_string()),
        }
    }

    fn syntax_from_message(message: &str) -> Self {
        match parse_lua_error(message) {
            Some(location) => Self::Syntax {
                chunk: location.chunk,
                line: Some(location.line),
                message: location.message,
            },
            None => Self::Syntax {
                chunk: String::from("?"),
                line: None,
                message: message.trim().to_string(),
            },
        }
    }

    /// The coarse kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Creation(_) => ErrorKind::Creation,
            Self::Syntax { .. } => ErrorKind::Syntax,
            Self::Runtime(_)
            | Self::MemoryLimitExceeded(_)
            | Self::Conversion(_)
            | Self::ModuleLoad(_) => ErrorKind::Runtime,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled(_) | Self::PoolShutdown | Self::ShutdownTimeout { .. } => {
                ErrorKind::Cancelled
            }
        }
    }

    /// Check if this error represents a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SandboxError::Timeout(_))
    }

    /// Check if this error represents a cancelled wait.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SandboxError::Cancelled(_))
    }

    /// Check if this error represents a compile failure.
    pub fn is_syntax(&self) -> bool {
        matches!(self, SandboxError::Syntax { .. })
    }

    /// Check if this error represents a guest runtime fault.
    pub fn is_runtime(&self) -> bool {
        self.kind() == ErrorKind::Runtime
    }

    /// Check if this error represents a memory limit exceeded.
    pub fn is_memory_limit(&self) -> bool {
        matches!(self, SandboxError::MemoryLimitExceeded(_))
    }
}

fn unwrap_cause(cause: &mlua::Error) -> mlua::Error {
    match cause {
        mlua::Error::CallbackError { cause, .. } => unwrap_cause(cause),
        other => other.clone(),
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Location information extracted from a Lua error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LuaErrorLocation {
    /// Chunk name as Lua printed it, e.g. `[string "main"]`.
    pub chunk: String,
    /// One-based line number.
    pub line: u32,
    /// The rest of the message.
    pub message: String,
}

/// Parse the `chunk:line: message` prefix Lua puts on compile and runtime errors.
///
/// Only the first line is inspected; tracebacks that follow are ignored.
pub fn parse_lua_error(message: &str) -> Option<LuaErrorLocation> {
    let first = message.lines().next()?.trim();
    if first.is_empty() {
        return None;
    }

    // Chunk names may contain colons (`[string "a:b"]`), so scan for the first
    // `:<digits>:` sequence instead of splitting on the first colon.
    let bytes = first.as_bytes();
    let mut idx = 0;
    while let Some(offset) = first[idx..].find(':') {
        let colon = idx + offset;
        let digits_start = colon + 1;
        let digits_len = bytes[digits_start..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();
        let digits_end = digits_start + digits_len;
        if digits_len > 0 && bytes.get(digits_end) == Some(&b':') {
            let line = first[digits_start..digits_end].parse().ok()?;
            return Some(LuaErrorLocation {
                chunk: first[..colon].to_string(),
                line,
                message: first[digits_end + 1..].trim().to_string(),
            });
        }
        idx = digits_start;
    }

    None
}
