//! Prelude module for convenient imports.

pub use crate::error::{Result, SandboxError};
pub use crate::sandbox::{
    config::SandboxConfig,
    context::CallContext,
    convert::HostValue,
    executor::{LuaSandbox, SandboxOptions},
    modules::ModuleRegistry,
    pipeline::{ExecutionReport, ScriptRequest},
    security::{SecurityConfig, SecurityLevel},
};
