//! Layered capability restriction for interpreter instances.
//!
//! A [`SecurityEnforcer`] is built once from a [`SecurityConfig`]. All per-level
//! tables (libraries, stripped functions, allowed globals, module gate) are
//! resolved into plain sets at construction, so [`SecurityEnforcer::apply_sandbox`]
//! only walks precomputed data.
//!
//! Sandbox steps, in order:
//!
//! 1. Load only the allowed standard libraries.
//! 2. Strip dangerous functions from the loaded libraries.
//! 3. Install stand-ins for always-blocked operations, the capturing `print`
//!    and the text-only `load`.
//! 4. Remove every global that is not explicitly allow-listed.
//! 5. Hide the string metatable behind `__metatable`.
//! 6. Install the module-load gate in place of `require`.
//!
//! The debug library is never loaded, whatever the configuration says.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use mlua::{Function, Lua, MultiValue, StdLib, Table, Value};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SandboxError};
use crate::sandbox::io::CapturedOutput;
use crate::sandbox::limits::{install_guard, ExecutionGuard, ResourceLimits};

const ORIGINAL_REQUIRE: &str = "lua_sandbox.require";
const ORIGINAL_LOAD: &str = "lua_sandbox.load";
const ORIGINAL_TOSTRING: &str = "lua_sandbox.tostring";

/// Named tier of capability restriction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    /// Most libraries, including unsanitized `io` and `os`.
    Minimal,
    /// No file access; a sanitized `os`; allow-listed modules only.
    #[default]
    Standard,
    /// Pure computation: base, coroutine, table, string, math.
    Strict,
    /// Libraries come from [`SecurityConfig::allowed_libraries`].
    Custom,
}

impl SecurityLevel {
    /// Lower-case profile name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Standard => "standard",
            Self::Strict => "strict",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityLevel {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "minimal" => Ok(Self::Minimal),
            "standard" => Ok(Self::Standard),
            "strict" => Ok(Self::Strict),
            "custom" => Ok(Self::Custom),
            other => Err(SandboxError::Config(format!(
                "unknown security level: {other}"
            ))),
        }
    }
}

/// A standard library an instance may be given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    /// Base functions (`pairs`, `pcall`, ...). Always present.
    Base,
    /// `coroutine`.
    Coroutine,
    /// `table`.
    Table,
    /// `string`.
    String,
    /// `math`.
    Math,
    /// `utf8`.
    Utf8,
    /// `os`, sanitized per level.
    Os,
    /// `io`, Minimal and Custom only.
    Io,
    /// `package` and `require`.
    Package,
    /// `debug`. Recognized only so it can be refused.
    Debug,
}

impl Capability {
    /// Parse a library name as used in configuration.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "base" | "_G" => Self::Base,
            "coroutine" => Self::Coroutine,
            "table" => Self::Table,
            "string" => Self::String,
            "math" => Self::Math,
            "utf8" => Self::Utf8,
            "os" => Self::Os,
            "io" => Self::Io,
            "package" => Self::Package,
            "debug" => Self::Debug,
            _ => return None,
        })
    }

    /// The global name the library is published under.
    pub fn global_name(&self) -> &'static str {
        match self {
            Self::Base => "_G",
            Self::Coroutine => "coroutine",
            Self::Table => "table",
            Self::String => "string",
            Self::Math => "math",
            Self::Utf8 => "utf8",
            Self::Os => "os",
            Self::Io => "io",
            Self::Package => "package",
            Self::Debug => "debug",
        }
    }

    fn std_lib(&self) -> StdLib {
        match self {
            Self::Base | Self::Debug => StdLib::NONE,
            Self::Coroutine => StdLib::COROUTINE,
            Self::Table => StdLib::TABLE,
            Self::String => StdLib::STRING,
            Self::Math => StdLib::MATH,
            Self::Utf8 => StdLib::UTF8,
            Self::Os => StdLib::OS,
            Self::Io => StdLib::IO,
            Self::Package => StdLib::PACKAGE,
        }
    }
}

/// Security configuration supplied at construction time.
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityConfig {
    /// The restriction tier.
    pub level: SecurityLevel,
    /// Library names. Required for Custom; for preset levels a non-empty list
    /// narrows the level's table and can never widen it.
    pub allowed_libraries: Vec<String>,
    /// Extra dotted function paths to strip, e.g. `os.date`.
    pub denied_functions: BTreeSet<String>,
    /// Execution limits installed on every instance.
    pub limits: ResourceLimits,
}

impl SecurityConfig {
    /// Preset configuration for `level`, with the level's limit profile.
    pub fn new(level: SecurityLevel) -> Self {
        let limits = match level {
            SecurityLevel::Minimal => ResourceLimits::minimal(),
            SecurityLevel::Standard | SecurityLevel::Custom => ResourceLimits::standard(),
            SecurityLevel::Strict => ResourceLimits::strict(),
        };
        Self {
            level,
            allowed_libraries: Vec::new(),
            denied_functions: BTreeSet::new(),
            limits,
        }
    }

    /// Custom configuration with an explicit library list.
    pub fn custom<I, S>(libraries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_libraries: libraries.into_iter().map(Into::into).collect(),
            ..Self::new(SecurityLevel::Custom)
        }
    }

    /// Strip one more function path.
    pub fn deny(mut self, path: impl Into<String>) -> Self {
        self.denied_functions.insert(path.into());
        self
    }

    /// Replace the limits.
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Check the configuration without building anything.
    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;
        for name in &self.allowed_libraries {
            match Capability::from_name(name) {
                None => {
                    return Err(SandboxError::Config(format!("unknown library: {name}")));
                }
                Some(Capability::Debug) if self.level == SecurityLevel::Custom => {
                    return Err(SandboxError::Config(
                        "the debug library is never allowed".to_string(),
                    ));
                }
                Some(_) => {}
            }
        }
        if self.level == SecurityLevel::Custom && self.allowed_libraries.is_empty() {
            return Err(SandboxError::Config(
                "custom security level requires allowed_libraries".to_string(),
            ));
        }
        for path in &self.denied_functions {
            if split_path(path).is_none() {
                return Err(SandboxError::Config(format!(
                    "denied function must be a dotted path: {path}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self::new(SecurityLevel::Standard)
    }
}

/// How `require` behaves inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleGate {
    /// Every `require` fails.
    Disabled,
    /// Only these names, plus host modules in `package.preload`.
    AllowList(BTreeSet<String>),
    /// Everything except these names.
    DenyList(BTreeSet<String>),
}

/// Applies a resolved [`SecurityConfig`] to fresh interpreters.
#[derive(Debug)]
pub struct SecurityEnforcer {
    level: SecurityLevel,
    capabilities: BTreeSet<Capability>,
    libs: StdLib,
    stripped: Vec<(String, String)>,
    allowed_globals: BTreeSet<String>,
    text_only_load: bool,
    gate: ModuleGate,
    limits: ResourceLimits,
}

fn names(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn split_path(path: &str) -> Option<(String, String)> {
    let (table, function) = path.split_once('.')?;
    if table.is_empty() || function.is_empty() || function.contains('.') {
        return None;
    }
    Some((table.to_string(), function.to_string()))
}

impl SecurityEnforcer {
    /// Resolve `config` into the tables used by [`Self::apply_sandbox`].
    pub fn new(config: &SecurityConfig) -> Result<Self> {
        config.validate()?;
        let level = config.level;

        let table: BTreeSet<Capability> = match level {
            SecurityLevel::Strict => [
                Capability::Base,
                Capability::Coroutine,
                Capability::Table,
                Capability::String,
                Capability::Math,
            ]
            .into(),
            SecurityLevel::Standard => [
                Capability::Base,
                Capability::Coroutine,
                Capability::Table,
                Capability::String,
                Capability::Math,
                Capability::Utf8,
                Capability::Os,
                Capability::Package,
            ]
            .into(),
            SecurityLevel::Minimal => [
                Capability::Base,
                Capability::Coroutine,
                Capability::Table,
                Capability::String,
                Capability::Math,
                Capability::Utf8,
                Capability::Os,
                Capability::Io,
                Capability::Package,
            ]
            .into(),
            SecurityLevel::Custom => config
                .allowed_libraries
                .iter()
                .filter_map(|name| Capability::from_name(name))
                .chain(std::iter::once(Capability::Base))
                .collect(),
        };

        let mut capabilities = table;
        if level != SecurityLevel::Custom && !config.allowed_libraries.is_empty() {
            let requested: BTreeSet<Capability> = config
                .allowed_libraries
                .iter()
                .filter_map(|name| Capability::from_name(name))
                .chain(std::iter::once(Capability::Base))
                .collect();
            capabilities = capabilities.intersection(&requested).copied().collect();
        }
        capabilities.remove(&Capability::Debug);

        let libs = capabilities
            .iter()
            .fold(StdLib::NONE, |acc, cap| acc | cap.std_lib());

        let mut denied: BTreeSet<String> = match level {
            SecurityLevel::Minimal => names(&["os.execute", "os.exit", "io.popen"]),
            SecurityLevel::Standard => names(&[
                "os.execute",
                "os.exit",
                "os.getenv",
                "os.remove",
                "os.rename",
                "os.tmpname",
                "os.setlocale",
            ]),
            SecurityLevel::Strict => BTreeSet::new(),
            SecurityLevel::Custom => names(&["os.execute", "os.exit", "io.popen"]),
        };
        denied.insert("string.dump".to_string());
        if capabilities.contains(&Capability::Package) {
            denied.extend(names(&["package.loadlib", "package.searchpath"]));
        }
        denied.extend(config.denied_functions.iter().cloned());
        let stripped = denied.iter().filter_map(|p| split_path(p)).collect();

        let text_only_load = matches!(level, SecurityLevel::Minimal | SecurityLevel::Custom);

        let mut allowed_globals = names(&[
            "_G",
            "_VERSION",
            "assert",
            "error",
            "getmetatable",
            "ipairs",
            "next",
            "pairs",
            "pcall",
            "print",
            "rawequal",
            "rawget",
            "rawlen",
            "rawset",
            "select",
            "setmetatable",
            "tonumber",
            "tostring",
            "type",
            "xpcall",
            // stand-ins
            "dofile",
            "loadfile",
            "collectgarbage",
            "require",
        ]);
        if text_only_load {
            allowed_globals.insert("load".to_string());
        }
        for cap in &capabilities {
            allowed_globals.insert(cap.global_name().to_string());
        }

        let gate = match level {
            SecurityLevel::Strict => ModuleGate::Disabled,
            SecurityLevel::Standard | SecurityLevel::Custom => ModuleGate::AllowList(names(&[
                "string",
                "table",
                "math",
                "coroutine",
                "utf8",
            ])),
            SecurityLevel::Minimal => ModuleGate::DenyList(names(&[
                "socket", "lfs", "ffi", "posix", "winapi", "debug",
            ])),
        };

        Ok(Self {
            level,
            capabilities,
            libs,
            stripped,
            allowed_globals,
            text_only_load,
            gate,
            limits: config.limits,
        })
    }

    /// The level this enforcer was resolved for.
    pub fn level(&self) -> SecurityLevel {
        self.level
    }

    /// The resolved library set.
    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    /// Whether `cap` is part of the resolved set.
    pub fn allows(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    /// The resolved module gate.
    pub fn module_gate(&self) -> &ModuleGate {
        &self.gate
    }

    /// Limits every sandboxed instance runs under.
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Apply every restriction step to a freshly allocated interpreter.
    ///
    /// Libraries are loaded, dangerous functions stripped, stand-ins installed,
    /// globals filtered against the level's allow-list, the string metatable
    /// hidden and `require` gated. The execution guard goes in last so its
    /// wrapped `pcall` and `coroutine` functions survive the filter.
    ///
    /// # Arguments
    ///
    /// * `lua` - A state created with no standard libraries. Must not have run
    ///   any script yet.
    /// * `guard` - Polled by the instruction hook for the instance's lifetime.
    /// * `output` - Receives everything the sandboxed `print` writes.
    ///
    /// # Returns
    ///
    /// [`SandboxError::Creation`] naming the failed step. The interpreter must
    /// then be dropped, never used.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let enforcer = SecurityEnforcer::new(&SecurityConfig::new(SecurityLevel::Strict))?;
    /// let lua = Lua::new_with(StdLib::NONE, LuaOptions::new())?;
    /// let guard = Arc::new(ExecutionGuard::new(*enforcer.limits()));
    /// enforcer.apply_sandbox(&lua, guard, &CapturedOutput::new())?;
    /// ```
    pub fn apply_sandbox(
        &self,
        lua: &Lua,
        guard: Arc<ExecutionGuard>,
        output: &CapturedOutput,
    ) -> Result<()> {
        let step = |name: &str, e: mlua::Error| {
            SandboxError::Creation(anyhow::anyhow!("sandbox step '{}' failed: {}", name, e))
        };

        self.load_libraries(lua).map_err(|e| step("load libraries", e))?;
        self.strip_functions(lua).map_err(|e| step("strip functions", e))?;
        self.install_replacements(lua, output)
            .map_err(|e| step("install replacements", e))?;
        self.filter_globals(lua).map_err(|e| step("filter globals", e))?;
        protect_string_metatable(lua).map_err(|e| step("protect metatables", e))?;
        self.install_module_gate(lua)
            .map_err(|e| step("install module gate", e))?;
        install_guard(lua, guard)?;

        debug!(level = %self.level, "sandbox applied");
        Ok(())
    }

    fn load_libraries(&self, lua: &Lua) -> mlua::Result<()> {
        if self.libs != StdLib::NONE {
            lua.load_std_libs(self.libs)?;
        }
        Ok(())
    }

    fn strip_functions(&self, lua: &Lua) -> mlua::Result<()> {
        let globals = lua.globals();
        for (table, function) in &self.stripped {
            if let Value::Table(lib) = globals.raw_get::<Value>(table.as_str())? {
                lib.raw_set(function.as_str(), Value::Nil)?;
            }
        }
        Ok(())
    }

    fn install_replacements(&self, lua: &Lua, output: &CapturedOutput) -> mlua::Result<()> {
        let globals = lua.globals();

        for name in ["dofile", "loadfile", "collectgarbage"] {
            globals.raw_set(name, blocked_function(lua, name)?)?;
        }

        let tostring: Function = globals.raw_get("tostring")?;
        lua.set_named_registry_value(ORIGINAL_TOSTRING, tostring)?;
        let sink = output.clone();
        let print = lua.create_function(move |lua, args: MultiValue| {
            let tostring: Function = lua.named_registry_value(ORIGINAL_TOSTRING)?;
            let mut parts = Vec::with_capacity(args.len());
            for value in args {
                let text: mlua::String = tostring.call(value)?;
                parts.push(text.to_string_lossy().to_string());
            }
            sink.push_line(&parts);
            Ok(())
        })?;
        globals.raw_set("print", print)?;

        if self.text_only_load {
            let load: Function = globals.raw_get("load")?;
            lua.set_named_registry_value(ORIGINAL_LOAD, load)?;
            let text_load = lua.create_function(
                |lua, (chunk, name, _mode, env): (Value, Value, Value, Option<Table>)| {
                    let load: Function = lua.named_registry_value(ORIGINAL_LOAD)?;
                    let mode = Value::String(lua.create_string("t")?);
                    let mut args = vec![chunk, name, mode];
                    if let Some(env) = env {
                        args.push(Value::Table(env));
                    }
                    load.call::<MultiValue>(MultiValue::from_iter(args))
                },
            )?;
            globals.raw_set("load", text_load)?;
        }

        Ok(())
    }

    fn filter_globals(&self, lua: &Lua) -> mlua::Result<()> {
        let globals = lua.globals();
        let mut remove = Vec::new();
        for pair in globals.pairs::<Value, Value>() {
            let (key, _) = pair?;
            let keep = match &key {
                Value::String(s) => self
                    .allowed_globals
                    .contains(s.to_string_lossy().as_str()),
                _ => false,
            };
            if !keep {
                remove.push(key);
            }
        }
        for key in remove {
            globals.raw_set(key, Value::Nil)?;
        }
        Ok(())
    }

    fn install_module_gate(&self, lua: &Lua) -> mlua::Result<()> {
        let globals = lua.globals();
        let package: Option<Table> = globals.raw_get("package")?;

        let package = match (&self.gate, package) {
            (ModuleGate::Disabled, _) => {
                let require = lua.create_function(|_, _: MultiValue| -> mlua::Result<()> {
                    Err(mlua::Error::runtime(
                        "require is disabled in strict security mode",
                    ))
                })?;
                return globals.raw_set("require", require);
            }
            (_, None) => {
                let require = lua.create_function(|_, _: MultiValue| -> mlua::Result<()> {
                    Err(mlua::Error::runtime(
                        "require is unavailable: package library not loaded",
                    ))
                })?;
                return globals.raw_set("require", require);
            }
            (_, Some(package)) => package,
        };

        // No native searchers anywhere; file searchers only where files are allowed.
        package.raw_set("cpath", "")?;
        let searchers: Table = package.raw_get("searchers")?;
        let keep = match self.gate {
            ModuleGate::DenyList(_) => 2,
            _ => {
                package.raw_set("path", "")?;
                1
            }
        };
        let len = searchers.raw_len();
        for index in (keep + 1..=len).rev() {
            searchers.raw_remove(index as i64)?;
        }

        let original: Function = globals.raw_get("require")?;
        lua.set_named_registry_value(ORIGINAL_REQUIRE, original)?;

        let gate = self.gate.clone();
        let level = self.level;
        let require = lua.create_function(move |lua, name: String| {
            let permitted = match &gate {
                ModuleGate::Disabled => false,
                ModuleGate::AllowList(allowed) => {
                    allowed.contains(&name) || is_host_module(lua, &name)?
                }
                ModuleGate::DenyList(denied) => !denied.contains(&name),
            };
            if !permitted {
                return Err(mlua::Error::runtime(format!(
                    "module '{name}' is not allowed in {level} security mode"
                )));
            }
            let require: Function = lua.named_registry_value(ORIGINAL_REQUIRE)?;
            require.call::<MultiValue>(name)
        })?;
        globals.raw_set("require", require)
    }
}

fn blocked_function(lua: &Lua, name: &'static str) -> mlua::Result<Function> {
    lua.create_function(move |_, _: MultiValue| -> mlua::Result<()> {
        Err(mlua::Error::runtime(format!(
            "{name} is disabled for security"
        )))
    })
}

fn is_host_module(lua: &Lua, name: &str) -> mlua::Result<bool> {
    let package: Option<Table> = lua.globals().raw_get("package")?;
    match package {
        Some(package) => {
            let preload: Option<Table> = package.raw_get("preload")?;
            match preload {
                Some(preload) => preload.contains_key(name),
                None => Ok(false),
            }
        }
        None => Ok(false),
    }
}

/// Hide the shared string metatable so scripts cannot reach or rewrite it.
///
/// `getmetatable("")` returns `false` afterwards; method-call syntax on strings
/// keeps working because `__index` is untouched.
fn protect_string_metatable(lua: &Lua) -> mlua::Result<()> {
    let metatable: Option<Table> = lua
        .load("return getmetatable('')")
        .set_name("=sandbox")
        .eval()?;
    if let Some(metatable) = metatable {
        metatable.raw_set("__metatable", false)?;
    }
    Ok(())
}
