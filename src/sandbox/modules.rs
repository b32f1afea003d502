//! Exposing host capabilities to scripts as Lua modules.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use mlua::{Lua, MultiValue, Table, Value};

use crate::error::{Result, SandboxError};

/// Invoked once per call, before parameters are injected.
pub trait ModuleLoader: Send + Sync {
    /// Make host modules reachable from `lua`.
    fn load_modules(&self, lua: &Lua) -> Result<()>;
}

/// A loader that exposes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoModules;

impl ModuleLoader for NoModules {
    fn load_modules(&self, _lua: &Lua) -> Result<()> {
        Ok(())
    }
}

/// Builds a module table inside a given interpreter.
pub type ModuleBuilder = Arc<dyn Fn(&Lua) -> mlua::Result<Table> + Send + Sync>;

/// Named host modules.
///
/// With the package library present each module is registered in
/// `package.preload`, so `require(name)` builds it lazily and the Standard
/// module gate admits it. Without the package library the module table is
/// bound directly as a global.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, ModuleBuilder>,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ModuleRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `builder` under `name`, replacing any previous module.
    pub fn register<F>(mut self, name: impl Into<String>, builder: F) -> Self
    where
        F: Fn(&Lua) -> mlua::Result<Table> + Send + Sync + 'static,
    {
        self.modules.insert(name.into(), Arc::new(builder));
        self
    }

    /// Registered module names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// Number of registered modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Host loaders always replace whatever a script left under the same name,
    /// and any cached copy in `package.loaded` is dropped.
    fn install(&self, lua: &Lua) -> mlua::Result<()> {
        let globals = lua.globals();
        let (preload, loaded) = match globals.raw_get::<Option<Table>>("package")? {
            Some(package) => (
                package.raw_get::<Option<Table>>("preload")?,
                package.raw_get::<Option<Table>>("loaded")?,
            ),
            None => (None, None),
        };

        for (name, builder) in &self.modules {
            match &preload {
                Some(preload) => {
                    let builder = Arc::clone(builder);
                    let loader =
                        lua.create_function(move |lua, _: MultiValue| builder(lua))?;
                    preload.raw_set(name.as_str(), loader)?;
                    if let Some(loaded) = &loaded {
                        loaded.raw_set(name.as_str(), Value::Nil)?;
                    }
                }
                None => {
                    globals.raw_set(name.as_str(), builder(lua)?)?;
                }
            }
        }
        Ok(())
    }
}

impl ModuleLoader for ModuleRegistry {
    fn load_modules(&self, lua: &Lua) -> Result<()> {
        self.install(lua).map_err(|e| {
            SandboxError::ModuleLoad(anyhow::anyhow!("failed to register modules: {}", e))
        })
    }
}
