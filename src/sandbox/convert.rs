//! Marshaling between host values and guest values.

use std::collections::HashSet;
use std::ffi::c_void;

use mlua::{Lua, Table, Value};
use serde_json::{Map, Number};

use crate::error::{Result, SandboxError};

/// Host-side value type exchanged with scripts.
pub type HostValue = serde_json::Value;

/// Default nesting limit for [`JsonConverter`].
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Converts parameters into the guest and results back out.
pub trait TypeConverter: Send + Sync {
    /// Build a guest value from a host value.
    fn to_guest(&self, lua: &Lua, value: &HostValue) -> Result<Value>;

    /// Build a host value from a guest value.
    fn from_guest(&self, value: &Value) -> Result<HostValue>;
}

/// Converter between JSON values and Lua values.
///
/// Arrays become sequences starting at 1. A table whose keys are exactly
/// `1..=n` converts back to an array; any other table converts to an object,
/// with integer and float keys stringified. Functions, userdata and threads
/// cannot cross the boundary.
#[derive(Debug, Clone, Copy)]
pub struct JsonConverter {
    max_depth: usize,
}

impl Default for JsonConverter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl JsonConverter {
    /// A converter rejecting structures nested deeper than `max_depth`.
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// The nesting limit.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    fn check_depth(&self, depth: usize) -> Result<()> {
        if depth > self.max_depth {
            return Err(SandboxError::Conversion(format!(
                "maximum depth exceeded: {}",
                self.max_depth
            )));
        }
        Ok(())
    }

    fn host_to_guest(&self, lua: &Lua, value: &HostValue, depth: usize) -> mlua::Result<Value> {
        Ok(match value {
            HostValue::Null => Value::Nil,
            HostValue::Bool(b) => Value::Boolean(*b),
            HostValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            },
            HostValue::String(s) => Value::String(lua.create_string(s)?),
            HostValue::Array(items) => {
                self.check_depth(depth + 1).map_err(mlua::Error::external)?;
                let table = lua.create_table_with_capacity(items.len(), 0)?;
                for (i, item) in items.iter().enumerate() {
                    table.raw_set(i + 1, self.host_to_guest(lua, item, depth + 1)?)?;
                }
                Value::Table(table)
            }
            HostValue::Object(fields) => {
                self.check_depth(depth + 1).map_err(mlua::Error::external)?;
                let table = lua.create_table_with_capacity(0, fields.len())?;
                for (key, item) in fields {
                    table.raw_set(key.as_str(), self.host_to_guest(lua, item, depth + 1)?)?;
                }
                Value::Table(table)
            }
        })
    }

    fn guest_to_host(
        &self,
        value: &Value,
        depth: usize,
        visiting: &mut HashSet<*const c_void>,
    ) -> Result<HostValue> {
        match value {
            Value::Nil => Ok(HostValue::Null),
            Value::Boolean(b) => Ok(HostValue::Bool(*b)),
            Value::Integer(i) => Ok(HostValue::from(*i)),
            Value::Number(n) => Number::from_f64(*n).map(HostValue::Number).ok_or_else(|| {
                SandboxError::Conversion(format!("non-finite number: {n}"))
            }),
            Value::String(s) => Ok(HostValue::String(s.to_string_lossy().to_string())),
            Value::Table(table) => self.table_to_host(table, depth, visiting),
            Value::LightUserData(ud) if ud.0.is_null() => Ok(HostValue::Null),
            other => Err(SandboxError::Conversion(format!(
                "unsupported guest type: {}",
                other.type_name()
            ))),
        }
    }

    fn table_to_host(
        &self,
        table: &Table,
        depth: usize,
        visiting: &mut HashSet<*const c_void>,
    ) -> Result<HostValue> {
        self.check_depth(depth + 1)?;
        let ptr = table.to_pointer();
        if !visiting.insert(ptr) {
            return Err(SandboxError::Conversion(
                "circular reference detected".to_string(),
            ));
        }

        let result = self.table_entries(table, depth, visiting);
        visiting.remove(&ptr);
        result
    }

    fn table_entries(
        &self,
        table: &Table,
        depth: usize,
        visiting: &mut HashSet<*const c_void>,
    ) -> Result<HostValue> {
        let conversion = |e: mlua::Error| SandboxError::Conversion(e.to_string());

        let mut entries = Vec::new();
        for pair in table.pairs::<Value, Value>() {
            entries.push(pair.map_err(conversion)?);
        }

        let len = table.raw_len();
        let is_sequence = len > 0
            && entries.len() == len
            && entries
                .iter()
                .all(|(key, _)| matches!(key, Value::Integer(i) if *i >= 1 && (*i as usize) <= len));

        if is_sequence {
            let mut items = vec![HostValue::Null; len];
            for (key, value) in &entries {
                if let Value::Integer(i) = key {
                    items[*i as usize - 1] = self.guest_to_host(value, depth + 1, visiting)?;
                }
            }
            return Ok(HostValue::Array(items));
        }

        let mut fields = Map::new();
        for (key, value) in &entries {
            let name = match key {
                Value::String(s) => s.to_string_lossy().to_string(),
                Value::Integer(i) => i.to_string(),
                Value::Number(n) => n.to_string(),
                Value::Boolean(b) => b.to_string(),
                other => {
                    return Err(SandboxError::Conversion(format!(
                        "unsupported table key type: {}",
                        other.type_name()
                    )));
                }
            };
            fields.insert(name, self.guest_to_host(value, depth + 1, visiting)?);
        }
        Ok(HostValue::Object(fields))
    }
}

impl TypeConverter for JsonConverter {
    fn to_guest(&self, lua: &Lua, value: &HostValue) -> Result<Value> {
        self.host_to_guest(lua, value, 0)
            .map_err(|e| match e {
                mlua::Error::ExternalError(cause) => match cause.downcast_ref::<SandboxError>() {
                    Some(SandboxError::Conversion(message)) => {
                        SandboxError::Conversion(message.clone())
                    }
                    _ => SandboxError::Conversion(cause.to_string()),
                },
                other => SandboxError::Conversion(other.to_string()),
            })
    }

    fn from_guest(&self, value: &Value) -> Result<HostValue> {
        self.guest_to_host(value, 0, &mut HashSet::new())
    }
}
