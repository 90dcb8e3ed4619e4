/// Script evaluation for script tasks and script conditions
///
/// Lua is the only supported language. Every evaluation gets a fresh
/// sandboxed interpreter with the scope's variables as globals.

use crate::error::{PlatformError, Result};
use crate::expression::scope::VariableScope;
use crate::runtime::clock::Clock;
use mlua::{Lua, LuaOptions, LuaSerdeExt, StdLib};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

pub const LUA: &str = "lua";

/// Runs Lua scripts against a variable scope
#[derive(Debug, Clone)]
pub struct ScriptEvaluator {
    clock: Arc<dyn Clock>,
}

type PendingWrites = Arc<Mutex<Vec<(String, Value)>>>;

impl ScriptEvaluator {
    /// Evaluator reading time from `clock`
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Whether `language` can be evaluated
    pub fn supports(language: &str) -> bool {
        language.eq_ignore_ascii_case(LUA)
    }

    /// Run `source` and return the value of its final `return`
    ///
    /// `set_variable(name, value)` calls are applied to the scope after the
    /// script ran, including when it failed halfway.
    pub fn evaluate(
        &self,
        language: &str,
        source: &str,
        scope: &dyn VariableScope,
    ) -> Result<Value> {
        if !Self::supports(language) {
            return Err(PlatformError::Unsupported(format!(
                "Script language '{}' is not supported",
                language
            )));
        }

        debug!("📜 Evaluating {} script in scope {}", language, scope.scope_id());
        let writes: PendingWrites = Arc::new(Mutex::new(Vec::new()));
        let outcome = self.run_lua(source, scope.variables(), Arc::clone(&writes));

        for (name, value) in writes.lock().drain(..) {
            scope.set_variable(&name, value);
        }

        outcome.map_err(|err| {
            warn!("❌ Script failed in scope {}: {}", scope.scope_id(), err);
            err
        })
    }

    fn run_lua(
        &self,
        source: &str,
        variables: Map<String, Value>,
        writes: PendingWrites,
    ) -> Result<Value> {
        let lua = Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8,
            LuaOptions::default(),
        )
        .map_err(script_error)?;
        let globals = lua.globals();
        for name in ["require", "dofile", "loadfile", "load"] {
            globals.set(name, mlua::Nil).map_err(script_error)?;
        }

        for (name, value) in &variables {
            let converted = lua.to_value(value).map_err(script_error)?;
            globals.set(name.as_str(), converted).map_err(script_error)?;
        }

        let snapshot = Arc::new(variables);
        let reads = Arc::clone(&writes);
        let get_variable = lua
            .create_function(move |lua, name: String| {
                let pending = reads
                    .lock()
                    .iter()
                    .rev()
                    .find(|(written, _)| *written == name)
                    .map(|(_, value)| value.clone());
                let value = pending
                    .or_else(|| snapshot.get(&name).cloned())
                    .unwrap_or(Value::Null);
                lua.to_value(&value)
            })
            .map_err(script_error)?;
        globals.set("get_variable", get_variable).map_err(script_error)?;

        let set_variable = lua
            .create_function(move |_, (name, value): (String, mlua::Value)| {
                let json = lua_to_json(value).map_err(mlua::Error::external)?;
                writes.lock().push((name, json));
                Ok(())
            })
            .map_err(script_error)?;
        globals.set("set_variable", set_variable).map_err(script_error)?;

        let clock = Arc::clone(&self.clock);
        let now = lua
            .create_function(move |_, ()| Ok(clock.now().to_rfc3339()))
            .map_err(script_error)?;
        globals.set("now", now).map_err(script_error)?;

        let result = lua
            .load(source)
            .eval::<mlua::Value>()
            .map_err(script_error)?;
        lua_to_json(result)
    }
}

fn script_error(err: mlua::Error) -> PlatformError {
    PlatformError::Script(err.to_string())
}

/// Lua value to JSON; tables with keys `1..n` become arrays
pub fn lua_to_json(value: mlua::Value) -> Result<Value> {
    match value {
        mlua::Value::Nil => Ok(Value::Null),
        mlua::Value::Boolean(b) => Ok(Value::Bool(b)),
        mlua::Value::Integer(i) => Ok(Value::from(i)),
        mlua::Value::Number(f) => Ok(serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        mlua::Value::String(s) => {
            let text = s
                .to_str()
                .map_err(|e| PlatformError::Script(format!("Invalid UTF-8 in Lua string: {}", e)))?;
            Ok(Value::String(text.to_string()))
        }
        mlua::Value::Table(table) => {
            let mut is_array = true;
            let mut max_index = 0usize;
            let mut count = 0usize;

            for pair in table.pairs::<mlua::Value, mlua::Value>() {
                let (key, _) = pair.map_err(script_error)?;
                count += 1;
                match key {
                    mlua::Value::Integer(i) if i > 0 => max_index = max_index.max(i as usize),
                    _ => {
                        is_array = false;
                        break;
                    }
                }
            }

            if is_array && count > 0 && count == max_index {
                let mut items = Vec::with_capacity(max_index);
                for i in 1..=max_index {
                    let item: mlua::Value = table.get(i).map_err(script_error)?;
                    items.push(lua_to_json(item)?);
                }
                return Ok(Value::Array(items));
            }

            let mut object = Map::new();
            for pair in table.pairs::<mlua::Value, mlua::Value>() {
                let (key, item) = pair.map_err(script_error)?;
                let key = match key {
                    mlua::Value::String(s) => s
                        .to_str()
                        .map_err(|e| PlatformError::Script(format!("Invalid UTF-8 in Lua key: {}", e)))?
                        .to_string(),
                    mlua::Value::Integer(i) => i.to_string(),
                    mlua::Value::Number(f) => f.to_string(),
                    _ => continue,
                };
                object.insert(key, lua_to_json(item)?);
            }
            Ok(Value::Object(object))
        }
        _ => Ok(Value::Null),
    }
}
