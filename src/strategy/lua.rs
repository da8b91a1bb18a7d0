//! Lua backend (Lua 5.4, vendored).
//!
//! The user code must define a global `process(context)` function, called
//! with a table carrying the context fields plus `emit`/`log` closures.
//! A fresh VM per invocation keeps strategies stateless. The VM gets a
//! hard memory ceiling, and an instruction-count hook enforces the
//! wall-clock deadline from inside the interpreter.

use mlua::{Function, HookTriggers, Lua, LuaSerdeExt, Value as LuaValue, VmState};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::{InvocationContext, RawOutcome, StrategyError};

const MEMORY_LIMIT: usize = 16 * 1024 * 1024;
const HOOK_EVERY_INSTRUCTIONS: u32 = 10_000;

pub(crate) fn compile(code: &str) -> Result<(), String> {
    let lua = Lua::new();
    lua.load(code).exec().map_err(|e| e.to_string())?;
    lua.globals()
        .get::<Function>("process")
        .map(|_| ())
        .map_err(|_| "code must define a global process(context) function".to_string())
}

pub(crate) fn run(
    code: &str,
    ctx: &InvocationContext,
    deadline: Duration,
) -> Result<RawOutcome, StrategyError> {
    let lua = Lua::new();
    lua.set_memory_limit(MEMORY_LIMIT)
        .map_err(|e| StrategyError::Runtime(format!("memory limit rejected: {}", e)))?;

    let started = Instant::now();
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_EVERY_INSTRUCTIONS),
        move |_lua, _debug| {
            if started.elapsed() > deadline {
                Err(mlua::Error::RuntimeError("deadline exceeded".to_string()))
            } else {
                Ok(VmState::Continue)
            }
        },
    );

    lua.load(code).exec().map_err(map_lua_error)?;
    let process: Function = lua
        .globals()
        .get("process")
        .map_err(|_| StrategyError::Compile("no global process(context) function".to_string()))?;

    let emissions: Arc<Mutex<Vec<(Option<String>, Value)>>> = Arc::new(Mutex::new(Vec::new()));
    let logs: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let context = lua.create_table().map_err(map_lua_error)?;
    context
        .set(
            "inputs",
            lua.to_value(&Value::Object(ctx.inputs.clone()))
                .map_err(map_lua_error)?,
        )
        .map_err(map_lua_error)?;
    context
        .set(
            "parameters",
            lua.to_value(&ctx.parameters).map_err(map_lua_error)?,
        )
        .map_err(map_lua_error)?;
    context
        .set(
            "lastOutputs",
            lua.to_value(&ctx.last_outputs).map_err(map_lua_error)?,
        )
        .map_err(map_lua_error)?;
    context
        .set("trigger", ctx.trigger.as_str())
        .map_err(map_lua_error)?;

    let emit = {
        let emissions = emissions.clone();
        lua.create_function(
            move |lua, (first, second): (LuaValue, Option<LuaValue>)| {
                let pair = match second {
                    Some(value) => {
                        let subpath = match &first {
                            LuaValue::String(s) => s.to_string_lossy(),
                            _ => {
                                return Err(mlua::Error::RuntimeError(
                                    "emit(subpath, value): subpath must be a string".to_string(),
                                ))
                            }
                        };
                        (Some(subpath), lua.from_value::<Value>(value)?)
                    }
                    None => (None, lua.from_value::<Value>(first.clone())?),
                };
                if let Ok(mut emissions) = emissions.lock() {
                    emissions.push(pair);
                }
                Ok(())
            },
        )
        .map_err(map_lua_error)?
    };
    context.set("emit", emit).map_err(map_lua_error)?;

    let log = {
        let logs = logs.clone();
        lua.create_function(move |_lua, message: String| {
            if let Ok(mut logs) = logs.lock() {
                logs.push(message);
            }
            Ok(())
        })
        .map_err(map_lua_error)?
    };
    context.set("log", log).map_err(map_lua_error)?;

    process.call::<()>(context).map_err(map_lua_error)?;

    let emissions = emissions.lock().map(|e| e.clone()).unwrap_or_default();
    let logs = logs.lock().map(|l| l.clone()).unwrap_or_default();
    Ok(RawOutcome { emissions, logs })
}

fn map_lua_error(e: mlua::Error) -> StrategyError {
    if is_memory_error(&e) {
        return StrategyError::OutOfMemory;
    }
    let message = e.to_string();
    if message.contains("deadline exceeded") {
        StrategyError::Timeout
    } else {
        StrategyError::Runtime(message)
    }
}

fn is_memory_error(e: &mlua::Error) -> bool {
    match e {
        mlua::Error::MemoryError(_) => true,
        mlua::Error::CallbackError { cause, .. } => is_memory_error(cause),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(inputs: Value, last: Value) -> InvocationContext {
        InvocationContext {
            topic: "room/avg".to_string(),
            trigger: "sensor/a".to_string(),
            inputs: inputs.as_object().cloned().unwrap_or_default(),
            parameters: json!({}),
            last_outputs: last,
        }
    }

    const DEADLINE: Duration = Duration::from_millis(500);

    #[test]
    fn toggle_flips_boolean() {
        let code = "function process(context) context.emit(not context.lastOutputs) end";
        let out = run(code, &ctx(json!({}), Value::Null), DEADLINE).unwrap();
        assert_eq!(out.emissions, vec![(None, json!(true))]);
        let out = run(code, &ctx(json!({}), json!(true)), DEADLINE).unwrap();
        assert_eq!(out.emissions, vec![(None, json!(false))]);
    }

    #[test]
    fn subtopic_emission_and_log() {
        let code = r#"
            function process(context)
                context.emit("state", context.inputs.a)
                context.log("lua saw it")
            end
        "#;
        let out = run(code, &ctx(json!({"a": 7}), Value::Null), DEADLINE).unwrap();
        assert_eq!(out.emissions, vec![(Some("state".to_string()), json!(7))]);
        assert_eq!(out.logs, vec!["lua saw it".to_string()]);
    }

    #[test]
    fn busy_loop_hits_deadline() {
        let err = run(
            "function process(context) while true do end end",
            &ctx(json!({}), Value::Null),
            Duration::from_millis(50),
        )
        .unwrap_err();
        assert!(matches!(err, StrategyError::Timeout));
    }

    #[test]
    fn lua_error_is_runtime() {
        let err = run(
            "function process(context) error('boom') end",
            &ctx(json!({}), Value::Null),
            DEADLINE,
        )
        .unwrap_err();
        assert!(matches!(err, StrategyError::Runtime(_)));
    }

    #[test]
    fn compile_rejects_missing_process() {
        assert!(compile("x = 1").is_err());
        assert!(compile("function process(context) end").is_ok());
        assert!(compile("function process(context").is_err());
    }
}
