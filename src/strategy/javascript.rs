//! JavaScript backend on the boa engine.
//!
//! The user code must define a top-level `process(context)` function. A
//! fresh VM is built per invocation, which is what makes strategies
//! stateless between runs; the harness below collects `emit`/`log` calls
//! into plain arrays and hands them back as one JSON document, so no
//! native callbacks cross the boundary. Loop-iteration and recursion
//! limits bound runaway scripts inside the VM.

use boa_engine::{js_string, Context, JsError, JsValue, Source};
use serde::Deserialize;
use serde_json::Value;

use super::{InvocationContext, RawOutcome, StrategyError};

const LOOP_ITERATION_LIMIT: u64 = 5_000_000;
const RECURSION_LIMIT: usize = 512;

const HARNESS: &str = r#"
var __emissions = [];
var __logs = [];
function __run() {
    var context = __context;
    context.emit = function (a, b) {
        if (arguments.length >= 2) {
            __emissions.push([String(a), b === undefined ? null : b]);
        } else {
            __emissions.push([null, a === undefined ? null : a]);
        }
    };
    context.log = function (m) { __logs.push(String(m)); };
    process(context);
}
"#;

#[derive(Deserialize)]
struct HarnessOutput {
    emissions: Vec<(Option<String>, Value)>,
    logs: Vec<String>,
}

/// Syntax-and-shape check: the code must evaluate and leave a callable
/// `process` behind.
pub(crate) fn compile(code: &str) -> Result<(), String> {
    let mut context = Context::default();
    context
        .eval(Source::from_bytes(code))
        .map_err(|e| e.to_string())?;
    let check = context
        .eval(Source::from_bytes("typeof process === 'function'"))
        .map_err(|e| e.to_string())?;
    if check.as_boolean() == Some(true) {
        Ok(())
    } else {
        Err("code must define a top-level process(context) function".to_string())
    }
}

pub(crate) fn run(code: &str, ctx: &InvocationContext) -> Result<RawOutcome, StrategyError> {
    let mut context = Context::default();
    let limits = context.runtime_limits_mut();
    limits.set_loop_iteration_limit(LOOP_ITERATION_LIMIT);
    limits.set_recursion_limit(RECURSION_LIMIT);

    context
        .eval(Source::from_bytes(code))
        .map_err(map_js_error)?;

    let ctx_value = JsValue::from_json(&ctx.to_json(), &mut context).map_err(map_js_error)?;
    context
        .global_object()
        .set(js_string!("__context"), ctx_value, false, &mut context)
        .map_err(map_js_error)?;

    context
        .eval(Source::from_bytes(HARNESS))
        .map_err(map_js_error)?;
    context
        .eval(Source::from_bytes("__run();"))
        .map_err(map_js_error)?;

    let raw = context
        .eval(Source::from_bytes(
            "JSON.stringify({ emissions: __emissions, logs: __logs })",
        ))
        .map_err(map_js_error)?;

    let serialized = raw
        .as_string()
        .map(|s| s.to_std_string_escaped())
        .ok_or_else(|| StrategyError::Runtime("harness produced no output".to_string()))?;

    let output: HarnessOutput = serde_json::from_str(&serialized)
        .map_err(|e| StrategyError::Runtime(format!("harness output unreadable: {}", e)))?;

    Ok(RawOutcome {
        emissions: output.emissions,
        logs: output.logs,
    })
}

/// Runtime-limit violations are the VM's way of saying the script ran
/// away; everything else is an ordinary script failure.
fn map_js_error(e: JsError) -> StrategyError {
    let message = e.to_string();
    if message.contains("limit") && message.contains("exceeded") {
        StrategyError::Timeout
    } else {
        StrategyError::Runtime(message)
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
            parameters: json!({"scale": 2}),
            last_outputs: last,
        }
    }

    #[test]
    fn emits_primary_value() {
        let out = run(
            "function process(context) { context.emit(context.inputs.a); }",
            &ctx(json!({"a": 42}), Value::Null),
        )
        .unwrap();
        assert_eq!(out.emissions, vec![(None, json!(42))]);
    }

    #[test]
    fn emits_to_subtopic_and_logs() {
        let out = run(
            r#"function process(context) {
                context.emit("/state", context.inputs.a);
                context.log("saw " + context.inputs.a);
            }"#,
            &ctx(json!({"a": 1}), Value::Null),
        )
        .unwrap();
        assert_eq!(out.emissions, vec![(Some("/state".to_string()), json!(1))]);
        assert_eq!(out.logs, vec!["saw 1".to_string()]);
    }

    #[test]
    fn sees_parameters_and_last_outputs() {
        let out = run(
            r#"function process(context) {
                context.emit((context.lastOutputs || 0) + context.parameters.scale);
            }"#,
            &ctx(json!({}), json!(10)),
        )
        .unwrap();
        assert_eq!(out.emissions, vec![(None, json!(12))]);
    }

    #[test]
    fn toggle_flips_null_to_true() {
        let code = "function process(context) { context.emit(!context.lastOutputs); }";
        let out = run(code, &ctx(json!({}), Value::Null)).unwrap();
        assert_eq!(out.emissions, vec![(None, json!(true))]);
        let out = run(code, &ctx(json!({}), json!(true))).unwrap();
        assert_eq!(out.emissions, vec![(None, json!(false))]);
    }

    #[test]
    fn infinite_loop_hits_vm_limit() {
        let err = run(
            "function process(context) { while (true) {} }",
            &ctx(json!({}), Value::Null),
        )
        .unwrap_err();
        assert!(matches!(err, StrategyError::Timeout));
    }

    #[test]
    fn throw_is_a_runtime_error() {
        let err = run(
            "function process(context) { throw new Error('boom'); }",
            &ctx(json!({}), Value::Null),
        )
        .unwrap_err();
        assert!(matches!(err, StrategyError::Runtime(_)));
    }

    #[test]
    fn compile_rejects_missing_process() {
        assert!(compile("var x = 1;").is_err());
        assert!(compile("function process(context) {}").is_ok());
        assert!(compile("function process(context) {").is_err());
    }
}
