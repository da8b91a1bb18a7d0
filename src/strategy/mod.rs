//! Strategy execution host.
//!
//! A strategy is user-supplied code bound to internal topics; the host
//! compiles it once, caches the program keyed by strategy id and version,
//! and invokes it with a uniform context:
//!
//! | field         | meaning                                              |
//! |---------------|------------------------------------------------------|
//! | `inputs`      | alias → current input value (null when absent)       |
//! | `parameters`  | the strategy's constant parameter bag                |
//! | `lastOutputs` | the topic's previous committed value                 |
//! | `trigger`     | input topic (or synthetic tag) that caused the run   |
//! | `emit(v)`     | emission on the topic's own name                     |
//! | `emit(p, v)`  | emission on `<topic>/<p>`                            |
//! | `log(msg)`    | diagnostic line                                      |
//!
//! Three backends hang off one dispatch point: JavaScript (boa), Lua
//! (mlua), and text templates (tera) where the rendered string is the
//! single emission. Invocations run on a blocking thread under a
//! wall-clock deadline; the VMs additionally carry their own iteration
//! and memory ceilings so a runaway script cannot outlive the deadline
//! by much. Any error discards every emission from that invocation.

pub mod host;
mod javascript;
mod lua;
mod template;

use serde_json::Value;
use thiserror::Error;

pub use host::StrategyHost;

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("compile error: {0}")]
    Compile(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("strategy exceeded its deadline")]
    Timeout,

    #[error("strategy exceeded its memory ceiling")]
    OutOfMemory,
}

impl StrategyError {
    /// Stable label used for metrics and the execution log.
    pub fn kind(&self) -> &'static str {
        match self {
            StrategyError::Compile(_) => "compile",
            StrategyError::Runtime(_) => "runtime",
            StrategyError::Timeout => "timeout",
            StrategyError::OutOfMemory => "oom",
        }
    }
}

/// Everything a single invocation sees.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// Name of the topic being evaluated; primary emissions land here.
    pub topic: String,
    pub trigger: String,
    pub inputs: serde_json::Map<String, Value>,
    pub parameters: Value,
    pub last_outputs: Value,
}

impl InvocationContext {
    /// The context object as the script sees it (minus the functions).
    pub(crate) fn to_json(&self) -> Value {
        serde_json::json!({
            "inputs": Value::Object(self.inputs.clone()),
            "parameters": self.parameters,
            "lastOutputs": self.last_outputs,
            "trigger": self.trigger,
        })
    }
}

/// One `emit` call, already resolved to a full topic name.
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub target: String,
    pub value: Value,
}

/// Result of a successful invocation.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub emissions: Vec<Emission>,
    pub logs: Vec<String>,
}

/// Backend-level outcome: emissions still carry the raw subpath.
#[derive(Debug, Default)]
pub(crate) struct RawOutcome {
    pub emissions: Vec<(Option<String>, Value)>,
    pub logs: Vec<String>,
}
