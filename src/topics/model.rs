//! Core records: topics, strategies, execution log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Topic categories. The kind decides where values come from: the broker
/// (external), a strategy (internal), or the engine itself (system).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicKind {
    External,
    Internal,
    System,
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicKind::External => write!(f, "external"),
            TopicKind::Internal => write!(f, "internal"),
            TopicKind::System => write!(f, "system"),
        }
    }
}

impl TopicKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "external" => Some(TopicKind::External),
            "internal" => Some(TopicKind::Internal),
            "system" => Some(TopicKind::System),
            _ => None,
        }
    }
}

/// A named slot holding the last value produced for a stream.
///
/// `name` is the identity and is immutable once created. Internal topics
/// without a `strategy_id` are "child" topics: they receive values only
/// through a parent strategy's sub-topic emissions and never run a
/// strategy themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,
    pub kind: TopicKind,
    /// Topic names this topic reads. Empty for external/system topics.
    pub inputs: Vec<String>,
    /// Input topic name → alias visible to the strategy. Injective over
    /// the configured inputs; missing entries default to the topic name.
    pub input_names: HashMap<String, String>,
    pub strategy_id: Option<i64>,
    /// Committed values are re-published to MQTT (retained) when set.
    pub emit_to_mqtt: bool,
    /// Committed values equal to the previous value suppress propagation.
    pub noop_unchanged: bool,
    pub last_value: Option<Value>,
    pub last_updated: Option<DateTime<Utc>>,
    /// Free-form bag; system topics carry `interval` or `cron` here.
    pub config: Value,
    pub created_at: DateTime<Utc>,
}

impl Topic {
    /// Alias under which `input` is presented to the strategy.
    pub fn alias_for<'a>(&'a self, input: &'a str) -> &'a str {
        self.input_names.get(input).map(String::as_str).unwrap_or(input)
    }

    /// Child topics are internal topics with no strategy bound.
    pub fn is_child(&self) -> bool {
        self.kind == TopicKind::Internal && self.strategy_id.is_none()
    }

    /// Cron expression from the config bag, if any.
    pub fn cron_expr(&self) -> Option<&str> {
        self.config.get("cron").and_then(Value::as_str)
    }
}

/// Prefix taxonomy for `state` table keys.
pub fn state_key(topic: &Topic) -> String {
    let prefix = match topic.kind {
        TopicKind::External => "external",
        TopicKind::System => "system",
        TopicKind::Internal => {
            if topic.strategy_id.is_none() {
                "child"
            } else {
                "internal"
            }
        }
    };
    format!("{}:{}", prefix, topic.name)
}

/// Mutable subset of a topic accepted by the management API. `name` and
/// `kind` fix the identity at creation; updates keep both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicSpec {
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub input_names: HashMap<String, String>,
    #[serde(default)]
    pub strategy_id: Option<i64>,
    #[serde(default)]
    pub emit_to_mqtt: bool,
    #[serde(default)]
    pub noop_unchanged: bool,
    #[serde(default = "default_config")]
    pub config: Value,
}

fn default_config() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Default for TopicSpec {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            input_names: HashMap::new(),
            strategy_id: None,
            emit_to_mqtt: false,
            noop_unchanged: false,
            config: default_config(),
        }
    }
}

/// Script languages the strategy host can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyLanguage {
    Javascript,
    Lua,
    /// Text-template rendering; the rendered string is the emission.
    Template,
}

impl fmt::Display for StrategyLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyLanguage::Javascript => write!(f, "javascript"),
            StrategyLanguage::Lua => write!(f, "lua"),
            StrategyLanguage::Template => write!(f, "template"),
        }
    }
}

impl StrategyLanguage {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "javascript" => Some(StrategyLanguage::Javascript),
            "lua" => Some(StrategyLanguage::Lua),
            "template" => Some(StrategyLanguage::Template),
            _ => None,
        }
    }
}

/// User-supplied code invoked with a context to compute topic values.
/// Shared across topics; edits are visible to every bound topic on the
/// next evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub language: StrategyLanguage,
    /// Constant bag handed to every invocation.
    pub parameters: Value,
    /// Upper bound on a bound topic's input count; 0 means unlimited.
    pub max_inputs: u32,
    /// Positional alias seeds applied when a topic wires this strategy
    /// without explicit aliases.
    pub default_input_names: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Mutable subset of a strategy accepted by the management API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySpec {
    pub name: String,
    pub code: String,
    pub language: StrategyLanguage,
    #[serde(default = "default_config")]
    pub parameters: Value,
    #[serde(default)]
    pub max_inputs: u32,
    #[serde(default)]
    pub default_input_names: Vec<String>,
}

/// One row of the append-only execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: i64,
    pub topic_name: String,
    pub strategy_id: Option<i64>,
    /// The input whose change caused the evaluation, or a synthetic tag
    /// (`ticker`, `schedule`, `mqtt`, `system`).
    pub trigger_topic: String,
    pub input_values: Value,
    pub output_values: Value,
    pub error_message: Option<String>,
    pub execution_time_ms: i64,
    pub executed_at: DateTime<Utc>,
}
