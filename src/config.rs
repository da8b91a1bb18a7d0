//! Application configuration loaded from a YAML file.
//!
//! All options carry serde defaults so a minimal (or empty) file yields a
//! runnable configuration. Validation happens once, before any subsystem
//! starts; a violation is a [`ConfigError`] and the process exits with
//! code 1.
//!
//! Recognized sections:
//!
//! ```text
//! mqtt:           broker url, client id, credentials, subscription patterns
//! database:       backend selection and connection string
//! web:            management API bind address and port
//! logging:        level and optional log file
//! system_topics:  ticker intervals
//! engine:         evaluator count, queue cap, chain depth, strategy timeout
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration failures detected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub web: WebSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub system_topics: SystemTopicsSection,
    #[serde(default)]
    pub engine: EngineSection,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct MqttSection {
    #[serde(default = "default_broker")]
    pub broker: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Subscription patterns routed into the engine at connect time.
    #[serde(default)]
    pub topics: Vec<String>,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            client_id: default_client_id(),
            username: None,
            password: None,
            topics: Vec::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    #[default]
    Sqlite,
    Postgres,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSection {
    #[serde(rename = "type", default)]
    pub kind: DatabaseKind,
    #[serde(default = "default_db_connection")]
    pub connection: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            kind: DatabaseKind::Sqlite,
            connection: default_db_connection(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct WebSection {
    #[serde(default = "default_web_port")]
    pub port: u16,
    #[serde(default = "default_web_bind")]
    pub bind: String,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            port: default_web_port(),
            bind: default_web_bind(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SystemTopicsSection {
    #[serde(default = "default_ticker_intervals")]
    pub ticker_intervals: Vec<String>,
}

impl Default for SystemTopicsSection {
    fn default() -> Self {
        Self {
            ticker_intervals: default_ticker_intervals(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    /// Evaluator worker count. 1 gives strict FIFO over the whole queue.
    #[serde(default = "default_evaluators")]
    pub evaluators: usize,
    /// Pending-job queue capacity; overflow drops with a logged warning.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Maximum generations of evaluations a single wave may produce.
    #[serde(default = "default_chain_depth_limit")]
    pub chain_depth_limit: u32,
    /// Wall-clock deadline for a single strategy invocation.
    #[serde(default = "default_strategy_timeout")]
    pub strategy_timeout: String,
    /// Execution-log rows kept by lazy pruning.
    #[serde(default = "default_log_retention")]
    pub log_retention: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            evaluators: default_evaluators(),
            queue_capacity: default_queue_capacity(),
            chain_depth_limit: default_chain_depth_limit(),
            strategy_timeout: default_strategy_timeout(),
            log_retention: default_log_retention(),
        }
    }
}

fn default_broker() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_client_id() -> String {
    "home-automation".to_string()
}

fn default_db_connection() -> String {
    "homeflow.db".to_string()
}

fn default_web_port() -> u16 {
    8080
}

fn default_web_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_ticker_intervals() -> Vec<String> {
    ["1s", "5s", "30s", "1m", "5m"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_evaluators() -> usize {
    1
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_chain_depth_limit() -> u32 {
    32
}

fn default_strategy_timeout() -> String {
    "2s".to_string()
}

fn default_log_retention() -> u64 {
    10_000
}

impl Config {
    /// Loads and validates the configuration file. A missing file yields
    /// the defaults; a malformed or invalid file is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
            serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                source: e,
            })?
        } else {
            Config::default()
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.web.port == 0 {
            return Err(ConfigError::Invalid(
                "web.port must be between 1 and 65535".to_string(),
            ));
        }

        broker_address(&self.mqtt.broker)?;

        if self.mqtt.client_id.is_empty() {
            return Err(ConfigError::Invalid(
                "mqtt.client_id must not be empty".to_string(),
            ));
        }

        for pattern in &self.mqtt.topics {
            if pattern.is_empty() {
                return Err(ConfigError::Invalid(
                    "mqtt.topics entries must not be empty".to_string(),
                ));
            }
        }

        if self.engine.evaluators == 0 {
            return Err(ConfigError::Invalid(
                "engine.evaluators must be at least 1".to_string(),
            ));
        }

        if self.engine.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "engine.queue_capacity must be at least 1".to_string(),
            ));
        }

        self.strategy_timeout()?;
        self.ticker_intervals()?;

        Ok(())
    }

    /// Parsed strategy deadline.
    pub fn strategy_timeout(&self) -> Result<Duration, ConfigError> {
        humantime::parse_duration(&self.engine.strategy_timeout).map_err(|e| {
            ConfigError::Invalid(format!(
                "engine.strategy_timeout '{}' is not a duration: {}",
                self.engine.strategy_timeout, e
            ))
        })
    }

    /// Parsed ticker intervals, keeping the original label for topic names
    /// (`system/ticker/<label>`).
    pub fn ticker_intervals(&self) -> Result<Vec<(String, Duration)>, ConfigError> {
        self.system_topics
            .ticker_intervals
            .iter()
            .map(|label| {
                humantime::parse_duration(label)
                    .map(|d| (label.clone(), d))
                    .map_err(|e| {
                        ConfigError::Invalid(format!(
                            "system_topics.ticker_intervals entry '{}' is not a duration: {}",
                            label, e
                        ))
                    })
            })
            .collect()
    }
}

/// Splits a broker URL into host and port, accepting the `mqtt://` and
/// `tcp://` schemes as well as a bare `host:port`.
pub fn broker_address(broker: &str) -> Result<(String, u16), ConfigError> {
    let stripped = broker
        .strip_prefix("mqtt://")
        .or_else(|| broker.strip_prefix("tcp://"))
        .unwrap_or(broker);

    let mut comps = stripped.split(':');
    let host = comps.next().unwrap_or("").to_string();
    let port = match comps.next() {
        Some(p) => p.parse::<u16>().map_err(|_| {
            ConfigError::Invalid(format!("mqtt.broker port '{}' is not a number", p))
        })?,
        None => 1883,
    };

    if host.is_empty() {
        return Err(ConfigError::Invalid(
            "mqtt.broker must name a host".to_string(),
        ));
    }

    Ok((host, port))
}
