//! Persistence of topics, strategies, last values, and execution history.
//!
//! The engine talks to a narrow [`Store`] trait; the SQLite implementation
//! in [`sqlite`] is the default backend. Writes are single statements or
//! small local transactions; the engine never holds a long-lived
//! transaction, and a serialized writer is acceptable.
//!
//! Every call is instrumented with a counter and a latency histogram
//! labeled `operation × mode` so slow queries show up in `/metrics`.

pub mod sqlite;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::topics::{ExecutionRecord, Strategy, StrategySpec, Topic, TopicKind};

pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("corrupt row for {entity} '{key}': {detail}")]
    CorruptRow {
        entity: &'static str,
        key: String,
        detail: String,
    },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(e: r2d2::Error) -> Self {
        StoreError::Pool(e.to_string())
    }
}

/// Narrow persistence interface the engine and registry depend on.
pub trait Store: Send + Sync {
    // Topics
    fn load_topics(&self) -> Result<Vec<Topic>, StoreError>;
    fn get_topic(&self, name: &str) -> Result<Option<Topic>, StoreError>;
    fn list_topics(&self, kind: Option<TopicKind>) -> Result<Vec<Topic>, StoreError>;
    fn upsert_topic(&self, topic: &Topic) -> Result<(), StoreError>;
    fn delete_topic(&self, name: &str) -> Result<(), StoreError>;
    /// Atomic read-modify-write of `last_value` + `last_updated`.
    fn update_topic_value(
        &self,
        name: &str,
        value: &Value,
        ts: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // Strategies
    fn load_strategies(&self) -> Result<Vec<Strategy>, StoreError>;
    fn insert_strategy(&self, spec: &StrategySpec) -> Result<Strategy, StoreError>;
    fn update_strategy(&self, strategy: &Strategy) -> Result<(), StoreError>;
    fn delete_strategy(&self, id: i64) -> Result<(), StoreError>;

    // State key-value
    fn get_state(&self, key: &str) -> Result<Option<Value>, StoreError>;
    fn put_state(&self, key: &str, value: &Value, ts: DateTime<Utc>) -> Result<(), StoreError>;
    fn delete_state(&self, key: &str) -> Result<(), StoreError>;

    // Execution log
    fn append_execution(&self, entry: &ExecutionRecord) -> Result<(), StoreError>;
    fn recent_executions(&self, limit: u32) -> Result<Vec<ExecutionRecord>, StoreError>;
}
