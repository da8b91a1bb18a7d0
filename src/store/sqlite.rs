//! SQLite persistence backend.
//!
//! Uses a small r2d2 connection pool with WAL journaling and foreign keys
//! on. The schema is bootstrapped on open; four tables, six indexes. Log
//! retention is enforced lazily: every [`PRUNE_EVERY`]-th append trims the
//! `execution_log` table down to the configured row count.

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{Store, StoreError};
use crate::metrics::Metrics;
use crate::topics::{
    ExecutionRecord, Strategy, StrategyLanguage, StrategySpec, Topic, TopicKind,
};

/// Appends between lazy retention sweeps of the execution log.
const PRUNE_EVERY: u64 = 256;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS strategies (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    name                TEXT NOT NULL,
    code                TEXT NOT NULL,
    language            TEXT NOT NULL,
    parameters          TEXT NOT NULL DEFAULT '{}',
    max_inputs          INTEGER NOT NULL DEFAULT 0,
    default_input_names TEXT NOT NULL DEFAULT '[]',
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS topics (
    name           TEXT PRIMARY KEY,
    type           TEXT NOT NULL,
    inputs         TEXT NOT NULL DEFAULT '[]',
    input_names    TEXT NOT NULL DEFAULT '{}',
    strategy_id    INTEGER REFERENCES strategies(id),
    emit_to_mqtt   INTEGER NOT NULL DEFAULT 0,
    noop_unchanged INTEGER NOT NULL DEFAULT 0,
    last_value     TEXT,
    last_updated   TEXT,
    config         TEXT NOT NULL DEFAULT '{}',
    created_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS state (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS execution_log (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    topic_name        TEXT NOT NULL,
    strategy_id       INTEGER,
    trigger_topic     TEXT NOT NULL,
    input_values      TEXT NOT NULL DEFAULT '{}',
    output_values     TEXT NOT NULL DEFAULT '{}',
    error_message     TEXT,
    execution_time_ms INTEGER NOT NULL DEFAULT 0,
    executed_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_topics_type ON topics(type);
CREATE INDEX IF NOT EXISTS idx_topics_last_updated ON topics(last_updated);
CREATE INDEX IF NOT EXISTS idx_strategies_name ON strategies(name);
CREATE INDEX IF NOT EXISTS idx_execution_log_topic ON execution_log(topic_name);
CREATE INDEX IF NOT EXISTS idx_execution_log_executed_at ON execution_log(executed_at);
CREATE INDEX IF NOT EXISTS idx_state_updated_at ON state(updated_at);
"#;

pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
    metrics: Arc<Metrics>,
    log_retention: u64,
    appends: AtomicU64,
}

impl SqliteStore {
    /// Opens (or creates) the database file and bootstraps the schema.
    pub fn open(
        path: &Path,
        metrics: Arc<Metrics>,
        log_retention: u64,
    ) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;",
            )
        });
        let pool = Pool::builder().max_size(4).build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(SCHEMA)?;
        info!("sqlite store opened at {}", path.display());

        Ok(Self {
            pool,
            metrics,
            log_retention,
            appends: AtomicU64::new(0),
        })
    }

    fn observe<T>(
        &self,
        operation: &str,
        mode: &str,
        f: impl FnOnce(&rusqlite::Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.metrics
            .store_queries
            .with_label_values(&[operation, mode])
            .inc();
        let timer = self
            .metrics
            .store_query_seconds
            .with_label_values(&[operation, mode])
            .start_timer();
        let conn = self.pool.get()?;
        let result = f(&conn);
        timer.observe_duration();
        result
    }

    fn prune_log(&self, conn: &rusqlite::Connection) -> Result<(), StoreError> {
        let removed = conn.execute(
            "DELETE FROM execution_log
             WHERE id NOT IN (SELECT id FROM execution_log ORDER BY id DESC LIMIT ?1)",
            params![self.log_retention as i64],
        )?;
        if removed > 0 {
            debug!("pruned {} execution log rows", removed);
        }
        Ok(())
    }
}

fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn decode_ts(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{}': {}", raw, e))
}

fn decode_json(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("bad json: {}", e))
}

fn topic_from_row(row: &Row<'_>) -> Result<Topic, StoreError> {
    let name: String = row.get(0)?;
    let corrupt = |detail: String| StoreError::CorruptRow {
        entity: "topic",
        key: name.clone(),
        detail,
    };

    let kind_raw: String = row.get(1)?;
    let kind = TopicKind::parse(&kind_raw)
        .ok_or_else(|| corrupt(format!("unknown topic type '{}'", kind_raw)))?;

    let inputs_raw: String = row.get(2)?;
    let inputs: Vec<String> =
        serde_json::from_str(&inputs_raw).map_err(|e| corrupt(format!("inputs: {}", e)))?;

    let aliases_raw: String = row.get(3)?;
    let input_names: HashMap<String, String> =
        serde_json::from_str(&aliases_raw).map_err(|e| corrupt(format!("input_names: {}", e)))?;

    let last_value = row
        .get::<_, Option<String>>(7)?
        .map(|raw| decode_json(&raw))
        .transpose()
        .map_err(&corrupt)?;

    let last_updated = row
        .get::<_, Option<String>>(8)?
        .map(|raw| decode_ts(&raw))
        .transpose()
        .map_err(&corrupt)?;

    let config_raw: String = row.get(9)?;
    let config = decode_json(&config_raw).map_err(&corrupt)?;

    let created_raw: String = row.get(10)?;
    let created_at = decode_ts(&created_raw).map_err(&corrupt)?;

    Ok(Topic {
        kind,
        inputs,
        input_names,
        strategy_id: row.get(4)?,
        emit_to_mqtt: row.get::<_, i64>(5)? != 0,
        noop_unchanged: row.get::<_, i64>(6)? != 0,
        last_value,
        last_updated,
        config,
        created_at,
        name,
    })
}

fn strategy_from_row(row: &Row<'_>) -> Result<Strategy, StoreError> {
    let id: i64 = row.get(0)?;
    let corrupt = |detail: String| StoreError::CorruptRow {
        entity: "strategy",
        key: id.to_string(),
        detail,
    };

    let language_raw: String = row.get(3)?;
    let language = StrategyLanguage::parse(&language_raw)
        .ok_or_else(|| corrupt(format!("unknown language '{}'", language_raw)))?;

    let parameters_raw: String = row.get(4)?;
    let parameters = decode_json(&parameters_raw).map_err(&corrupt)?;

    let defaults_raw: String = row.get(6)?;
    let default_input_names: Vec<String> = serde_json::from_str(&defaults_raw)
        .map_err(|e| corrupt(format!("default_input_names: {}", e)))?;

    let created_raw: String = row.get(7)?;
    let updated_raw: String = row.get(8)?;

    Ok(Strategy {
        id,
        name: row.get(1)?,
        code: row.get(2)?,
        language,
        parameters,
        max_inputs: row.get::<_, i64>(5)? as u32,
        default_input_names,
        created_at: decode_ts(&created_raw).map_err(&corrupt)?,
        updated_at: decode_ts(&updated_raw).map_err(&corrupt)?,
    })
}

const TOPIC_COLUMNS: &str = "name, type, inputs, input_names, strategy_id, emit_to_mqtt, \
                             noop_unchanged, last_value, last_updated, config, created_at";
const STRATEGY_COLUMNS: &str = "id, name, code, language, parameters, max_inputs, \
                                default_input_names, created_at, updated_at";

impl Store for SqliteStore {
    fn load_topics(&self) -> Result<Vec<Topic>, StoreError> {
        self.list_topics(None)
    }

    fn get_topic(&self, name: &str) -> Result<Option<Topic>, StoreError> {
        self.observe("get_topic", "read", |conn| {
            let sql = format!("SELECT {} FROM topics WHERE name = ?1", TOPIC_COLUMNS);
            let mut stmt = conn.prepare_cached(&sql)?;
            let topic = stmt
                .query_row(params![name], |row| {
                    Ok(topic_from_row(row))
                })
                .optional()?;
            topic.transpose()
        })
    }

    fn list_topics(&self, kind: Option<TopicKind>) -> Result<Vec<Topic>, StoreError> {
        self.observe("list_topics", "read", |conn| {
            let mut topics = Vec::new();
            match kind {
                Some(kind) => {
                    let sql = format!(
                        "SELECT {} FROM topics WHERE type = ?1 ORDER BY name",
                        TOPIC_COLUMNS
                    );
                    let mut stmt = conn.prepare_cached(&sql)?;
                    let rows = stmt.query_map(params![kind.to_string()], |row| {
                        Ok(topic_from_row(row))
                    })?;
                    for row in rows {
                        topics.push(row??);
                    }
                }
                None => {
                    let sql = format!("SELECT {} FROM topics ORDER BY name", TOPIC_COLUMNS);
                    let mut stmt = conn.prepare_cached(&sql)?;
                    let rows = stmt.query_map([], |row| Ok(topic_from_row(row)))?;
                    for row in rows {
                        topics.push(row??);
                    }
                }
            }
            Ok(topics)
        })
    }

    fn upsert_topic(&self, topic: &Topic) -> Result<(), StoreError> {
        self.observe("upsert_topic", "write", |conn| {
            conn.execute(
                "INSERT INTO topics (name, type, inputs, input_names, strategy_id, emit_to_mqtt,
                                     noop_unchanged, last_value, last_updated, config, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(name) DO UPDATE SET
                     type = excluded.type,
                     inputs = excluded.inputs,
                     input_names = excluded.input_names,
                     strategy_id = excluded.strategy_id,
                     emit_to_mqtt = excluded.emit_to_mqtt,
                     noop_unchanged = excluded.noop_unchanged,
                     config = excluded.config",
                params![
                    topic.name,
                    topic.kind.to_string(),
                    serde_json::to_string(&topic.inputs).unwrap_or_else(|_| "[]".to_string()),
                    serde_json::to_string(&topic.input_names)
                        .unwrap_or_else(|_| "{}".to_string()),
                    topic.strategy_id,
                    topic.emit_to_mqtt as i64,
                    topic.noop_unchanged as i64,
                    topic.last_value.as_ref().map(|v| v.to_string()),
                    topic.last_updated.map(encode_ts),
                    topic.config.to_string(),
                    encode_ts(topic.created_at),
                ],
            )?;
            Ok(())
        })
    }

    fn delete_topic(&self, name: &str) -> Result<(), StoreError> {
        self.observe("delete_topic", "write", |conn| {
            conn.execute("DELETE FROM topics WHERE name = ?1", params![name])?;
            Ok(())
        })
    }

    fn update_topic_value(
        &self,
        name: &str,
        value: &Value,
        ts: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.observe("update_topic_value", "write", |conn| {
            let changed = conn.execute(
                "UPDATE topics SET last_value = ?2, last_updated = ?3 WHERE name = ?1",
                params![name, value.to_string(), encode_ts(ts)],
            )?;
            if changed == 0 {
                return Err(StoreError::Database(format!(
                    "topic '{}' does not exist",
                    name
                )));
            }
            Ok(())
        })
    }

    fn load_strategies(&self) -> Result<Vec<Strategy>, StoreError> {
        self.observe("load_strategies", "read", |conn| {
            let sql = format!("SELECT {} FROM strategies ORDER BY id", STRATEGY_COLUMNS);
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map([], |row| Ok(strategy_from_row(row)))?;
            let mut strategies = Vec::new();
            for row in rows {
                strategies.push(row??);
            }
            Ok(strategies)
        })
    }

    fn insert_strategy(&self, spec: &StrategySpec) -> Result<Strategy, StoreError> {
        self.observe("insert_strategy", "write", |conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO strategies (name, code, language, parameters, max_inputs,
                                         default_input_names, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    spec.name,
                    spec.code,
                    spec.language.to_string(),
                    spec.parameters.to_string(),
                    spec.max_inputs as i64,
                    serde_json::to_string(&spec.default_input_names)
                        .unwrap_or_else(|_| "[]".to_string()),
                    encode_ts(now),
                ],
            )?;
            Ok(Strategy {
                id: conn.last_insert_rowid(),
                name: spec.name.clone(),
                code: spec.code.clone(),
                language: spec.language,
                parameters: spec.parameters.clone(),
                max_inputs: spec.max_inputs,
                default_input_names: spec.default_input_names.clone(),
                created_at: now,
                updated_at: now,
            })
        })
    }

    fn update_strategy(&self, strategy: &Strategy) -> Result<(), StoreError> {
        self.observe("update_strategy", "write", |conn| {
            let changed = conn.execute(
                "UPDATE strategies SET name = ?2, code = ?3, language = ?4, parameters = ?5,
                                       max_inputs = ?6, default_input_names = ?7, updated_at = ?8
                 WHERE id = ?1",
                params![
                    strategy.id,
                    strategy.name,
                    strategy.code,
                    strategy.language.to_string(),
                    strategy.parameters.to_string(),
                    strategy.max_inputs as i64,
                    serde_json::to_string(&strategy.default_input_names)
                        .unwrap_or_else(|_| "[]".to_string()),
                    encode_ts(strategy.updated_at),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::Database(format!(
                    "strategy {} does not exist",
                    strategy.id
                )));
            }
            Ok(())
        })
    }

    fn delete_strategy(&self, id: i64) -> Result<(), StoreError> {
        self.observe("delete_strategy", "write", |conn| {
            conn.execute("DELETE FROM strategies WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    fn get_state(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.observe("get_state", "read", |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value FROM state WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|raw| {
                decode_json(&raw).map_err(|detail| StoreError::CorruptRow {
                    entity: "state",
                    key: key.to_string(),
                    detail,
                })
            })
            .transpose()
        })
    }

    fn put_state(&self, key: &str, value: &Value, ts: DateTime<Utc>) -> Result<(), StoreError> {
        self.observe("put_state", "write", |conn| {
            conn.execute(
                "INSERT INTO state (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                updated_at = excluded.updated_at",
                params![key, value.to_string(), encode_ts(ts)],
            )?;
            Ok(())
        })
    }

    fn delete_state(&self, key: &str) -> Result<(), StoreError> {
        self.observe("delete_state", "write", |conn| {
            conn.execute("DELETE FROM state WHERE key = ?1", params![key])?;
            Ok(())
        })
    }

    fn append_execution(&self, entry: &ExecutionRecord) -> Result<(), StoreError> {
        self.observe("append_execution", "write", |conn| {
            conn.execute(
                "INSERT INTO execution_log (topic_name, strategy_id, trigger_topic, input_values,
                                            output_values, error_message, execution_time_ms,
                                            executed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.topic_name,
                    entry.strategy_id,
                    entry.trigger_topic,
                    entry.input_values.to_string(),
                    entry.output_values.to_string(),
                    entry.error_message,
                    entry.execution_time_ms,
                    encode_ts(entry.executed_at),
                ],
            )?;

            let appended = self.appends.fetch_add(1, Ordering::Relaxed) + 1;
            if appended % PRUNE_EVERY == 0 {
                if let Err(e) = self.prune_log(conn) {
                    warn!("execution log pruning failed: {}", e);
                }
            }
            Ok(())
        })
    }

    fn recent_executions(&self, limit: u32) -> Result<Vec<ExecutionRecord>, StoreError> {
        self.observe("recent_executions", "read", |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, topic_name, strategy_id, trigger_topic, input_values, output_values,
                        error_message, execution_time_ms, executed_at
                 FROM execution_log ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                let id: i64 = row.get(0)?;
                let input_raw: String = row.get(4)?;
                let output_raw: String = row.get(5)?;
                let executed_raw: String = row.get(8)?;
                Ok((
                    id,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, String>(3)?,
                    input_raw,
                    output_raw,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, i64>(7)?,
                    executed_raw,
                ))
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let (id, topic_name, strategy_id, trigger_topic, input_raw, output_raw, error, ms, executed_raw) =
                    row?;
                let corrupt = |detail: String| StoreError::CorruptRow {
                    entity: "execution_log",
                    key: id.to_string(),
                    detail,
                };
                entries.push(ExecutionRecord {
                    id,
                    topic_name,
                    strategy_id,
                    trigger_topic,
                    input_values: decode_json(&input_raw).map_err(&corrupt)?,
                    output_values: decode_json(&output_raw).map_err(&corrupt)?,
                    error_message: error,
                    execution_time_ms: ms,
                    executed_at: decode_ts(&executed_raw).map_err(&corrupt)?,
                });
            }
            Ok(entries)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_store(retention: u64) -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(
            &dir.path().join("test.db"),
            Arc::new(Metrics::new()),
            retention,
        )
        .unwrap();
        (dir, store)
    }

    fn sample_topic(name: &str) -> Topic {
        Topic {
            name: name.to_string(),
            kind: TopicKind::Internal,
            inputs: vec!["sensor/a".to_string()],
            input_names: HashMap::from([("sensor/a".to_string(), "a".to_string())]),
            strategy_id: None,
            emit_to_mqtt: true,
            noop_unchanged: true,
            last_value: None,
            last_updated: None,
            config: json!({}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn topic_round_trip() {
        let (_dir, store) = open_store(100);
        let topic = sample_topic("room/avg");
        store.upsert_topic(&topic).unwrap();

        let loaded = store.get_topic("room/avg").unwrap().unwrap();
        assert_eq!(loaded.name, "room/avg");
        assert_eq!(loaded.kind, TopicKind::Internal);
        assert_eq!(loaded.inputs, vec!["sensor/a".to_string()]);
        assert_eq!(loaded.input_names.get("sensor/a").unwrap(), "a");
        assert!(loaded.emit_to_mqtt);
        assert!(loaded.last_value.is_none());

        store.delete_topic("room/avg").unwrap();
        assert!(store.get_topic("room/avg").unwrap().is_none());
    }

    #[test]
    fn update_topic_value_persists() {
        let (_dir, store) = open_store(100);
        store.upsert_topic(&sample_topic("room/avg")).unwrap();

        let ts = Utc::now();
        store
            .update_topic_value("room/avg", &json!(21.5), ts)
            .unwrap();

        let loaded = store.get_topic("room/avg").unwrap().unwrap();
        assert_eq!(loaded.last_value, Some(json!(21.5)));
        assert!(loaded.last_updated.is_some());
    }

    #[test]
    fn update_value_of_missing_topic_fails() {
        let (_dir, store) = open_store(100);
        assert!(store
            .update_topic_value("ghost", &json!(1), Utc::now())
            .is_err());
    }

    #[test]
    fn list_topics_filters_by_kind() {
        let (_dir, store) = open_store(100);
        let mut external = sample_topic("sensor/x");
        external.kind = TopicKind::External;
        external.inputs.clear();
        external.input_names.clear();
        store.upsert_topic(&external).unwrap();
        store.upsert_topic(&sample_topic("room/avg")).unwrap();

        let externals = store.list_topics(Some(TopicKind::External)).unwrap();
        assert_eq!(externals.len(), 1);
        assert_eq!(externals[0].name, "sensor/x");
        assert_eq!(store.load_topics().unwrap().len(), 2);
    }

    #[test]
    fn strategy_round_trip() {
        let (_dir, store) = open_store(100);
        let spec = StrategySpec {
            name: "toggle".to_string(),
            code: "function process(context) { context.emit(!context.lastOutputs); }".to_string(),
            language: StrategyLanguage::Javascript,
            parameters: json!({"start": false}),
            max_inputs: 1,
            default_input_names: vec!["value".to_string()],
        };
        let created = store.insert_strategy(&spec).unwrap();
        assert!(created.id > 0);

        let mut updated = created.clone();
        updated.code = "function process(context) { context.emit(true); }".to_string();
        updated.updated_at = Utc::now();
        store.update_strategy(&updated).unwrap();

        let loaded = store.load_strategies().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].code, updated.code);
        assert_eq!(loaded[0].max_inputs, 1);
        assert_eq!(loaded[0].default_input_names, vec!["value".to_string()]);

        store.delete_strategy(created.id).unwrap();
        assert!(store.load_strategies().unwrap().is_empty());
    }

    #[test]
    fn state_round_trip() {
        let (_dir, store) = open_store(100);
        store
            .put_state("internal:room/avg", &json!(21.5), Utc::now())
            .unwrap();
        assert_eq!(
            store.get_state("internal:room/avg").unwrap(),
            Some(json!(21.5))
        );

        store
            .put_state("internal:room/avg", &json!(22.0), Utc::now())
            .unwrap();
        assert_eq!(
            store.get_state("internal:room/avg").unwrap(),
            Some(json!(22.0))
        );

        store.delete_state("internal:room/avg").unwrap();
        assert_eq!(store.get_state("internal:room/avg").unwrap(), None);
    }

    fn sample_execution(n: i64) -> ExecutionRecord {
        ExecutionRecord {
            id: 0,
            topic_name: "room/avg".to_string(),
            strategy_id: Some(1),
            trigger_topic: "sensor/a".to_string(),
            input_values: json!({"a": n}),
            output_values: json!({"room/avg": n}),
            error_message: None,
            execution_time_ms: 3,
            executed_at: Utc::now(),
        }
    }

    #[test]
    fn recent_executions_newest_first() {
        let (_dir, store) = open_store(100);
        for n in 0..5 {
            store.append_execution(&sample_execution(n)).unwrap();
        }
        let recent = store.recent_executions(3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].input_values, json!({"a": 4}));
        assert_eq!(recent[2].input_values, json!({"a": 2}));
    }

    #[test]
    fn log_retention_prunes_lazily() {
        let (_dir, store) = open_store(10);
        for n in 0..(PRUNE_EVERY as i64) {
            store.append_execution(&sample_execution(n)).unwrap();
        }
        let recent = store.recent_executions(1000).unwrap();
        assert!(recent.len() <= 10, "kept {} rows", recent.len());
    }
}
