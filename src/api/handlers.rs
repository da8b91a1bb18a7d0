//! Request handlers and their response shapes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{created, fail, ok, registry_error, strategy_error, AppState};
use crate::strategy::StrategyHost;
use crate::topics::{ExecutionRecord, Strategy, StrategySpec, Topic, TopicKind, TopicSpec};

const LOG_TAIL: u32 = 50;

// ---- dashboard -----------------------------------------------------------

#[derive(Serialize)]
pub struct TopicCounts {
    pub external: usize,
    pub internal: usize,
    pub system: usize,
    pub total: usize,
}

#[derive(Serialize)]
pub struct DashboardData {
    pub topics: TopicCounts,
    pub strategies: usize,
    pub mqtt: String,
    pub messages_processed: u64,
}

pub async fn dashboard(State(state): State<Arc<AppState>>) -> Response {
    let counts = state.registry.counts();
    let external = counts.get(&TopicKind::External).copied().unwrap_or(0);
    let internal = counts.get(&TopicKind::Internal).copied().unwrap_or(0);
    let system = counts.get(&TopicKind::System).copied().unwrap_or(0);
    ok(DashboardData {
        topics: TopicCounts {
            external,
            internal,
            system,
            total: external + internal + system,
        },
        strategies: state.registry.strategy_count(),
        mqtt: state.mqtt.state().to_string(),
        messages_processed: state.metrics.messages_processed.get(),
    })
}

// ---- topics --------------------------------------------------------------

#[derive(Deserialize)]
pub struct ListTopicsQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
}

pub async fn list_topics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTopicsQuery>,
) -> Response {
    let kind = match query.kind.as_deref() {
        None => None,
        Some(raw) => match TopicKind::parse(raw) {
            Some(kind) => Some(kind),
            None => {
                return fail(
                    StatusCode::BAD_REQUEST,
                    "InvalidTopic",
                    format!("unknown topic type '{}'", raw),
                )
            }
        },
    };
    ok::<Vec<Topic>>(state.registry.list(kind))
}

#[derive(Deserialize)]
pub struct CreateTopicBody {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TopicKind,
    #[serde(flatten)]
    pub spec: TopicSpec,
}

pub async fn create_topic(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateTopicBody>,
) -> Response {
    match state.registry.create_topic(&body.name, body.kind, body.spec) {
        Ok(topic) => created(topic),
        Err(e) => registry_error(e),
    }
}

pub async fn get_topic(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.registry.get(&name) {
        Some(topic) => ok(topic),
        None => fail(
            StatusCode::NOT_FOUND,
            "NotFound",
            format!("topic '{}' not found", name),
        ),
    }
}

pub async fn update_topic(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(spec): Json<TopicSpec>,
) -> Response {
    match state.registry.update_topic(&name, spec) {
        Ok(topic) => ok(topic),
        Err(e) => registry_error(e),
    }
}

pub async fn delete_topic(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.registry.delete_topic(&name) {
        Ok(()) => ok(serde_json::json!({ "deleted": name })),
        Err(e) => registry_error(e),
    }
}

// ---- strategies ----------------------------------------------------------

pub async fn list_strategies(State(state): State<Arc<AppState>>) -> Response {
    ok::<Vec<Strategy>>(state.registry.list_strategies())
}

pub async fn create_strategy(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<StrategySpec>,
) -> Response {
    if let Err(e) = StrategyHost::compile_check(spec.language, &spec.code) {
        return strategy_error(e);
    }
    match state.registry.create_strategy(spec) {
        Ok(strategy) => created(strategy),
        Err(e) => registry_error(e),
    }
}

pub async fn get_strategy(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    match state.registry.get_strategy(id) {
        Some(strategy) => ok(strategy),
        None => fail(
            StatusCode::NOT_FOUND,
            "NotFound",
            format!("strategy {} not found", id),
        ),
    }
}

pub async fn update_strategy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(spec): Json<StrategySpec>,
) -> Response {
    if let Err(e) = StrategyHost::compile_check(spec.language, &spec.code) {
        return strategy_error(e);
    }
    match state.registry.update_strategy(id, spec) {
        Ok(strategy) => ok(strategy),
        Err(e) => registry_error(e),
    }
}

pub async fn delete_strategy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Response {
    match state.registry.delete_strategy(id) {
        Ok(()) => {
            state.host.invalidate(id);
            ok(serde_json::json!({ "deleted": id }))
        }
        Err(e) => registry_error(e),
    }
}

// ---- system --------------------------------------------------------------

#[derive(Serialize)]
pub struct ProcessInfo {
    pub version: &'static str,
    pub uptime_seconds: u64,
}

#[derive(Serialize)]
pub struct DatabaseInfo {
    pub backend: String,
}

#[derive(Serialize)]
pub struct MqttInfo {
    pub state: String,
}

#[derive(Serialize)]
pub struct SystemData {
    pub process: ProcessInfo,
    pub database: DatabaseInfo,
    pub mqtt: MqttInfo,
    pub recent_executions: Vec<ExecutionRecord>,
}

pub async fn system(State(state): State<Arc<AppState>>) -> Response {
    let recent = match state.store.recent_executions(LOG_TAIL) {
        Ok(recent) => recent,
        Err(e) => {
            return fail(
                StatusCode::INTERNAL_SERVER_ERROR,
                "PersistenceError",
                e.to_string(),
            )
        }
    };
    ok(SystemData {
        process: ProcessInfo {
            version: env!("CARGO_PKG_VERSION"),
            uptime_seconds: state.started_at.elapsed().as_secs(),
        },
        database: DatabaseInfo {
            backend: state.database.clone(),
        },
        mqtt: MqttInfo {
            state: state.mqtt.state().to_string(),
        },
        recent_executions: recent,
    })
}

// ---- metrics -------------------------------------------------------------

pub async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics.export()
}
