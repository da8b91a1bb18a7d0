//! HTTP/JSON management API.
//!
//! Serves the dashboard, topic and strategy CRUD, system info, and the
//! Prometheus exposition. Every payload rides in the same envelope:
//!
//! ```json
//! { "success": true,  "data": { … } }
//! { "success": false, "error": { "code": "CycleDetected", "message": "…" } }
//! ```
//!
//! Mutations are synchronous: a 2xx means the registry and the store
//! already agree. Graph violations map to 4xx with the error kind as the
//! `code`; persistence failures to 500.

pub mod handlers;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::metrics::Metrics;
use crate::mqtt::MqttHandle;
use crate::store::Store;
use crate::strategy::{StrategyError, StrategyHost};
use crate::topics::{Registry, RegistryError};

/// Shared state behind every handler.
pub struct AppState {
    pub registry: Arc<Registry>,
    pub store: Arc<dyn Store>,
    pub host: Arc<StrategyHost>,
    pub mqtt: MqttHandle,
    pub metrics: Arc<Metrics>,
    pub started_at: Instant,
    pub database: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/dashboard", get(handlers::dashboard))
        .route(
            "/api/v1/topics",
            get(handlers::list_topics).post(handlers::create_topic),
        )
        .route(
            "/api/v1/topics/*name",
            get(handlers::get_topic)
                .put(handlers::update_topic)
                .delete(handlers::delete_topic),
        )
        .route(
            "/api/v1/strategies",
            get(handlers::list_strategies).post(handlers::create_strategy),
        )
        .route(
            "/api/v1/strategies/:id",
            get(handlers::get_strategy)
                .put(handlers::update_strategy)
                .delete(handlers::delete_strategy),
        )
        .route("/api/v1/system", get(handlers::system))
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

pub fn ok<T: Serialize>(data: T) -> Response {
    (
        StatusCode::OK,
        Json(Envelope {
            success: true,
            data: Some(data),
            error: None,
        }),
    )
        .into_response()
}

pub fn created<T: Serialize>(data: T) -> Response {
    (
        StatusCode::CREATED,
        Json(Envelope {
            success: true,
            data: Some(data),
            error: None,
        }),
    )
        .into_response()
}

pub fn fail(status: StatusCode, code: &str, message: String) -> Response {
    (
        status,
        Json(Envelope::<()> {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: code.to_string(),
                message,
            }),
        }),
    )
        .into_response()
}

/// Maps a registry violation to status + stable error code.
pub fn registry_error(e: RegistryError) -> Response {
    let (status, code) = match &e {
        RegistryError::TopicNotFound(_) | RegistryError::StrategyNotFound(_) => {
            (StatusCode::NOT_FOUND, "NotFound")
        }
        RegistryError::NameTaken(_) => (StatusCode::CONFLICT, "NameTaken"),
        RegistryError::CycleDetected { .. } => (StatusCode::CONFLICT, "CycleDetected"),
        RegistryError::InUse { .. } => (StatusCode::CONFLICT, "InUse"),
        RegistryError::UnknownReference(_) => (StatusCode::BAD_REQUEST, "UnknownReference"),
        RegistryError::InputLimitExceeded { .. } => {
            (StatusCode::BAD_REQUEST, "InputLimitExceeded")
        }
        RegistryError::AliasCollision(_) => (StatusCode::BAD_REQUEST, "AliasCollision"),
        RegistryError::InvalidTopic(_) => (StatusCode::BAD_REQUEST, "InvalidTopic"),
        RegistryError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "PersistenceError"),
    };
    fail(status, code, e.to_string())
}

/// Write-time strategy validation failures are client errors.
pub fn strategy_error(e: StrategyError) -> Response {
    match &e {
        StrategyError::Compile(_) => {
            fail(StatusCode::BAD_REQUEST, "StrategyCompileError", e.to_string())
        }
        _ => fail(
            StatusCode::INTERNAL_SERVER_ERROR,
            "StrategyError",
            e.to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_skips_empty_fields() {
        let body = serde_json::to_string(&Envelope {
            success: true,
            data: Some(1),
            error: None,
        })
        .unwrap();
        assert_eq!(body, r#"{"success":true,"data":1}"#);

        let body = serde_json::to_string(&Envelope::<()> {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: "CycleDetected".to_string(),
                message: "loop".to_string(),
            }),
        })
        .unwrap();
        assert_eq!(
            body,
            r#"{"success":false,"error":{"code":"CycleDetected","message":"loop"}}"#
        );
    }

    #[test]
    fn cycle_maps_to_conflict() {
        let response = registry_error(RegistryError::CycleDetected {
            topic: "a".to_string(),
            via: "b".to_string(),
        });
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = registry_error(RegistryError::TopicNotFound("x".to_string()));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
