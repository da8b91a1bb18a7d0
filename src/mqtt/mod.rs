//! MQTT transport: one long-lived broker link and the routing in front
//! of it.
//!
//! The connection lifecycle is a statum state machine
//! (`Closed → Connecting → Connected ⇄ Reconnecting`) driven by a single
//! worker task; observers watch the coarse [`LinkState`] through a watch
//! channel instead of poking at the machine. Commands reach the worker
//! over an mpsc channel, inbound publishes leave it through per-pattern
//! routes.
//!
//! ```text
//! MqttHandle ──commands──► transport worker ──rumqttc──► broker
//!     ▲                        │
//!     └──── watch LinkState ◄──┘──first-match route──► engine intake
//! ```
//!
//! Subscription patterns use MQTT wildcards: `+` matches exactly one
//! level, `#` matches any trailing levels and must be the last segment.
//! Dispatch is first-match-wins in registration order.

pub mod matcher;
pub mod transport;

use thiserror::Error;

pub use matcher::matches;
pub use transport::{InboundMessage, LinkSettings, MqttHandle, MqttWorker};

/// Coarse connection state broadcast to observers.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum LinkState {
    #[default]
    Closed,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Closed => write!(f, "closed"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected to broker")]
    NotConnected,

    #[error("broker rejected subscription to '{pattern}': {detail}")]
    SubscribeRejected { pattern: String, detail: String },

    #[error("broker rejected publish to '{topic}': {detail}")]
    PublishRejected { topic: String, detail: String },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("transport worker is gone")]
    WorkerGone,
}
