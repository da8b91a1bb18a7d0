//! Evaluation engine: the pending-job queue and the pipeline behind it.
//!
//! Triggers from MQTT, tickers, the scheduler, and strategy emissions all
//! become jobs on one bounded FIFO queue. A commit persists first, swaps
//! the in-memory value second, publishes to MQTT third, and finally
//! schedules the evaluations of every dependent, in sorted name order
//! so propagation is deterministic.
//!
//! ```text
//!            ┌────────────── Job queue (FIFO, bounded) ──────────────┐
//! mqtt ─────►│ Update ─► commit ─► schedule dependents ─► Evaluate … │
//! ticker ───►│                                                       │
//! schedule ─►│ Evaluate ─► strategy host ─► emissions ─► commit/Update│
//! emission ─►└───────────────────────────────────────────────────────┘
//! ```
//!
//! Two guards keep a wave finite: write-time cycle checks in the registry
//! and the runtime hop-count carried by every job. A job whose depth
//! exceeds the configured limit is dropped and logged, never processed.
//!
//! With one evaluator worker the queue order is the execution order.
//! With more, a striped per-topic lock serializes "commit + schedule"
//! per topic while distinct topics proceed concurrently.

pub mod evaluator;
pub mod sources;

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::metrics::Metrics;

pub use evaluator::{spawn_workers, EngineCore};

/// Synthetic trigger tags for root updates.
pub const TRIGGER_MQTT: &str = "mqtt";
pub const TRIGGER_TICKER: &str = "ticker";
pub const TRIGGER_SCHEDULE: &str = "schedule";
pub const TRIGGER_SYSTEM: &str = "system";

/// Unit of work on the pending queue.
#[derive(Debug, Clone)]
pub enum Job {
    /// A new value for a topic, from any source.
    Update {
        topic: String,
        value: Value,
        trigger: String,
        depth: u32,
    },
    /// Run the strategy of `topic` because `trigger` changed.
    Evaluate {
        topic: String,
        trigger: String,
        depth: u32,
    },
}

impl Job {
    pub fn topic(&self) -> &str {
        match self {
            Job::Update { topic, .. } | Job::Evaluate { topic, .. } => topic,
        }
    }

    pub fn depth(&self) -> u32 {
        match self {
            Job::Update { depth, .. } | Job::Evaluate { depth, .. } => *depth,
        }
    }
}

/// Cloneable intake for the job queue. Enforces the chain depth guard and
/// the drop-on-overflow policy at the door.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Job>,
    metrics: Arc<Metrics>,
    depth_limit: u32,
}

impl EngineHandle {
    pub fn new(tx: mpsc::Sender<Job>, metrics: Arc<Metrics>, depth_limit: u32) -> Self {
        Self {
            tx,
            metrics,
            depth_limit,
        }
    }

    /// True when the pending queue is empty. In-flight jobs on a worker
    /// are invisible here, so shutdown pairs this with a short grace.
    pub fn is_idle(&self) -> bool {
        self.tx.capacity() == self.tx.max_capacity()
    }

    pub fn submit(&self, job: Job) {
        if job.depth() > self.depth_limit {
            self.metrics.chain_depth_exceeded.inc();
            warn!(
                "chain depth exceeded: dropping job for '{}' at depth {}",
                job.topic(),
                job.depth()
            );
            return;
        }
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.metrics.queue_dropped.inc();
                warn!("pending queue full: dropping job for '{}'", job.topic());
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("pending queue closed, engine is shutting down");
            }
        }
    }
}
