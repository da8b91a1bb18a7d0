//! Prometheus instrumentation shared across subsystems.
//!
//! A single [`Metrics`] instance owns the registry and every collector; it
//! is created once at startup and handed to the store, transport, and
//! engine as an `Arc`. Exposition is the standard text format served by
//! the management API at `/metrics`.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

pub struct Metrics {
    pub registry: Registry,

    /// Messages accepted into the engine from any source.
    pub messages_processed: IntCounter,
    /// Strategy evaluations by outcome (`ok`, `error`).
    pub evaluations: IntCounterVec,
    /// Strategy failures by error kind.
    pub strategy_failures: IntCounterVec,
    /// Commits suppressed by `noop_unchanged`.
    pub commits_suppressed: IntCounter,
    /// Jobs dropped because the pending queue was full.
    pub queue_dropped: IntCounter,
    /// Jobs dropped by the chain depth guard.
    pub chain_depth_exceeded: IntCounter,
    /// Store queries by operation and mode (`read`/`write`).
    pub store_queries: IntCounterVec,
    /// Store query latency by operation and mode.
    pub store_query_seconds: HistogramVec,
    /// Strategy invocation latency by language.
    pub strategy_seconds: HistogramVec,
    /// Transport errors by kind (`subscribe`, `publish`, `connect`).
    pub transport_errors: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let messages_processed = IntCounter::with_opts(Opts::new(
            "homeflow_messages_processed_total",
            "Value updates accepted into the engine",
        ))
        .expect("metric definition");

        let evaluations = IntCounterVec::new(
            Opts::new(
                "homeflow_evaluations_total",
                "Strategy evaluations by outcome",
            ),
            &["outcome"],
        )
        .expect("metric definition");

        let strategy_failures = IntCounterVec::new(
            Opts::new(
                "homeflow_strategy_failures_total",
                "Strategy failures by error kind",
            ),
            &["kind"],
        )
        .expect("metric definition");

        let commits_suppressed = IntCounter::with_opts(Opts::new(
            "homeflow_commits_suppressed_total",
            "Commits suppressed by noop_unchanged",
        ))
        .expect("metric definition");

        let queue_dropped = IntCounter::with_opts(Opts::new(
            "homeflow_queue_dropped_total",
            "Jobs dropped on queue overflow",
        ))
        .expect("metric definition");

        let chain_depth_exceeded = IntCounter::with_opts(Opts::new(
            "homeflow_chain_depth_exceeded_total",
            "Jobs dropped by the chain depth guard",
        ))
        .expect("metric definition");

        let store_queries = IntCounterVec::new(
            Opts::new("homeflow_store_queries_total", "Store queries"),
            &["operation", "mode"],
        )
        .expect("metric definition");

        let store_query_seconds = HistogramVec::new(
            HistogramOpts::new("homeflow_store_query_seconds", "Store query latency")
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["operation", "mode"],
        )
        .expect("metric definition");

        let strategy_seconds = HistogramVec::new(
            HistogramOpts::new(
                "homeflow_strategy_seconds",
                "Strategy invocation latency by language",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0]),
            &["language"],
        )
        .expect("metric definition");

        let transport_errors = IntCounterVec::new(
            Opts::new("homeflow_transport_errors_total", "MQTT transport errors"),
            &["kind"],
        )
        .expect("metric definition");

        for collector in [
            Box::new(messages_processed.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(evaluations.clone()),
            Box::new(strategy_failures.clone()),
            Box::new(commits_suppressed.clone()),
            Box::new(queue_dropped.clone()),
            Box::new(chain_depth_exceeded.clone()),
            Box::new(store_queries.clone()),
            Box::new(store_query_seconds.clone()),
            Box::new(strategy_seconds.clone()),
            Box::new(transport_errors.clone()),
        ] {
            registry.register(collector).expect("metric registration");
        }

        Self {
            registry,
            messages_processed,
            evaluations,
            strategy_failures,
            commits_suppressed,
            queue_dropped,
            chain_depth_exceeded,
            store_queries,
            store_query_seconds,
            strategy_seconds,
            transport_errors,
        }
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::error!("failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_exposition() {
        let metrics = Metrics::new();
        metrics.messages_processed.inc();
        metrics
            .store_queries
            .with_label_values(&["get_topic", "read"])
            .inc();
        let text = metrics.export();
        assert!(text.contains("homeflow_messages_processed_total 1"));
        assert!(text.contains("homeflow_store_queries_total"));
    }
}
