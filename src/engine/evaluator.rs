//! The evaluation pipeline: commits, strategy runs, emission routing.

use chrono::Utc;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{EngineHandle, Job, TRIGGER_MQTT};
use crate::metrics::Metrics;
use crate::mqtt::MqttHandle;
use crate::store::Store;
use crate::strategy::{InvocationContext, StrategyHost};
use crate::topics::{state_key, ExecutionRecord, Registry, Topic};
use crate::value;

use super::sources::ERROR_TOPIC;

const LOCK_STRIPES: usize = 64;

pub struct EngineCore {
    registry: Arc<Registry>,
    store: Arc<dyn Store>,
    host: Arc<StrategyHost>,
    mqtt: MqttHandle,
    metrics: Arc<Metrics>,
    handle: EngineHandle,
    /// Striped per-topic locks: one giant mutex would serialize unrelated
    /// topics, one lock per topic would never be cleaned up.
    stripes: Vec<Mutex<()>>,
}

impl EngineCore {
    /// Builds the core and its job queue. The returned receiver feeds
    /// [`spawn_workers`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn Store>,
        host: Arc<StrategyHost>,
        mqtt: MqttHandle,
        metrics: Arc<Metrics>,
        queue_capacity: usize,
        depth_limit: u32,
    ) -> (Arc<Self>, mpsc::Receiver<Job>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let handle = EngineHandle::new(tx, metrics.clone(), depth_limit);
        let core = Arc::new(Self {
            registry,
            store,
            host,
            mqtt,
            metrics,
            handle,
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        });
        (core, rx)
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub async fn process(&self, job: Job) {
        match job {
            Job::Update {
                topic,
                value,
                trigger,
                depth,
            } => self.apply_update(&topic, value, &trigger, depth).await,
            Job::Evaluate {
                topic,
                trigger,
                depth,
            } => self.evaluate(&topic, &trigger, depth).await,
        }
    }

    fn stripe(&self, name: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        &self.stripes[hasher.finish() as usize % LOCK_STRIPES]
    }

    /// Pending-update pipeline: resolve the topic (MQTT messages on
    /// subscribed-but-unknown names materialize an external topic),
    /// then commit and fan out.
    async fn apply_update(&self, name: &str, new_value: Value, trigger: &str, depth: u32) {
        let _guard = self.stripe(name).lock().await;

        let topic = match self.registry.get(name) {
            Some(topic) => topic,
            None if trigger == TRIGGER_MQTT => match self.registry.ensure_external(name) {
                Ok(topic) => topic,
                Err(e) => {
                    error!("cannot materialize external topic '{}': {}", name, e);
                    return;
                }
            },
            None => {
                warn!(
                    "dropping update for unknown topic '{}' (trigger '{}')",
                    name, trigger
                );
                return;
            }
        };

        self.metrics.messages_processed.inc();
        self.commit_locked(&topic, new_value, depth).await;
    }

    /// Commit: change detection, persist, memory swap, retained publish,
    /// dependent scheduling. Caller holds the topic's stripe lock.
    ///
    /// Persistence failures abort before the memory swap, which is what
    /// keeps the store and the registry in agreement.
    async fn commit_locked(&self, topic: &Topic, new_value: Value, depth: u32) -> bool {
        if topic.noop_unchanged && topic.last_value.as_ref() == Some(&new_value) {
            self.metrics.commits_suppressed.inc();
            debug!("'{}' unchanged, suppressing propagation", topic.name);
            return false;
        }

        let now = Utc::now();
        if let Err(e) = self.store.update_topic_value(&topic.name, &new_value, now) {
            error!("commit of '{}' failed: {}", topic.name, e);
            return false;
        }
        if let Err(e) = self.store.put_state(&state_key(topic), &new_value, now) {
            error!("state write for '{}' failed: {}", topic.name, e);
            return false;
        }

        self.registry.commit_value(&topic.name, new_value.clone(), now);
        debug!("committed '{}' = {}", topic.name, new_value);

        if topic.emit_to_mqtt {
            if let Err(e) = self
                .mqtt
                .publish(&topic.name, value::to_payload(&new_value), true)
            {
                warn!("publish of '{}' failed: {}", topic.name, e);
            }
        }

        self.schedule_dependents(&topic.name, depth);
        true
    }

    /// Enqueues an evaluation for every dependent that can run one, in
    /// sorted name order.
    fn schedule_dependents(&self, name: &str, depth: u32) {
        for dependent in self.registry.dependents_of(name) {
            if dependent.strategy_id.is_some() {
                self.handle.submit(Job::Evaluate {
                    topic: dependent.name,
                    trigger: name.to_string(),
                    depth: depth + 1,
                });
            }
        }
    }

    /// Runs the strategy of `name` and routes its emissions: the primary
    /// one becomes this topic's commit, the rest become pending updates.
    async fn evaluate(&self, name: &str, trigger: &str, depth: u32) {
        let Some(topic) = self.registry.get(name) else {
            debug!("evaluation target '{}' vanished", name);
            return;
        };
        // Child topics receive values, they never compute them.
        let Some(strategy_id) = topic.strategy_id else {
            return;
        };
        let Some(strategy) = self.registry.get_strategy(strategy_id) else {
            warn!(
                "topic '{}' references missing strategy {}",
                name, strategy_id
            );
            return;
        };

        let inputs = self.registry.materialize_inputs(&topic);
        let context = InvocationContext {
            topic: topic.name.clone(),
            trigger: trigger.to_string(),
            inputs: inputs.clone(),
            parameters: strategy.parameters.clone(),
            last_outputs: topic.last_value.clone().unwrap_or(Value::Null),
        };

        let started = Instant::now();
        let timer = self
            .metrics
            .strategy_seconds
            .with_label_values(&[&strategy.language.to_string()])
            .start_timer();
        let result = self.host.invoke(&strategy, context).await;
        timer.observe_duration();
        let elapsed_ms = started.elapsed().as_millis() as i64;

        let mut outputs = serde_json::Map::new();
        let mut error_message = None;

        match result {
            Ok(invocation) => {
                self.metrics.evaluations.with_label_values(&["ok"]).inc();
                for line in &invocation.logs {
                    info!(topic = %name, strategy = strategy.id, "{}", line);
                }

                for emission in invocation.emissions {
                    outputs.insert(emission.target.clone(), emission.value.clone());
                    if emission.target == topic.name {
                        let _guard = self.stripe(name).lock().await;
                        if let Some(fresh) = self.registry.get(name) {
                            self.commit_locked(&fresh, emission.value, depth).await;
                        }
                    } else {
                        self.handle.submit(Job::Update {
                            topic: emission.target,
                            value: emission.value,
                            trigger: name.to_string(),
                            depth: depth + 1,
                        });
                    }
                }
            }
            Err(e) => {
                self.metrics.evaluations.with_label_values(&["error"]).inc();
                self.metrics
                    .strategy_failures
                    .with_label_values(&[e.kind()])
                    .inc();
                warn!("strategy '{}' on '{}' failed: {}", strategy.name, name, e);
                error_message = Some(e.to_string());
                self.handle.submit(Job::Update {
                    topic: ERROR_TOPIC.to_string(),
                    value: serde_json::json!({
                        "topic": name,
                        "strategy": strategy.id,
                        "error": e.to_string(),
                    }),
                    trigger: name.to_string(),
                    depth: depth + 1,
                });
            }
        }

        let record = ExecutionRecord {
            id: 0,
            topic_name: topic.name.clone(),
            strategy_id: Some(strategy.id),
            trigger_topic: trigger.to_string(),
            input_values: Value::Object(inputs),
            output_values: Value::Object(outputs),
            error_message,
            execution_time_ms: elapsed_ms,
            executed_at: Utc::now(),
        };
        if let Err(e) = self.store.append_execution(&record) {
            warn!("execution log append failed: {}", e);
        }
    }
}

/// Spawns `count` evaluator workers sharing the job queue. FIFO dequeue
/// order is preserved; with one worker it is also the processing order.
/// Workers keep draining until the token fires, which is how the 30 s
/// shutdown budget works: producers stop first, workers finish the tail.
pub fn spawn_workers(
    core: Arc<EngineCore>,
    rx: mpsc::Receiver<Job>,
    count: usize,
    cancel: tokio_util::sync::CancellationToken,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..count)
        .map(|worker| {
            let core = core.clone();
            let rx = rx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                debug!("evaluator worker {} started", worker);
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => None,
                            job = rx.recv() => job,
                        }
                    };
                    match job {
                        Some(job) => core.process(job).await,
                        None => break,
                    }
                }
                debug!("evaluator worker {} stopped", worker);
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::topics::{StrategyLanguage, StrategySpec, TopicKind, TopicSpec};
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        core: Arc<EngineCore>,
        rx: mpsc::Receiver<Job>,
        registry: Arc<Registry>,
        store: Arc<dyn Store>,
        metrics: Arc<Metrics>,
        published: mpsc::UnboundedReceiver<(String, String, bool)>,
    }

    fn harness(depth_limit: u32) -> Harness {
        let dir = TempDir::new().unwrap();
        let metrics = Arc::new(Metrics::new());
        let store: Arc<dyn Store> = Arc::new(
            SqliteStore::open(&dir.path().join("engine.db"), metrics.clone(), 1000).unwrap(),
        );
        let registry = Arc::new(Registry::new(store.clone()));
        let host = Arc::new(StrategyHost::new(Duration::from_millis(300)));
        let (mqtt, published) = MqttHandle::loopback();
        let (core, rx) = EngineCore::new(
            registry.clone(),
            store.clone(),
            host,
            mqtt,
            metrics.clone(),
            256,
            depth_limit,
        );
        Harness {
            _dir: dir,
            core,
            rx,
            registry,
            store,
            metrics,
            published,
        }
    }

    impl Harness {
        /// Processes one root job and everything it cascades into,
        /// strictly FIFO like a single evaluator.
        async fn run(&mut self, job: Job) {
            self.core.process(job).await;
            while let Ok(job) = self.rx.try_recv() {
                self.core.process(job).await;
            }
        }

        fn js_strategy(&self, name: &str, code: &str) -> i64 {
            self.registry
                .create_strategy(StrategySpec {
                    name: name.to_string(),
                    code: code.to_string(),
                    language: StrategyLanguage::Javascript,
                    parameters: json!({}),
                    max_inputs: 0,
                    default_input_names: vec![],
                })
                .unwrap()
                .id
        }

        fn update(&self, topic: &str, value: Value) -> Job {
            Job::Update {
                topic: topic.to_string(),
                value,
                trigger: TRIGGER_MQTT.to_string(),
                depth: 0,
            }
        }
    }

    const ALIAS_CODE: &str = r#"function process(context) {
        var keys = Object.keys(context.inputs);
        context.emit(context.inputs[keys[0]]);
    }"#;

    #[tokio::test]
    async fn s1_alias_commits_and_publishes() {
        let mut h = harness(32);
        let alias = h.js_strategy("alias", ALIAS_CODE);
        h.registry
            .create_topic("sensor/x", TopicKind::External, TopicSpec::default())
            .unwrap();
        h.registry
            .create_topic(
                "mirror",
                TopicKind::Internal,
                TopicSpec {
                    inputs: vec!["sensor/x".to_string()],
                    strategy_id: Some(alias),
                    emit_to_mqtt: true,
                    ..TopicSpec::default()
                },
            )
            .unwrap();

        h.run(h.update("sensor/x", json!(42))).await;

        // Commit consistency: memory, topics row, and state entry agree.
        assert_eq!(h.registry.get("mirror").unwrap().last_value, Some(json!(42)));
        let row = h.store.get_topic("mirror").unwrap().unwrap();
        assert_eq!(row.last_value, Some(json!(42)));
        assert_eq!(
            h.store.get_state("internal:mirror").unwrap(),
            Some(json!(42))
        );

        let (topic, payload, retain) =
            tokio::time::timeout(Duration::from_secs(1), h.published.recv())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(topic, "mirror");
        assert_eq!(payload, "42");
        assert!(retain);
    }

    #[tokio::test]
    async fn s2_toggle_three_times() {
        let mut h = harness(32);
        let toggle = h.js_strategy(
            "toggle",
            "function process(context) { context.emit(!context.lastOutputs); }",
        );
        h.registry
            .create_topic("button", TopicKind::External, TopicSpec::default())
            .unwrap();
        h.registry
            .create_topic(
                "light",
                TopicKind::Internal,
                TopicSpec {
                    inputs: vec!["button".to_string()],
                    strategy_id: Some(toggle),
                    ..TopicSpec::default()
                },
            )
            .unwrap();

        let mut seen = Vec::new();
        for n in 0..3 {
            h.run(h.update("button", json!(n))).await;
            seen.push(h.registry.get("light").unwrap().last_value.unwrap());
        }
        assert_eq!(seen, vec![json!(true), json!(false), json!(true)]);
    }

    #[tokio::test]
    async fn s3_add_sums_numeric_inputs_only() {
        let mut h = harness(32);
        let add = h.js_strategy(
            "add",
            r#"function process(context) {
                var total = 0;
                for (var key in context.inputs) {
                    var value = context.inputs[key];
                    if (typeof value === 'number') { total += value; }
                }
                context.emit(total);
            }"#,
        );
        for name in ["a", "b"] {
            h.registry
                .create_topic(name, TopicKind::External, TopicSpec::default())
                .unwrap();
        }
        h.registry
            .create_topic(
                "sum",
                TopicKind::Internal,
                TopicSpec {
                    inputs: vec!["a".to_string(), "b".to_string()],
                    strategy_id: Some(add),
                    ..TopicSpec::default()
                },
            )
            .unwrap();

        h.run(h.update("a", json!(2))).await;
        assert_eq!(h.registry.get("sum").unwrap().last_value, Some(json!(2)));

        h.run(h.update("b", json!(3))).await;
        assert_eq!(h.registry.get("sum").unwrap().last_value, Some(json!(5)));

        h.run(h.update("b", json!("x"))).await;
        assert_eq!(h.registry.get("sum").unwrap().last_value, Some(json!(2)));
    }

    #[tokio::test]
    async fn s4_chain_suppresses_unchanged_waves() {
        let mut h = harness(32);
        let alias = h.js_strategy("alias", ALIAS_CODE);
        h.registry
            .create_topic(
                "a",
                TopicKind::External,
                TopicSpec {
                    noop_unchanged: true,
                    ..TopicSpec::default()
                },
            )
            .unwrap();
        for (name, input) in [("b", "a"), ("c", "b")] {
            h.registry
                .create_topic(
                    name,
                    TopicKind::Internal,
                    TopicSpec {
                        inputs: vec![input.to_string()],
                        strategy_id: Some(alias),
                        noop_unchanged: true,
                        ..TopicSpec::default()
                    },
                )
                .unwrap();
        }

        h.run(h.update("a", json!(1))).await;
        for name in ["a", "b", "c"] {
            assert_eq!(h.registry.get(name).unwrap().last_value, Some(json!(1)));
        }
        let evaluations_after_first = h.metrics.evaluations.with_label_values(&["ok"]).get();
        assert_eq!(evaluations_after_first, 2);

        // Same value again: a suppresses, nothing downstream runs.
        h.run(h.update("a", json!(1))).await;
        assert_eq!(
            h.metrics.evaluations.with_label_values(&["ok"]).get(),
            evaluations_after_first
        );
        assert_eq!(h.metrics.commits_suppressed.get(), 1);
    }

    #[tokio::test]
    async fn s6_strategy_timeout_commits_nothing() {
        let mut h = harness(32);
        let spin = h.js_strategy(
            "spin",
            "function process(context) { while (true) {} }",
        );
        h.registry
            .create_topic("tick", TopicKind::External, TopicSpec::default())
            .unwrap();
        h.registry
            .create_topic(
                "stuck",
                TopicKind::Internal,
                TopicSpec {
                    inputs: vec!["tick".to_string()],
                    strategy_id: Some(spin),
                    ..TopicSpec::default()
                },
            )
            .unwrap();

        h.run(h.update("tick", json!(1))).await;

        assert_eq!(h.registry.get("stuck").unwrap().last_value, None);
        let log = h.store.recent_executions(10).unwrap();
        let entry = log.iter().find(|e| e.topic_name == "stuck").unwrap();
        assert!(entry.error_message.as_deref().unwrap().contains("deadline"));
        assert_eq!(
            h.metrics.strategy_failures.with_label_values(&["timeout"]).get(),
            1
        );
    }

    #[tokio::test]
    async fn dependents_evaluate_in_name_order() {
        let mut h = harness(32);
        let alias = h.js_strategy("alias", ALIAS_CODE);
        h.registry
            .create_topic("src", TopicKind::External, TopicSpec::default())
            .unwrap();
        for name in ["zeta", "alpha"] {
            h.registry
                .create_topic(
                    name,
                    TopicKind::Internal,
                    TopicSpec {
                        inputs: vec!["src".to_string()],
                        strategy_id: Some(alias),
                        ..TopicSpec::default()
                    },
                )
                .unwrap();
        }

        h.run(h.update("src", json!(7))).await;

        // Execution log is append-only; newest first on read.
        let log = h.store.recent_executions(10).unwrap();
        let order: Vec<&str> = log.iter().map(|e| e.topic_name.as_str()).collect();
        assert_eq!(order, vec!["zeta", "alpha"]);
    }

    #[tokio::test]
    async fn runaway_emission_chain_is_depth_bounded() {
        let mut h = harness(4);
        // feedback/pulse is an input of feedback, and feedback emits to
        // it on every run: no static cycle, an infinite dynamic one.
        let pulse = h.js_strategy(
            "pulse",
            r#"function process(context) {
                context.emit("/pulse", (context.inputs["feedback/pulse"] || 0) + 1);
            }"#,
        );
        h.registry
            .create_topic("feedback/pulse", TopicKind::Internal, TopicSpec::default())
            .unwrap();
        h.registry
            .create_topic(
                "feedback",
                TopicKind::Internal,
                TopicSpec {
                    inputs: vec!["feedback/pulse".to_string()],
                    strategy_id: Some(pulse),
                    ..TopicSpec::default()
                },
            )
            .unwrap();
        h.registry
            .create_topic("kick", TopicKind::External, TopicSpec::default())
            .unwrap();
        h.registry
            .update_topic(
                "feedback",
                TopicSpec {
                    inputs: vec!["feedback/pulse".to_string(), "kick".to_string()],
                    strategy_id: Some(pulse),
                    ..TopicSpec::default()
                },
            )
            .unwrap();

        h.run(h.update("kick", json!(1))).await;

        assert!(h.metrics.chain_depth_exceeded.get() >= 1);
        let pulses = h
            .registry
            .get("feedback/pulse")
            .unwrap()
            .last_value
            .unwrap();
        assert!(pulses.as_i64().unwrap() <= 4);
    }

    #[tokio::test]
    async fn mqtt_message_materializes_external_topic() {
        let mut h = harness(32);
        h.run(h.update("fresh/sensor", json!(3))).await;

        let topic = h.registry.get("fresh/sensor").unwrap();
        assert_eq!(topic.kind, TopicKind::External);
        assert_eq!(topic.last_value, Some(json!(3)));
        assert!(h.store.get_topic("fresh/sensor").unwrap().is_some());
    }

    #[tokio::test]
    async fn emission_to_unknown_topic_is_dropped() {
        let mut h = harness(32);
        let emitter = h.js_strategy(
            "emitter",
            r#"function process(context) { context.emit("/ghost", 1); }"#,
        );
        h.registry
            .create_topic("src", TopicKind::External, TopicSpec::default())
            .unwrap();
        h.registry
            .create_topic(
                "parent",
                TopicKind::Internal,
                TopicSpec {
                    inputs: vec!["src".to_string()],
                    strategy_id: Some(emitter),
                    ..TopicSpec::default()
                },
            )
            .unwrap();

        h.run(h.update("src", json!(1))).await;
        // parent/ghost was never registered as a child topic.
        assert!(h.registry.get("parent/ghost").is_none());
    }

    #[tokio::test]
    async fn sub_emission_reaches_child_topic() {
        let mut h = harness(32);
        let emitter = h.js_strategy(
            "emitter",
            r#"function process(context) {
                context.emit(context.inputs.src);
                context.emit("/raw", "seen");
            }"#,
        );
        h.registry
            .create_topic("src", TopicKind::External, TopicSpec::default())
            .unwrap();
        h.registry
            .create_topic(
                "parent",
                TopicKind::Internal,
                TopicSpec {
                    inputs: vec!["src".to_string()],
                    input_names: HashMap::from([("src".to_string(), "src".to_string())]),
                    strategy_id: Some(emitter),
                    ..TopicSpec::default()
                },
            )
            .unwrap();
        h.registry
            .create_topic("parent/raw", TopicKind::Internal, TopicSpec::default())
            .unwrap();

        h.run(h.update("src", json!(5))).await;

        assert_eq!(h.registry.get("parent").unwrap().last_value, Some(json!(5)));
        assert_eq!(
            h.registry.get("parent/raw").unwrap().last_value,
            Some(json!("seen"))
        );
        assert_eq!(
            h.store.get_state("child:parent/raw").unwrap(),
            Some(json!("seen"))
        );
    }
}
