//! In-memory topic registry with eager dependency edges.
//!
//! All reads during evaluation go through cheap cloned snapshots; writers
//! hold the lock across the persist step so a successful mutation leaves
//! store and memory in agreement. Dependents are kept in `BTreeSet`s,
//! which makes [`Registry::dependents_of`] naturally sorted and the
//! propagation order deterministic.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info};

use crate::store::{Store, StoreError};
use crate::topics::model::{
    state_key, Strategy, StrategySpec, Topic, TopicKind, TopicSpec,
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("topic '{0}' not found")]
    TopicNotFound(String),

    #[error("strategy {0} not found")]
    StrategyNotFound(i64),

    #[error("topic '{0}' already exists")]
    NameTaken(String),

    #[error("cycle detected: topic '{topic}' would depend on itself through '{via}'")]
    CycleDetected { topic: String, via: String },

    #[error("unknown reference: {0}")]
    UnknownReference(String),

    #[error("topic '{topic}' has {count} inputs but strategy '{strategy}' allows {max}")]
    InputLimitExceeded {
        topic: String,
        strategy: String,
        count: usize,
        max: u32,
    },

    #[error("input aliases must be unique: '{0}' is used twice")]
    AliasCollision(String),

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("'{entity}' is still in use by '{user}'")]
    InUse { entity: String, user: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Default)]
struct Graph {
    topics: HashMap<String, Topic>,
    strategies: HashMap<i64, Strategy>,
    /// input topic name → names of topics that list it.
    dependents: HashMap<String, BTreeSet<String>>,
}

impl Graph {
    fn rebuild_edges(&mut self) {
        self.dependents.clear();
        for topic in self.topics.values() {
            for input in &topic.inputs {
                self.dependents
                    .entry(input.clone())
                    .or_default()
                    .insert(topic.name.clone());
            }
        }
    }

    fn drop_edges_of(&mut self, name: &str) {
        for deps in self.dependents.values_mut() {
            deps.remove(name);
        }
        self.dependents.retain(|_, deps| !deps.is_empty());
    }

    fn add_edges_of(&mut self, topic: &Topic) {
        for input in &topic.inputs {
            self.dependents
                .entry(input.clone())
                .or_default()
                .insert(topic.name.clone());
        }
    }

    /// True when `target` is reachable from `from` following dependent
    /// edges (the direction values flow).
    fn reaches(&self, from: &str, target: &str) -> bool {
        let mut stack = vec![from.to_string()];
        let mut seen = BTreeSet::new();
        while let Some(node) = stack.pop() {
            if node == target {
                return true;
            }
            if !seen.insert(node.clone()) {
                continue;
            }
            if let Some(deps) = self.dependents.get(&node) {
                stack.extend(deps.iter().cloned());
            }
        }
        false
    }
}

/// Owner of all topic and strategy records.
pub struct Registry {
    store: Arc<dyn Store>,
    graph: RwLock<Graph>,
}

impl Registry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            graph: RwLock::new(Graph::default()),
        }
    }

    /// Loads all topics and strategies from the store. `state` entries fill
    /// in last values the `topics` rows are missing.
    pub fn hydrate(&self) -> Result<(), RegistryError> {
        let mut topics = self.store.load_topics()?;
        let strategies = self.store.load_strategies()?;

        for topic in &mut topics {
            if topic.last_value.is_none() {
                if let Some(value) = self.store.get_state(&state_key(topic))? {
                    topic.last_value = Some(value);
                }
            }
        }

        let mut graph = self.graph.write().expect("registry lock poisoned");
        graph.strategies = strategies.into_iter().map(|s| (s.id, s)).collect();
        graph.topics = topics.into_iter().map(|t| (t.name.clone(), t)).collect();
        graph.rebuild_edges();
        info!(
            "registry hydrated: {} topics, {} strategies",
            graph.topics.len(),
            graph.strategies.len()
        );
        Ok(())
    }

    // ---- reads ------------------------------------------------------------

    pub fn get(&self, name: &str) -> Option<Topic> {
        self.graph
            .read()
            .expect("registry lock poisoned")
            .topics
            .get(name)
            .cloned()
    }

    pub fn get_strategy(&self, id: i64) -> Option<Strategy> {
        self.graph
            .read()
            .expect("registry lock poisoned")
            .strategies
            .get(&id)
            .cloned()
    }

    pub fn list(&self, kind: Option<TopicKind>) -> Vec<Topic> {
        let graph = self.graph.read().expect("registry lock poisoned");
        let mut topics: Vec<Topic> = graph
            .topics
            .values()
            .filter(|t| kind.map_or(true, |k| t.kind == k))
            .cloned()
            .collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        topics
    }

    pub fn list_strategies(&self) -> Vec<Strategy> {
        let graph = self.graph.read().expect("registry lock poisoned");
        let mut strategies: Vec<Strategy> = graph.strategies.values().cloned().collect();
        strategies.sort_by_key(|s| s.id);
        strategies
    }

    /// Topics whose inputs include `name`, sorted ascending by name.
    pub fn dependents_of(&self, name: &str) -> Vec<Topic> {
        let graph = self.graph.read().expect("registry lock poisoned");
        graph
            .dependents
            .get(name)
            .map(|deps| {
                deps.iter()
                    .filter_map(|dep| graph.topics.get(dep).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Materializes the alias → value mapping a strategy sees. Inputs that
    /// do not resolve to a topic, or have no value yet, appear as null.
    pub fn materialize_inputs(&self, topic: &Topic) -> serde_json::Map<String, Value> {
        let graph = self.graph.read().expect("registry lock poisoned");
        let mut inputs = serde_json::Map::new();
        for input in &topic.inputs {
            let value = graph
                .topics
                .get(input)
                .and_then(|t| t.last_value.clone())
                .unwrap_or(Value::Null);
            inputs.insert(topic.alias_for(input).to_string(), value);
        }
        inputs
    }

    pub fn counts(&self) -> HashMap<TopicKind, usize> {
        let graph = self.graph.read().expect("registry lock poisoned");
        let mut counts = HashMap::new();
        for topic in graph.topics.values() {
            *counts.entry(topic.kind).or_insert(0) += 1;
        }
        counts
    }

    pub fn strategy_count(&self) -> usize {
        self.graph
            .read()
            .expect("registry lock poisoned")
            .strategies
            .len()
    }

    // ---- commits ----------------------------------------------------------

    /// Swaps the in-memory last value after the store accepted the commit.
    pub fn commit_value(&self, name: &str, value: Value, ts: DateTime<Utc>) {
        let mut graph = self.graph.write().expect("registry lock poisoned");
        if let Some(topic) = graph.topics.get_mut(name) {
            topic.last_value = Some(value);
            topic.last_updated = Some(ts);
        }
    }

    // ---- mutations --------------------------------------------------------

    /// Creates a topic. Validation, cycle check, persist, then edge swap.
    pub fn create_topic(
        &self,
        name: &str,
        kind: TopicKind,
        spec: TopicSpec,
    ) -> Result<Topic, RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::InvalidTopic(
                "topic name must not be empty".to_string(),
            ));
        }

        let mut graph = self.graph.write().expect("registry lock poisoned");
        if graph.topics.contains_key(name) {
            return Err(RegistryError::NameTaken(name.to_string()));
        }

        let topic = build_topic(&graph, name, kind, spec, None)?;
        check_acyclic(&graph, &topic)?;

        self.store.upsert_topic(&topic)?;
        graph.add_edges_of(&topic);
        graph.topics.insert(name.to_string(), topic.clone());
        debug!("topic created: {} ({})", name, kind);
        Ok(topic)
    }

    /// Updates a topic in place. The name and kind are fixed at creation.
    pub fn update_topic(&self, name: &str, spec: TopicSpec) -> Result<Topic, RegistryError> {
        let mut graph = self.graph.write().expect("registry lock poisoned");
        let existing = graph
            .topics
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::TopicNotFound(name.to_string()))?;

        let topic = build_topic(&graph, name, existing.kind, spec, Some(&existing))?;

        // Cycle check against the graph without this topic's old edges.
        let mut probe = Graph {
            topics: HashMap::new(),
            strategies: HashMap::new(),
            dependents: graph.dependents.clone(),
        };
        probe.drop_edges_of(name);
        check_acyclic(&probe, &topic)?;

        self.store.upsert_topic(&topic)?;
        graph.drop_edges_of(name);
        graph.add_edges_of(&topic);
        graph.topics.insert(name.to_string(), topic.clone());
        debug!("topic updated: {}", name);
        Ok(topic)
    }

    /// Deletes a topic. Refused while another topic lists it as an input.
    pub fn delete_topic(&self, name: &str) -> Result<(), RegistryError> {
        let mut graph = self.graph.write().expect("registry lock poisoned");
        let topic = graph
            .topics
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::TopicNotFound(name.to_string()))?;

        if let Some(dependent) = graph.dependents.get(name).and_then(|d| d.iter().next()) {
            return Err(RegistryError::InUse {
                entity: name.to_string(),
                user: dependent.clone(),
            });
        }

        self.store.delete_topic(name)?;
        self.store.delete_state(&state_key(&topic))?;
        graph.topics.remove(name);
        graph.drop_edges_of(name);
        info!("topic deleted: {}", name);
        Ok(())
    }

    /// Materializes an external topic for an MQTT message on a subscribed
    /// but unknown name. Returns the existing record when present.
    pub fn ensure_external(&self, name: &str) -> Result<Topic, RegistryError> {
        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }
        info!("materializing external topic '{}'", name);
        self.create_topic(name, TopicKind::External, TopicSpec::default())
    }

    /// Ensures a system topic exists with the given config bag.
    pub fn ensure_system(
        &self,
        name: &str,
        config: Value,
        emit_to_mqtt: bool,
    ) -> Result<Topic, RegistryError> {
        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }
        self.create_topic(
            name,
            TopicKind::System,
            TopicSpec {
                config,
                emit_to_mqtt,
                ..TopicSpec::default()
            },
        )
    }

    pub fn create_strategy(&self, spec: StrategySpec) -> Result<Strategy, RegistryError> {
        let mut graph = self.graph.write().expect("registry lock poisoned");
        let strategy = self.store.insert_strategy(&spec)?;
        graph.strategies.insert(strategy.id, strategy.clone());
        info!("strategy created: {} ({})", strategy.name, strategy.id);
        Ok(strategy)
    }

    pub fn update_strategy(&self, id: i64, spec: StrategySpec) -> Result<Strategy, RegistryError> {
        let mut graph = self.graph.write().expect("registry lock poisoned");
        let existing = graph
            .strategies
            .get(&id)
            .cloned()
            .ok_or(RegistryError::StrategyNotFound(id))?;

        let updated = Strategy {
            id,
            name: spec.name,
            code: spec.code,
            language: spec.language,
            parameters: spec.parameters,
            max_inputs: spec.max_inputs,
            default_input_names: spec.default_input_names,
            created_at: existing.created_at,
            updated_at: Utc::now(),
        };

        self.store.update_strategy(&updated)?;
        graph.strategies.insert(id, updated.clone());
        debug!("strategy updated: {}", id);
        Ok(updated)
    }

    /// Deletes a strategy. Refused while any topic binds it.
    pub fn delete_strategy(&self, id: i64) -> Result<(), RegistryError> {
        let mut graph = self.graph.write().expect("registry lock poisoned");
        if !graph.strategies.contains_key(&id) {
            return Err(RegistryError::StrategyNotFound(id));
        }
        if let Some(user) = graph
            .topics
            .values()
            .find(|t| t.strategy_id == Some(id))
        {
            return Err(RegistryError::InUse {
                entity: format!("strategy {}", id),
                user: user.name.clone(),
            });
        }

        self.store.delete_strategy(id)?;
        graph.strategies.remove(&id);
        info!("strategy deleted: {}", id);
        Ok(())
    }
}

/// Validates a spec against the invariants and assembles the record.
fn build_topic(
    graph: &Graph,
    name: &str,
    kind: TopicKind,
    spec: TopicSpec,
    existing: Option<&Topic>,
) -> Result<Topic, RegistryError> {
    if kind != TopicKind::Internal && !spec.inputs.is_empty() {
        return Err(RegistryError::InvalidTopic(format!(
            "{} topics cannot declare inputs",
            kind
        )));
    }
    if kind != TopicKind::Internal && spec.strategy_id.is_some() {
        return Err(RegistryError::InvalidTopic(format!(
            "{} topics cannot bind a strategy",
            kind
        )));
    }

    for (input, _) in spec.input_names.iter() {
        if !spec.inputs.contains(input) {
            return Err(RegistryError::UnknownReference(format!(
                "input_names entry '{}' is not an input of '{}'",
                input, name
            )));
        }
    }

    let mut input_names = spec.input_names.clone();

    if let Some(id) = spec.strategy_id {
        let strategy = graph
            .strategies
            .get(&id)
            .ok_or(RegistryError::StrategyNotFound(id))?;

        if strategy.max_inputs > 0 && spec.inputs.len() > strategy.max_inputs as usize {
            return Err(RegistryError::InputLimitExceeded {
                topic: name.to_string(),
                strategy: strategy.name.clone(),
                count: spec.inputs.len(),
                max: strategy.max_inputs,
            });
        }

        // Seed positional aliases from the strategy the first time this
        // topic wires it.
        let first_wiring = existing.map_or(true, |t| t.strategy_id != Some(id));
        if first_wiring {
            for (input, alias) in spec.inputs.iter().zip(&strategy.default_input_names) {
                input_names
                    .entry(input.clone())
                    .or_insert_with(|| alias.clone());
            }
        }
    }

    // Aliases must be injective over the configured inputs.
    let mut seen = BTreeSet::new();
    for input in &spec.inputs {
        let alias = input_names.get(input).map(String::as_str).unwrap_or(input);
        if !seen.insert(alias.to_string()) {
            return Err(RegistryError::AliasCollision(alias.to_string()));
        }
    }

    Ok(Topic {
        name: name.to_string(),
        kind,
        inputs: spec.inputs,
        input_names,
        strategy_id: spec.strategy_id,
        emit_to_mqtt: spec.emit_to_mqtt,
        noop_unchanged: spec.noop_unchanged,
        last_value: existing.and_then(|t| t.last_value.clone()),
        last_updated: existing.and_then(|t| t.last_updated),
        config: spec.config,
        created_at: existing.map_or_else(Utc::now, |t| t.created_at),
    })
}

/// Rejects the mutation when any declared input is downstream of the
/// topic itself; committing to it would loop forever.
fn check_acyclic(graph: &Graph, topic: &Topic) -> Result<(), RegistryError> {
    for input in &topic.inputs {
        if input == &topic.name || graph.reaches(&topic.name, input) {
            return Err(RegistryError::CycleDetected {
                topic: topic.name.to_string(),
                via: input.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::topics::StrategyLanguage;
    use serde_json::json;
    use tempfile::TempDir;

    fn registry() -> (TempDir, Registry) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(
            &dir.path().join("registry.db"),
            Arc::new(crate::metrics::Metrics::new()),
            1000,
        )
        .unwrap();
        (dir, Registry::new(Arc::new(store)))
    }

    fn internal(inputs: &[&str], strategy_id: Option<i64>) -> TopicSpec {
        TopicSpec {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            strategy_id,
            ..TopicSpec::default()
        }
    }

    fn alias_strategy(registry: &Registry) -> Strategy {
        registry
            .create_strategy(StrategySpec {
                name: "alias".to_string(),
                code: "function process(c) { c.emit(c.inputs[Object.keys(c.inputs)[0]]); }"
                    .to_string(),
                language: StrategyLanguage::Javascript,
                parameters: json!({}),
                max_inputs: 0,
                default_input_names: vec![],
            })
            .unwrap()
    }

    #[test]
    fn create_and_fetch() {
        let (_dir, registry) = registry();
        registry
            .create_topic("sensor/x", TopicKind::External, TopicSpec::default())
            .unwrap();
        let topic = registry.get("sensor/x").unwrap();
        assert_eq!(topic.kind, TopicKind::External);
        assert!(registry.get("sensor/y").is_none());
    }

    #[test]
    fn duplicate_name_rejected_across_kinds() {
        let (_dir, registry) = registry();
        registry
            .create_topic("room/light", TopicKind::External, TopicSpec::default())
            .unwrap();
        let err = registry
            .create_topic("room/light", TopicKind::Internal, TopicSpec::default())
            .unwrap_err();
        assert!(matches!(err, RegistryError::NameTaken(_)));
    }

    #[test]
    fn external_topics_cannot_have_inputs() {
        let (_dir, registry) = registry();
        let err = registry
            .create_topic("sensor/x", TopicKind::External, internal(&["other"], None))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTopic(_)));
    }

    #[test]
    fn cycle_refused_on_update() {
        let (_dir, registry) = registry();
        let strategy = alias_strategy(&registry);
        registry
            .create_topic("y", TopicKind::Internal, internal(&[], Some(strategy.id)))
            .unwrap();
        registry
            .create_topic(
                "x",
                TopicKind::Internal,
                internal(&["y"], Some(strategy.id)),
            )
            .unwrap();

        // y -> x exists; wiring x into y closes the loop.
        let err = registry
            .update_topic("y", internal(&["x"], Some(strategy.id)))
            .unwrap_err();
        assert!(matches!(err, RegistryError::CycleDetected { .. }));

        // Graph unchanged: y still has no inputs.
        assert!(registry.get("y").unwrap().inputs.is_empty());
    }

    #[test]
    fn self_loop_refused() {
        let (_dir, registry) = registry();
        let strategy = alias_strategy(&registry);
        let err = registry
            .create_topic(
                "loop",
                TopicKind::Internal,
                internal(&["loop"], Some(strategy.id)),
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::CycleDetected { .. }));
    }

    #[test]
    fn long_cycle_refused() {
        let (_dir, registry) = registry();
        let s = alias_strategy(&registry);
        registry
            .create_topic("a", TopicKind::Internal, internal(&[], Some(s.id)))
            .unwrap();
        registry
            .create_topic("b", TopicKind::Internal, internal(&["a"], Some(s.id)))
            .unwrap();
        registry
            .create_topic("c", TopicKind::Internal, internal(&["b"], Some(s.id)))
            .unwrap();
        let err = registry
            .update_topic("a", internal(&["c"], Some(s.id)))
            .unwrap_err();
        assert!(matches!(err, RegistryError::CycleDetected { .. }));
    }

    #[test]
    fn dependents_sorted_by_name() {
        let (_dir, registry) = registry();
        let s = alias_strategy(&registry);
        registry
            .create_topic("src", TopicKind::External, TopicSpec::default())
            .unwrap();
        for name in ["zeta", "alpha", "mid"] {
            registry
                .create_topic(name, TopicKind::Internal, internal(&["src"], Some(s.id)))
                .unwrap();
        }
        let deps: Vec<String> = registry
            .dependents_of("src")
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(deps, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn delete_topic_in_use_rejected() {
        let (_dir, registry) = registry();
        let s = alias_strategy(&registry);
        registry
            .create_topic("src", TopicKind::External, TopicSpec::default())
            .unwrap();
        registry
            .create_topic("sink", TopicKind::Internal, internal(&["src"], Some(s.id)))
            .unwrap();

        assert!(matches!(
            registry.delete_topic("src").unwrap_err(),
            RegistryError::InUse { .. }
        ));

        registry.delete_topic("sink").unwrap();
        registry.delete_topic("src").unwrap();
    }

    #[test]
    fn delete_bound_strategy_rejected() {
        let (_dir, registry) = registry();
        let s = alias_strategy(&registry);
        registry
            .create_topic("sink", TopicKind::Internal, internal(&[], Some(s.id)))
            .unwrap();
        assert!(matches!(
            registry.delete_strategy(s.id).unwrap_err(),
            RegistryError::InUse { .. }
        ));
        registry.delete_topic("sink").unwrap();
        registry.delete_strategy(s.id).unwrap();
    }

    #[test]
    fn max_inputs_enforced() {
        let (_dir, registry) = registry();
        let s = registry
            .create_strategy(StrategySpec {
                name: "single".to_string(),
                code: "function process(c) {}".to_string(),
                language: StrategyLanguage::Javascript,
                parameters: json!({}),
                max_inputs: 1,
                default_input_names: vec![],
            })
            .unwrap();
        let err = registry
            .create_topic(
                "sink",
                TopicKind::Internal,
                internal(&["a", "b"], Some(s.id)),
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::InputLimitExceeded { .. }));
    }

    #[test]
    fn alias_collision_rejected() {
        let (_dir, registry) = registry();
        let s = alias_strategy(&registry);
        let spec = TopicSpec {
            inputs: vec!["a".to_string(), "b".to_string()],
            input_names: HashMap::from([
                ("a".to_string(), "same".to_string()),
                ("b".to_string(), "same".to_string()),
            ]),
            strategy_id: Some(s.id),
            ..TopicSpec::default()
        };
        let err = registry
            .create_topic("sink", TopicKind::Internal, spec)
            .unwrap_err();
        assert!(matches!(err, RegistryError::AliasCollision(_)));
    }

    #[test]
    fn default_input_names_seed_aliases() {
        let (_dir, registry) = registry();
        let s = registry
            .create_strategy(StrategySpec {
                name: "add".to_string(),
                code: "function process(c) {}".to_string(),
                language: StrategyLanguage::Javascript,
                parameters: json!({}),
                max_inputs: 0,
                default_input_names: vec!["a".to_string(), "b".to_string()],
            })
            .unwrap();
        let topic = registry
            .create_topic(
                "sum",
                TopicKind::Internal,
                internal(&["sensor/one", "sensor/two"], Some(s.id)),
            )
            .unwrap();
        assert_eq!(topic.alias_for("sensor/one"), "a");
        assert_eq!(topic.alias_for("sensor/two"), "b");
    }

    #[test]
    fn unresolved_inputs_materialize_null() {
        let (_dir, registry) = registry();
        let s = alias_strategy(&registry);
        let topic = registry
            .create_topic(
                "sink",
                TopicKind::Internal,
                internal(&["ghost/topic"], Some(s.id)),
            )
            .unwrap();
        let inputs = registry.materialize_inputs(&topic);
        assert_eq!(inputs.get("ghost/topic"), Some(&Value::Null));
    }

    #[test]
    fn hydrate_restores_graph() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.db");
        let metrics = Arc::new(crate::metrics::Metrics::new());
        {
            let store = SqliteStore::open(&path, metrics.clone(), 1000).unwrap();
            let registry = Registry::new(Arc::new(store));
            let s = alias_strategy(&registry);
            registry
                .create_topic("src", TopicKind::External, TopicSpec::default())
                .unwrap();
            registry
                .create_topic("sink", TopicKind::Internal, internal(&["src"], Some(s.id)))
                .unwrap();
            registry.commit_value("src", json!(42), Utc::now());
        }

        let store = SqliteStore::open(&path, metrics, 1000).unwrap();
        let registry = Registry::new(Arc::new(store));
        registry.hydrate().unwrap();
        assert_eq!(registry.dependents_of("src").len(), 1);
        assert_eq!(registry.strategy_count(), 1);
    }
}
