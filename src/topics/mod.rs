//! Topic registry and dependency graph.
//!
//! Every topic the engine knows about lives in memory here, behind a single
//! reader-writer lock, together with the strategy catalog and the derived
//! `input → dependents` edge map. The registry is the one owner of topic
//! records; other components read snapshots and hand commits back through
//! [`Registry::commit_value`].
//!
//! # Mutation protocol
//!
//! ```text
//! validate ──► cycle check ──► persist ──► swap record + rebuild edges
//! ```
//!
//! A mutation that fails any step leaves both the store and the in-memory
//! graph untouched, so a 2xx from the management API always means the two
//! agree.

pub mod model;
pub mod registry;

pub use model::{
    state_key, ExecutionRecord, Strategy, StrategyLanguage, StrategySpec, Topic, TopicKind,
    TopicSpec,
};
pub use registry::{Registry, RegistryError};
