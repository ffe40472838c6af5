//! # verdict-store
//!
//! Policy engines, their policies and the enforcement points bound to them.
//!
//! A [`PolicyEngine`] holds a compiled [`Schema`](verdict_policy::Schema)
//! and an ordered policy set. Every change to the set publishes a new
//! immutable [`PolicySnapshot`](verdict_policy::PolicySnapshot) with a
//! higher version; the decision path loads snapshots and bindings without
//! taking locks, so a request always sees one complete policy set.
//!
//! An engine with any [`EnforcementAttachment`] is locked: its policies can
//! be cloned but not changed or deleted, and the engine itself cannot be
//! deleted until every attachment is removed.
//!
//! With a state directory configured, each engine is persisted as
//! `<state_dir>/<engine_id>.json` and reloaded by [`PolicyStore::open`].

pub mod attachment;
pub mod engine;
pub mod error;
pub mod persist;
pub mod policy;
pub mod store;
pub mod throttle;

pub use attachment::EnforcementAttachment;
pub use engine::{EngineStatus, PolicyEngine};
pub use error::StoreError;
pub use persist::{EngineFile, EngineFiles};
pub use policy::{Policy, ValidationStatus};
pub use store::{Binding, CloneOptions, EngineSlot, PolicyStore, StoreOptions};
pub use throttle::{ThrottleConfig, WriteThrottle};
