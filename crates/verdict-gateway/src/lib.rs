//! # verdict-gateway
//!
//! The service layer around the Verdict policy engine.
//!
//! - [`EnforcementAdapter`] is what an external tool gateway calls on every
//!   tool invocation. It resolves the gateway's attachment, decides, applies
//!   ENFORCE or LOG_ONLY, and hands a record to the audit sink.
//! - [`PolicyGenerator`] runs natural-language generation jobs against a
//!   [`JudgeModel`]. Candidates come back validated, analyzed and ranked;
//!   nothing is written until the caller creates a policy from one.
//! - [`PolicyService`] wires both to a [`PolicyStore`](verdict_store::PolicyStore)
//!   from a [`ServiceConfig`].

pub mod adapter;
pub mod config;
pub mod error;
pub mod generator;
pub mod judge;
pub mod service;

pub use adapter::{AdapterResponse, EnforcementAdapter};
pub use config::{GenerationConfig, ServiceConfig, ValidationConfig};
pub use error::{GatewayError, GenerationError};
pub use generator::{Candidate, GenerationLimits, GenerationStatus, PolicyGeneration, PolicyGenerator};
pub use judge::{DraftCandidate, DraftRequest, JudgeModel};
pub use service::PolicyService;
