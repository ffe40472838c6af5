// error.rs — Error types for the policy store and engine lifecycle.

use thiserror::Error;
use uuid::Uuid;

use verdict_policy::{Finding, PolicyError, SchemaError};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The statement text does not parse.
    #[error(transparent)]
    Parse(#[from] PolicyError),

    /// The statement parsed but failed validation or analysis.
    #[error("policy rejected with {} finding(s): {}", findings.len(), summarize(findings))]
    Validation { findings: Vec<Finding> },

    /// Tool definitions could not be compiled into a schema.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// An engine or policy with this name already exists.
    #[error("{kind} named '{name}' already exists")]
    Conflict { kind: &'static str, name: String },

    #[error("policy engine not found: {0}")]
    EngineNotFound(Uuid),

    #[error("policy not found: {0}")]
    PolicyNotFound(Uuid),

    #[error("no enforcement attachment for '{0}'")]
    AttachmentNotFound(String),

    /// The policy's engine is attached; clone the policy and edit the clone.
    #[error("policy {policy_id} is locked by an active attachment on engine {engine_id}; clone it to make changes")]
    PolicyLocked { policy_id: Uuid, engine_id: Uuid },

    /// The engine is still referenced by enforcement points.
    #[error("policy engine {engine_id} is attached to {}", attachments.join(", "))]
    EngineAttached {
        engine_id: Uuid,
        attachments: Vec<String>,
    },

    #[error("invalid transition from {from} to {to} for engine {engine_id}")]
    InvalidTransition {
        engine_id: Uuid,
        from: String,
        to: String,
    },

    /// The engine's status does not allow this operation.
    #[error("policy engine {engine_id} is {status}")]
    EngineNotReady { engine_id: Uuid, status: String },

    /// Control-plane write rate exceeded.
    #[error("too many control-plane writes; retry in {retry_after_ms} ms")]
    Throttled { retry_after_ms: u64 },

    #[error("I/O error at {path}: {source}")]
    IoError {
        path: String,
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

fn summarize(findings: &[Finding]) -> String {
    findings
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
