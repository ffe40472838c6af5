// error.rs — Error types for the service layer and generation jobs.

use thiserror::Error;
use uuid::Uuid;

use verdict_audit::AuditError;
use verdict_policy::SchemaError;
use verdict_store::StoreError;

/// Why a generation job failed. Recorded on the job; never retried.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// The judge model did not answer within the job's budget.
    #[error("judge model timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    /// The judge model returned an error.
    #[error("judge model failed: {0}")]
    Model(String),

    /// The judge model returned no candidates.
    #[error("judge model returned no candidates")]
    NoCandidates,

    /// The engine's schema changed since the caller looked at it.
    #[error("target schema {requested} does not match the engine's current schema {current}")]
    SchemaMismatch { requested: String, current: String },

    /// The job was cancelled by the caller.
    #[error("generation cancelled")]
    Cancelled,

    /// The engine could not be read.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors that can occur during service operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Tool definitions could not be loaded.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// The decision log could not be opened.
    #[error("audit error: {0}")]
    Audit(#[from] AuditError),

    /// The requested generation job does not exist or has expired.
    #[error("policy generation not found: {0}")]
    GenerationNotFound(Uuid),

    /// Generation jobs run on the caller's Tokio runtime, and there is none.
    #[error("policy generation must be started from within a Tokio runtime")]
    NoRuntime,

    /// The configuration file is not valid TOML for `ServiceConfig`.
    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("I/O error at {path}: {source}")]
    IoError {
        path: String,
        source: std::io::Error,
    },
}
