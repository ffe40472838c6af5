// error.rs — Error types for the audit subsystem.
//
// Audit failures never change a decision; the adapter logs them and moves
// on. They are still surfaced as values so sinks can be tested.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditError {
    /// Failed to open or create the decision log file.
    #[error("failed to open audit log at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to write a record to the log.
    #[error("failed to append record: {0}")]
    WriteFailed(#[from] std::io::Error),

    /// A record could not be serialized or a log line could not be parsed.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The hash chain is broken: a record was inserted, removed or edited.
    #[error("integrity check failed at line {line}: expected hash {expected}, got {actual}")]
    IntegrityViolation {
        line: usize,
        expected: String,
        actual: String,
    },

    /// The sink refused the record (e.g. downstream collector unavailable).
    #[error("audit sink unavailable: {0}")]
    SinkUnavailable(String),
}
