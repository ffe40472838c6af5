// sink.rs — Where decision records go.
//
// The enforcement adapter holds one `AuditSink`. Sinks are called on the
// request path, from many threads at once, so they must be `Send + Sync`
// and should return quickly. A sink error is the sink's problem: the
// adapter logs it and returns the decision unchanged.

use parking_lot::Mutex;

use crate::error::AuditError;
use crate::event::DecisionRecord;
use crate::log::AuditLog;

/// Receives decision records.
pub trait AuditSink: Send + Sync {
    /// Record one decision.
    fn record(&self, record: DecisionRecord) -> Result<(), AuditError>;
}

impl AuditSink for AuditLog {
    fn record(&self, mut record: DecisionRecord) -> Result<(), AuditError> {
        self.append(&mut record)
    }
}

/// Keeps records in memory. Used when no log path is configured, and in tests.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<DecisionRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of everything recorded so far, oldest first.
    pub fn records(&self) -> Vec<DecisionRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: DecisionRecord) -> Result<(), AuditError> {
        self.records.lock().push(record);
        Ok(())
    }
}

/// Discards every record.
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _record: DecisionRecord) -> Result<(), AuditError> {
        Ok(())
    }
}
