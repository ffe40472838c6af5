//! # verdict-audit
//!
//! Decision records and audit sinks for Verdict.
//!
//! Every request the enforcement adapter handles is recorded as a
//! [`DecisionRecord`] carrying both the computed decision and the effect
//! returned to the gateway. In LOG_ONLY mode these differ whenever the
//! engine would have denied, which is what makes dry-run rollouts reviewable.
//!
//! [`AuditLog`] writes records as JSON Lines linked into a SHA-256 hash
//! chain; [`MemoryAuditSink`] keeps them in memory.
//!
//! ```rust,no_run
//! use verdict_audit::{AuditLog, AuditSink, DecisionRecord};
//! use verdict_policy::{Decision, EnforcementMode, Principal, Request};
//!
//! let log = AuditLog::open("/tmp/decisions.jsonl").unwrap();
//! let request = Request::new(Principal::new("agent-1"), "process_refund", "gw-a", serde_json::json!({}));
//! let record = DecisionRecord::new("gw-a", &request, &Decision::default_deny(0))
//!     .with_mode(EnforcementMode::LogOnly);
//! log.record(record).unwrap();
//! ```

pub mod error;
pub mod event;
pub mod hasher;
pub mod log;
pub mod sink;

pub use error::AuditError;
pub use event::{DecisionRecord, RecordKind};
pub use log::AuditLog;
pub use sink::{AuditSink, MemoryAuditSink, NullAuditSink};
