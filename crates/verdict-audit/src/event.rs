// event.rs — Decision record data model.
//
// Every request the enforcement adapter handles produces one record. The
// record keeps both the decision the engine computed and the effect the
// gateway was told, so LOG_ONLY ("shadow") rollouts can be reviewed before
// switching to ENFORCE. Records form a hash chain through `previous_hash`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use verdict_policy::{Decision, DecisionEffect, Diagnostic, EnforcementMode, Request};

use crate::hasher;

/// What the adapter did with the request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// ENFORCE mode: the computed effect was returned.
    Enforced,
    /// LOG_ONLY mode: ALLOW was returned whatever was computed.
    Shadow,
    /// No engine is attached to the enforcement point; the call was denied.
    Unattached,
}

/// One line in the decision log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionRecord {
    pub record_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: RecordKind,
    pub enforcement_point: String,
    /// `None` for unattached enforcement points.
    pub engine_id: Option<Uuid>,
    pub mode: Option<EnforcementMode>,
    pub snapshot_version: u64,

    pub principal: String,
    pub action: String,
    pub resource: String,
    /// SHA-256 of the request input; the input itself is not logged.
    pub input_hash: String,

    /// What the engine computed.
    pub decision: DecisionEffect,
    /// What the gateway was told.
    pub returned: DecisionEffect,
    pub determining: Vec<Uuid>,
    pub mismatched: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
    pub latency_micros: u64,

    /// Hash of the previous record in the log; `None` for the first.
    pub previous_hash: Option<String>,
}

impl DecisionRecord {
    /// A record for an evaluated request. Defaults to `Enforced` with the
    /// computed effect returned; use [`with_mode`](Self::with_mode) to
    /// record how the attachment applied it.
    pub fn new(enforcement_point: impl Into<String>, request: &Request, decision: &Decision) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind: RecordKind::Enforced,
            enforcement_point: enforcement_point.into(),
            engine_id: None,
            mode: None,
            snapshot_version: decision.snapshot_version,
            principal: request.principal.id.clone(),
            action: request.action.clone(),
            resource: request.resource.clone(),
            input_hash: hasher::hash_json(&request.input),
            decision: decision.effect,
            returned: decision.effect,
            determining: decision.determining.clone(),
            mismatched: decision.mismatched.clone(),
            diagnostics: decision.diagnostics.clone(),
            latency_micros: decision.latency_micros,
            previous_hash: None,
        }
    }

    /// A record for a request at an enforcement point with no engine.
    pub fn unattached(enforcement_point: impl Into<String>, request: &Request) -> Self {
        let mut record = Self::new(enforcement_point, request, &Decision::default_deny(0));
        record.kind = RecordKind::Unattached;
        record
    }

    /// Set the engine that decided.
    pub fn with_engine(mut self, engine_id: Uuid) -> Self {
        self.engine_id = Some(engine_id);
        self
    }

    /// Apply an attachment mode: sets the kind and the returned effect.
    pub fn with_mode(mut self, mode: EnforcementMode) -> Self {
        self.mode = Some(mode);
        self.kind = match mode {
            EnforcementMode::Enforce => RecordKind::Enforced,
            EnforcementMode::LogOnly => RecordKind::Shadow,
        };
        self.returned = mode.returned_effect(self.decision);
        self
    }
}
