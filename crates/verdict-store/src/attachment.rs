// attachment.rs — Binding between an enforcement point and an engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use verdict_policy::EnforcementMode;

/// One enforcement point (gateway, tool router) bound to one engine.
///
/// An enforcement point has at most one attachment; updating it rebinds
/// the point. Changes apply to the next request the point handles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnforcementAttachment {
    pub enforcement_point: String,
    pub engine_id: Uuid,
    pub mode: EnforcementMode,
    pub updated_at: DateTime<Utc>,
}

impl EnforcementAttachment {
    pub fn new(enforcement_point: impl Into<String>, engine_id: Uuid, mode: EnforcementMode) -> Self {
        Self {
            enforcement_point: enforcement_point.into(),
            engine_id,
            mode,
            updated_at: Utc::now(),
        }
    }
}
