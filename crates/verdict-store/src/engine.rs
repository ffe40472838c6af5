// engine.rs — PolicyEngine record and its lifecycle state machine.
//
//   CREATING ──→ ACTIVE ⇄ UPDATING ──→ UPDATE_FAILED
//       │           │         │              │
//       ↓           ↓         ↓              ↓
//  CREATE_FAILED ─→ DELETING ←───────────────┘
//                     │  ↑
//                     ↓  │
//                 DELETE_FAILED
//
// A deleted engine is removed from the store, so there is no terminal state
// after DELETING.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use verdict_policy::Schema;

use crate::attachment::EnforcementAttachment;
use crate::error::StoreError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineStatus {
    Creating,
    Active,
    /// A schema refresh is being applied.
    Updating,
    Deleting,
    CreateFailed { reason: String },
    UpdateFailed { reason: String },
    DeleteFailed { reason: String },
}

impl EngineStatus {
    /// Check if a transition from the current status to `next` is allowed.
    pub fn can_transition_to(&self, next: &EngineStatus) -> bool {
        matches!(
            (self, next),
            (EngineStatus::Creating, EngineStatus::Active)
                | (EngineStatus::Creating, EngineStatus::CreateFailed { .. })
                | (EngineStatus::Active, EngineStatus::Updating)
                | (EngineStatus::Active, EngineStatus::Deleting)
                | (EngineStatus::Updating, EngineStatus::Active)
                | (EngineStatus::Updating, EngineStatus::UpdateFailed { .. })
                | (EngineStatus::Updating, EngineStatus::Deleting)
                // A failed update can be retried.
                | (EngineStatus::UpdateFailed { .. }, EngineStatus::Updating)
                | (EngineStatus::UpdateFailed { .. }, EngineStatus::Deleting)
                | (EngineStatus::CreateFailed { .. }, EngineStatus::Deleting)
                | (EngineStatus::Deleting, EngineStatus::DeleteFailed { .. })
                | (EngineStatus::DeleteFailed { .. }, EngineStatus::Deleting)
        )
    }

    /// Whether policies may be added, changed or removed, and whether
    /// enforcement points may attach.
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            EngineStatus::Active | EngineStatus::UpdateFailed { .. }
        )
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineStatus::Creating => write!(f, "CREATING"),
            EngineStatus::Active => write!(f, "ACTIVE"),
            EngineStatus::Updating => write!(f, "UPDATING"),
            EngineStatus::Deleting => write!(f, "DELETING"),
            EngineStatus::CreateFailed { reason } => write!(f, "CREATE_FAILED ({})", reason),
            EngineStatus::UpdateFailed { reason } => write!(f, "UPDATE_FAILED ({})", reason),
            EngineStatus::DeleteFailed { reason } => write!(f, "DELETE_FAILED ({})", reason),
        }
    }
}

/// A named container for a schema and a policy set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyEngine {
    pub engine_id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub status: EngineStatus,
    pub schema: Schema,
    /// Version of the snapshot currently published for this engine.
    pub snapshot_version: u64,
    /// Enforcement points bound to this engine, keyed by enforcement point
    /// id. Any entry locks the engine's policies.
    #[serde(default)]
    pub attachments: BTreeMap<String, EnforcementAttachment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PolicyEngine {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            engine_id: Uuid::new_v4(),
            name: name.into(),
            description: description.into(),
            status: EngineStatus::Creating,
            schema: Schema::empty(),
            snapshot_version: 0,
            attachments: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Transition to a new status, validating the transition.
    pub fn transition(&mut self, next: EngineStatus) -> Result<(), StoreError> {
        if !self.status.can_transition_to(&next) {
            return Err(StoreError::InvalidTransition {
                engine_id: self.engine_id,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!(engine_id = %self.engine_id, from = %self.status, to = %next, "engine transition");
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Fail unless policies and attachments may change.
    pub fn ensure_usable(&self) -> Result<(), StoreError> {
        if self.status.is_usable() {
            Ok(())
        } else {
            Err(StoreError::EngineNotReady {
                engine_id: self.engine_id,
                status: self.status.to_string(),
            })
        }
    }

    pub fn is_locked(&self) -> bool {
        !self.attachments.is_empty()
    }

    pub fn attachment_ids(&self) -> Vec<String> {
        self.attachments.keys().cloned().collect()
    }
}
