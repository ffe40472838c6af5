// policy.rs — Stored policy record.
//
// The statement is persisted as its canonical text so engine files stay
// readable and hand-editable; it is parsed again on load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use verdict_policy::{Finding, PolicyStatement, SnapshotPolicy};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationStatus {
    /// No findings when last checked.
    Valid,
    /// Accepted with findings under IGNORE_ALL_FINDINGS.
    ValidWithFindings,
    /// The engine's schema no longer declares actions the policy names.
    /// The policy still evaluates; it can only match calls that no longer
    /// exist.
    Stale { missing_actions: Vec<String> },
}

impl ValidationStatus {
    pub fn from_findings(findings: &[Finding]) -> Self {
        if findings.is_empty() {
            ValidationStatus::Valid
        } else {
            ValidationStatus::ValidWithFindings
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Policy {
    pub policy_id: Uuid,
    pub engine_id: Uuid,
    pub name: String,
    #[serde(with = "statement_text")]
    pub statement: PolicyStatement,
    pub validation: ValidationStatus,
    /// Findings recorded when the policy was accepted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<Finding>,
    /// True while the owning engine has any enforcement attachment.
    #[serde(default)]
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloned_from: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    pub fn new(
        engine_id: Uuid,
        name: impl Into<String>,
        statement: PolicyStatement,
        findings: Vec<Finding>,
    ) -> Self {
        let now = Utc::now();
        Self {
            policy_id: Uuid::new_v4(),
            engine_id,
            name: name.into(),
            statement,
            validation: ValidationStatus::from_findings(&findings),
            findings,
            locked: false,
            cloned_from: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Canonical statement text.
    pub fn text(&self) -> String {
        self.statement.to_string()
    }

    pub fn is_stale(&self) -> bool {
        matches!(self.validation, ValidationStatus::Stale { .. })
    }

    pub(crate) fn to_snapshot(&self) -> SnapshotPolicy {
        SnapshotPolicy::new(self.policy_id, self.name.clone(), self.statement.clone())
    }
}

mod statement_text {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    use verdict_policy::{parse_policy, PolicyStatement};

    pub fn serialize<S: Serializer>(statement: &PolicyStatement, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(statement)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<PolicyStatement, D::Error> {
        let text = String::deserialize(d)?;
        parse_policy(&text).map_err(D::Error::custom)
    }
}
