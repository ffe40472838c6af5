// judge.rs — The external model that drafts policy statements from text.
//
// The model is slow and unreliable: everything it returns is parsed,
// validated and analyzed before a caller sees it, and nothing it returns
// is ever written to the store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use verdict_policy::Schema;

use crate::error::GenerationError;

/// What the model is asked to do.
#[derive(Debug, Clone)]
pub struct DraftRequest {
    /// The author's description of the rule, in natural language.
    pub text: String,
    /// The schema the statements must fit.
    pub schema: Schema,
    /// How many candidates are wanted. The model may return fewer or more.
    pub max_candidates: usize,
}

/// One statement as drafted by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DraftCandidate {
    pub statement: String,
    #[serde(default)]
    pub rationale: String,
    /// Advisory only; never used for ranking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl DraftCandidate {
    pub fn new(statement: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            rationale: rationale.into(),
            confidence: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

#[async_trait]
pub trait JudgeModel: Send + Sync {
    /// Draft candidate statements, in the model's preferred order.
    async fn draft(&self, request: &DraftRequest) -> Result<Vec<DraftCandidate>, GenerationError>;
}
