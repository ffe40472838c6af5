// generator.rs — Natural-language policy generation jobs.
//
// A job asks the judge model for draft statements, then runs every draft
// through the validator and the analyzer against the engine's current
// policy set. Drafts are ranked by (fewest findings, fewest contradictions);
// ties keep the model's order. Drafts that do not parse rank last.
//
// Jobs run on the Tokio runtime, away from the decision path. Each has a
// timeout, can be cancelled, and is purged once its retention window has
// passed. A job never writes to the store: the caller picks a candidate
// and creates the policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use uuid::Uuid;

use verdict_policy::{
    parse_policy, AnalysisResult, Analyzer, Finding, Schema, SnapshotPolicy, ValidationMode,
    Validator,
};
use verdict_store::PolicyStore;

use crate::config::GenerationConfig;
use crate::error::{GatewayError, GenerationError};
use crate::judge::{DraftCandidate, DraftRequest, JudgeModel};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationStatus {
    Generating,
    Generated,
    GenerateFailed { reason: String },
}

/// A reviewed draft.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    /// Canonical text if the draft parses, otherwise the draft as given.
    pub statement: String,
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syntax_error: Option<String>,
    pub findings: Vec<Finding>,
    pub analysis: AnalysisResult,
    /// Rationale plus what review found, for the author.
    pub explanation: String,
}

impl Candidate {
    fn rank_key(&self) -> (bool, usize, usize) {
        (
            self.syntax_error.is_some(),
            self.findings.len(),
            self.analysis.contradictions.len(),
        )
    }

    /// Parses and has no findings.
    pub fn is_clean(&self) -> bool {
        self.syntax_error.is_none() && self.findings.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyGeneration {
    pub generation_id: Uuid,
    pub engine_id: Uuid,
    pub source_text: String,
    /// Fingerprint of the schema the caller generated against.
    pub target_schema: String,
    pub status: GenerationStatus,
    /// Best first, at most `max_candidates`.
    pub candidates: Vec<Candidate>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationLimits {
    pub max_candidates: usize,
    pub timeout: Duration,
    pub retention: Duration,
}

impl From<&GenerationConfig> for GenerationLimits {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            max_candidates: config.max_candidates,
            timeout: config.timeout(),
            retention: config.retention(),
        }
    }
}

struct Job {
    generation: PolicyGeneration,
    started: Instant,
    abort: Option<AbortHandle>,
    done: watch::Sender<bool>,
}

struct Shared {
    store: Arc<PolicyStore>,
    judge: Arc<dyn JudgeModel>,
    limits: GenerationLimits,
    validator: Validator,
    analyzer: Analyzer,
    jobs: Mutex<HashMap<Uuid, Job>>,
}

#[derive(Clone)]
pub struct PolicyGenerator {
    shared: Arc<Shared>,
}

impl PolicyGenerator {
    pub fn new(
        store: Arc<PolicyStore>,
        judge: Arc<dyn JudgeModel>,
        limits: GenerationLimits,
        max_clauses: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                judge,
                limits,
                validator: Validator::new(max_clauses),
                analyzer: Analyzer::new(max_clauses),
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start a job and return its id. `target_schema` is the fingerprint
    /// of the schema the caller expects; the job fails if the engine's
    /// schema has changed.
    ///
    /// Fails with `GatewayError::NoRuntime` outside a Tokio runtime.
    pub fn start(&self, engine_id: Uuid, text: &str, target_schema: &str) -> Result<Uuid, GatewayError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            tracing::warn!(%engine_id, error = %e, "policy generation requested outside a runtime");
            GatewayError::NoRuntime
        })?;
        self.purge_expired();
        self.shared.store.get_engine(engine_id)?;

        let generation = PolicyGeneration {
            generation_id: Uuid::new_v4(),
            engine_id,
            source_text: text.to_string(),
            target_schema: target_schema.to_string(),
            status: GenerationStatus::Generating,
            candidates: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
        };
        let id = generation.generation_id;
        let (done, _) = watch::channel(false);
        // Registered before spawning so the task always finds its entry.
        self.shared.jobs.lock().insert(
            id,
            Job {
                generation,
                started: Instant::now(),
                abort: None,
                done,
            },
        );

        let shared = Arc::clone(&self.shared);
        let text = text.to_string();
        let target = target_schema.to_string();
        let handle = runtime.spawn(async move { shared.run(id, engine_id, text, target).await });
        if let Some(job) = self.shared.jobs.lock().get_mut(&id) {
            job.abort = Some(handle.abort_handle());
        }

        tracing::info!(generation_id = %id, %engine_id, "started policy generation");
        Ok(id)
    }

    pub fn get(&self, generation_id: Uuid) -> Result<PolicyGeneration, GatewayError> {
        self.purge_expired();
        self.shared
            .jobs
            .lock()
            .get(&generation_id)
            .map(|job| job.generation.clone())
            .ok_or(GatewayError::GenerationNotFound(generation_id))
    }

    /// Live jobs, oldest first.
    pub fn list(&self) -> Vec<PolicyGeneration> {
        self.purge_expired();
        let mut generations: Vec<PolicyGeneration> = self
            .shared
            .jobs
            .lock()
            .values()
            .map(|job| job.generation.clone())
            .collect();
        generations.sort_by_key(|g| g.created_at);
        generations
    }

    /// Stop a running job. Finished jobs are returned unchanged.
    pub fn cancel(&self, generation_id: Uuid) -> Result<PolicyGeneration, GatewayError> {
        self.purge_expired();
        let mut jobs = self.shared.jobs.lock();
        let job = jobs
            .get_mut(&generation_id)
            .ok_or(GatewayError::GenerationNotFound(generation_id))?;
        if job.generation.status == GenerationStatus::Generating {
            if let Some(abort) = job.abort.take() {
                abort.abort();
            }
            finish(job, Err(GenerationError::Cancelled));
        }
        Ok(job.generation.clone())
    }

    /// Wait until the job leaves GENERATING.
    pub async fn wait(&self, generation_id: Uuid) -> Result<PolicyGeneration, GatewayError> {
        let mut done = {
            let jobs = self.shared.jobs.lock();
            jobs.get(&generation_id)
                .ok_or(GatewayError::GenerationNotFound(generation_id))?
                .done
                .subscribe()
        };
        // A closed channel means the job was purged.
        done.wait_for(|finished| *finished)
            .await
            .map_err(|_| GatewayError::GenerationNotFound(generation_id))?;
        self.get(generation_id)
    }

    fn purge_expired(&self) {
        let retention = self.shared.limits.retention;
        self.shared.jobs.lock().retain(|id, job| {
            let keep = job.started.elapsed() < retention;
            if !keep {
                if let Some(abort) = job.abort.take() {
                    abort.abort();
                }
                tracing::debug!(generation_id = %id, "purged expired policy generation");
            }
            keep
        });
    }
}

impl Shared {
    async fn run(&self, id: Uuid, engine_id: Uuid, text: String, target: String) {
        let outcome = match tokio::time::timeout(
            self.limits.timeout,
            self.generate(engine_id, &text, &target),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(timed_out(self.limits.timeout)),
        };

        let mut jobs = self.jobs.lock();
        if let Some(job) = jobs.get_mut(&id) {
            // Cancelled jobs are already finished.
            if job.generation.status == GenerationStatus::Generating {
                finish(job, outcome);
            }
        }
    }

    async fn generate(
        &self,
        engine_id: Uuid,
        text: &str,
        target: &str,
    ) -> Result<Vec<Candidate>, GenerationError> {
        let schema = self.store.schema(engine_id)?;
        let current = schema.fingerprint();
        if current != target {
            return Err(GenerationError::SchemaMismatch {
                requested: target.to_string(),
                current,
            });
        }

        let request = DraftRequest {
            text: text.to_string(),
            schema,
            max_candidates: self.limits.max_candidates,
        };
        let drafts = self.judge.draft(&request).await?;
        if drafts.is_empty() {
            return Err(GenerationError::NoCandidates);
        }

        // Reviewed against the policy set as it is now.
        let snapshot = self.store.snapshot(engine_id)?;
        let mut candidates: Vec<Candidate> = drafts
            .into_iter()
            .map(|draft| self.review(draft, &request.schema, snapshot.policies()))
            .collect();
        candidates.sort_by_key(Candidate::rank_key);
        candidates.truncate(self.limits.max_candidates);
        Ok(candidates)
    }

    fn review(&self, draft: DraftCandidate, schema: &Schema, existing: &[SnapshotPolicy]) -> Candidate {
        match parse_policy(&draft.statement) {
            Ok(statement) => {
                let mut findings = self
                    .validator
                    .validate(&statement, schema, ValidationMode::IgnoreAllFindings)
                    .findings;
                let analysis = self.analyzer.analyze(&statement, existing, schema);
                findings.extend(analysis.findings(existing));
                let explanation = explain(&draft.rationale, &findings);
                Candidate {
                    statement: statement.to_string(),
                    rationale: draft.rationale,
                    confidence: draft.confidence,
                    syntax_error: None,
                    findings,
                    analysis,
                    explanation,
                }
            }
            Err(e) => Candidate {
                explanation: format!("does not parse: {}", e),
                statement: draft.statement,
                rationale: draft.rationale,
                confidence: draft.confidence,
                syntax_error: Some(e.to_string()),
                findings: Vec::new(),
                analysis: AnalysisResult::default(),
            },
        }
    }
}

fn finish(job: &mut Job, outcome: Result<Vec<Candidate>, GenerationError>) {
    let id = job.generation.generation_id;
    match outcome {
        Ok(candidates) => {
            tracing::info!(generation_id = %id, candidates = candidates.len(), "policy generation finished");
            job.generation.status = GenerationStatus::Generated;
            job.generation.candidates = candidates;
        }
        Err(e) => {
            tracing::warn!(generation_id = %id, error = %e, "policy generation failed");
            job.generation.status = GenerationStatus::GenerateFailed {
                reason: e.to_string(),
            };
        }
    }
    job.generation.finished_at = Some(Utc::now());
    job.abort = None;
    job.done.send_replace(true);
}

/// Budgets beyond `u64::MAX` milliseconds report as `u64::MAX`.
fn timed_out(budget: Duration) -> GenerationError {
    GenerationError::Timeout {
        after_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
    }
}

fn explain(rationale: &str, findings: &[Finding]) -> String {
    let review = if findings.is_empty() {
        "no findings".to_string()
    } else {
        let listed: Vec<String> = findings.iter().map(|f| f.to_string()).collect();
        format!("{} finding(s): {}", findings.len(), listed.join("; "))
    };
    if rationale.is_empty() {
        review
    } else {
        format!("{} ({})", rationale, review)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verdict_policy::FindingKind;

    fn candidate(findings: usize, contradictions: usize, parses: bool) -> Candidate {
        Candidate {
            statement: String::new(),
            rationale: String::new(),
            confidence: None,
            syntax_error: (!parses).then(|| "bad".to_string()),
            findings: (0..findings)
                .map(|_| Finding::new(FindingKind::Redundant, "x"))
                .collect(),
            analysis: AnalysisResult {
                contradictions: (0..contradictions).map(|_| Uuid::new_v4()).collect(),
                ..AnalysisResult::default()
            },
            explanation: String::new(),
        }
    }

    #[test]
    fn rank_prefers_parsing_then_fewer_findings() {
        let unparsed = candidate(0, 0, false);
        let noisy = candidate(2, 0, true);
        let contradicting = candidate(2, 1, true);
        let clean = candidate(0, 0, true);
        let mut ranked = vec![unparsed, contradicting, noisy, clean];
        ranked.sort_by_key(Candidate::rank_key);
        let keys: Vec<_> = ranked.iter().map(Candidate::rank_key).collect();
        assert_eq!(
            keys,
            vec![(false, 0, 0), (false, 2, 0), (false, 2, 1), (true, 0, 0)]
        );
        assert!(ranked[0].is_clean());
    }

    #[test]
    fn explanation_includes_rationale_and_findings() {
        assert_eq!(explain("caps refunds", &[]), "caps refunds (no findings)");
        let text = explain("", &[Finding::new(FindingKind::AlwaysFalse, "never holds")]);
        assert!(text.starts_with("1 finding(s): "));
        assert!(text.contains("never holds"));
    }

    #[test]
    fn timeout_reports_saturated_budget() {
        assert!(matches!(
            timed_out(Duration::from_millis(1500)),
            GenerationError::Timeout { after_ms: 1500 }
        ));
        assert!(matches!(
            timed_out(Duration::MAX),
            GenerationError::Timeout { after_ms: u64::MAX }
        ));
    }
}
