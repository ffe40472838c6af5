//! Policy generation jobs: ranking, isolation from the store, and the
//! failure paths (timeout, cancellation, expiry, schema drift).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use verdict_gateway::{
    DraftCandidate, DraftRequest, GatewayError, GenerationError, GenerationLimits,
    GenerationStatus, JudgeModel, PolicyGenerator,
};
use verdict_policy::{FindingKind, ToolDefinition, ValidationMode, DEFAULT_MAX_CLAUSES};
use verdict_store::PolicyStore;

/// Returns fixed drafts, optionally after a delay.
struct ScriptedJudge {
    drafts: Vec<DraftCandidate>,
    delay: Duration,
}

impl ScriptedJudge {
    fn new(drafts: Vec<DraftCandidate>) -> Self {
        Self {
            drafts,
            delay: Duration::ZERO,
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            drafts: vec![DraftCandidate::new("permit(principal, action, resource);", "")],
            delay,
        }
    }
}

#[async_trait]
impl JudgeModel for ScriptedJudge {
    async fn draft(&self, _request: &DraftRequest) -> Result<Vec<DraftCandidate>, GenerationError> {
        tokio::time::sleep(self.delay).await;
        Ok(self.drafts.clone())
    }
}

struct FailingJudge;

#[async_trait]
impl JudgeModel for FailingJudge {
    async fn draft(&self, _request: &DraftRequest) -> Result<Vec<DraftCandidate>, GenerationError> {
        Err(GenerationError::Model("upstream returned 503".to_string()))
    }
}

fn limits() -> GenerationLimits {
    GenerationLimits {
        max_candidates: 3,
        timeout: Duration::from_secs(5),
        retention: Duration::from_secs(60),
    }
}

fn refund_store() -> (Arc<PolicyStore>, Uuid, String) {
    let store = Arc::new(PolicyStore::in_memory().unwrap());
    let engine = store.create_engine("refunds", "").unwrap();
    let engine = store
        .refresh_schema(
            engine.engine_id,
            &[ToolDefinition::new(
                "process_refund",
                json!({
                    "type": "object",
                    "properties": { "amount": { "type": "number" } }
                }),
            )],
        )
        .unwrap();
    store
        .create_policy(
            engine.engine_id,
            "small-refunds",
            r#"permit(principal, action == "process_refund", resource) when { context.input.amount < 1000 };"#,
            ValidationMode::FailOnAnyFindings,
        )
        .unwrap();
    let fingerprint = engine.schema.fingerprint();
    (store, engine.engine_id, fingerprint)
}

fn generator(store: &Arc<PolicyStore>, judge: impl JudgeModel + 'static, limits: GenerationLimits) -> PolicyGenerator {
    PolicyGenerator::new(Arc::clone(store), Arc::new(judge), limits, DEFAULT_MAX_CLAUSES)
}

#[tokio::test]
async fn candidates_are_reviewed_and_ranked() {
    let (store, engine_id, fingerprint) = refund_store();
    let judge = ScriptedJudge::new(vec![
        DraftCandidate::new("forbid(principal, action ==", "truncated output"),
        DraftCandidate::new(
            r#"forbid(principal, action == "process_refund", resource);"#,
            "blocks every refund",
        ),
        DraftCandidate::new(
            r#"forbid(principal, action == "process_refund", resource) when { context.input.amount > 5000 };"#,
            "caps large refunds",
        )
        .with_confidence(0.7),
        DraftCandidate::new(
            r#"forbid(principal, action == "process_refund", resource) when { context.input.amount >= 5000 };"#,
            "caps large refunds, inclusive",
        ),
    ]);
    let generator = generator(&store, judge, limits());

    let id = generator
        .start(engine_id, "refunds over 5000 need a human", &fingerprint)
        .unwrap();
    let generation = generator.wait(id).await.unwrap();
    assert_eq!(generation.status, GenerationStatus::Generated);

    // Clean drafts first in model order, then the contradiction; the
    // unparseable draft is cut by max_candidates.
    let rationales: Vec<&str> = generation
        .candidates
        .iter()
        .map(|c| c.rationale.as_str())
        .collect();
    assert_eq!(
        rationales,
        vec![
            "caps large refunds",
            "caps large refunds, inclusive",
            "blocks every refund"
        ]
    );
    assert!(generation.candidates[0].is_clean());
    assert_eq!(generation.candidates[0].confidence, Some(0.7));
    assert_eq!(generation.candidates[2].findings[0].kind, FindingKind::Contradiction);
    assert!(generation.candidates[2].explanation.contains("finding(s)"));
}

#[tokio::test]
async fn generation_never_writes_to_the_store() {
    let (store, engine_id, fingerprint) = refund_store();
    let before = store.snapshot(engine_id).unwrap().version();
    let judge = ScriptedJudge::new(vec![DraftCandidate::new(
        r#"forbid(principal, action == "process_refund", resource) when { context.input.amount > 5000 };"#,
        "",
    )]);
    let generator = generator(&store, judge, limits());

    let id = generator.start(engine_id, "cap refunds", &fingerprint).unwrap();
    let generation = generator.wait(id).await.unwrap();
    assert_eq!(generation.candidates.len(), 1);
    assert_eq!(store.list_policies(engine_id).unwrap().len(), 1);
    assert_eq!(store.snapshot(engine_id).unwrap().version(), before);

    // The caller commits a candidate explicitly.
    store
        .create_policy(
            engine_id,
            "cap-refunds",
            &generation.candidates[0].statement,
            ValidationMode::FailOnAnyFindings,
        )
        .unwrap();
    assert_eq!(store.list_policies(engine_id).unwrap().len(), 2);
}

#[tokio::test]
async fn slow_model_times_out() {
    let (store, engine_id, fingerprint) = refund_store();
    let generator = generator(
        &store,
        ScriptedJudge::slow(Duration::from_secs(30)),
        GenerationLimits {
            timeout: Duration::from_millis(50),
            ..limits()
        },
    );
    let id = generator.start(engine_id, "anything", &fingerprint).unwrap();
    let generation = generator.wait(id).await.unwrap();
    match generation.status {
        GenerationStatus::GenerateFailed { reason } => assert!(reason.contains("timed out")),
        other => panic!("expected GenerateFailed, got {:?}", other),
    }
    assert!(generation.finished_at.is_some());
}

#[tokio::test]
async fn running_job_can_be_cancelled() {
    let (store, engine_id, fingerprint) = refund_store();
    let generator = generator(&store, ScriptedJudge::slow(Duration::from_secs(30)), limits());
    let id = generator.start(engine_id, "anything", &fingerprint).unwrap();
    assert_eq!(generator.get(id).unwrap().status, GenerationStatus::Generating);

    let cancelled = generator.cancel(id).unwrap();
    assert_eq!(
        cancelled.status,
        GenerationStatus::GenerateFailed {
            reason: "generation cancelled".to_string()
        }
    );
    assert_eq!(generator.wait(id).await.unwrap(), cancelled);
}

#[tokio::test]
async fn jobs_expire_after_retention() {
    let (store, engine_id, fingerprint) = refund_store();
    let judge = ScriptedJudge::new(vec![DraftCandidate::new("permit(principal, action, resource);", "")]);
    let generator = generator(
        &store,
        judge,
        GenerationLimits {
            retention: Duration::from_millis(100),
            ..limits()
        },
    );
    let id = generator.start(engine_id, "anything", &fingerprint).unwrap();
    generator.wait(id).await.unwrap();
    assert_eq!(generator.list().len(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(matches!(
        generator.get(id),
        Err(GatewayError::GenerationNotFound(missing)) if missing == id
    ));
    assert!(generator.list().is_empty());
}

#[tokio::test]
async fn stale_schema_reference_fails_the_job() {
    let (store, engine_id, _) = refund_store();
    let generator = generator(&store, ScriptedJudge::new(Vec::new()), limits());
    let id = generator.start(engine_id, "anything", "not-the-fingerprint").unwrap();
    match generator.wait(id).await.unwrap().status {
        GenerationStatus::GenerateFailed { reason } => {
            assert!(reason.contains("does not match"), "{}", reason)
        }
        other => panic!("expected GenerateFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn model_errors_fail_the_job() {
    let (store, engine_id, fingerprint) = refund_store();
    let generator = generator(&store, FailingJudge, limits());
    let id = generator.start(engine_id, "anything", &fingerprint).unwrap();
    match generator.wait(id).await.unwrap().status {
        GenerationStatus::GenerateFailed { reason } => assert!(reason.contains("503")),
        other => panic!("expected GenerateFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn unknown_engine_is_rejected_up_front() {
    let (store, _, fingerprint) = refund_store();
    let generator = generator(&store, FailingJudge, limits());
    assert!(matches!(
        generator.start(Uuid::new_v4(), "anything", &fingerprint),
        Err(GatewayError::Store(_))
    ));
}

#[tokio::test]
async fn empty_model_response_fails_the_job() {
    let (store, engine_id, fingerprint) = refund_store();
    let generator = generator(&store, ScriptedJudge::new(Vec::new()), limits());
    let id = generator.start(engine_id, "anything", &fingerprint).unwrap();
    assert_eq!(
        generator.wait(id).await.unwrap().status,
        GenerationStatus::GenerateFailed {
            reason: "judge model returned no candidates".to_string()
        }
    );
}

#[test]
fn starting_outside_a_runtime_is_an_error() {
    let (store, engine_id, fingerprint) = refund_store();
    let generator = generator(&store, ScriptedJudge::new(Vec::new()), limits());

    assert!(matches!(
        generator.start(engine_id, "allow small refunds", &fingerprint),
        Err(GatewayError::NoRuntime)
    ));
    // Nothing is left behind for a job that never started.
    assert!(generator.list().is_empty());
}
