//! Readers racing a writer only ever see complete snapshots.
//!
//! The writer adds a permit and a forbid for the same action together in
//! one import, so any snapshot a reader loads holds them in pairs. Versions
//! seen by one reader never go back.

use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::json;
use verdict_policy::{DecisionEffect, EnforcementMode, Principal, Request, ValidationMode};
use verdict_store::{PolicyStore, StoreError};

const PAIR: &str = r#"
    permit(principal, action == "process_refund", resource);
    forbid(principal, action == "process_refund", resource) when { context.input.amount > 100 };
"#;

fn request(amount: i64) -> Request {
    Request::new(
        Principal::new("agent"),
        "process_refund",
        "gwA",
        json!({ "amount": amount }),
    )
}

#[test]
fn readers_never_observe_partial_updates() -> anyhow::Result<()> {
    let store = PolicyStore::in_memory()?;
    let engine = store.create_engine("refunds", "")?;
    store.update_attachment("gwA", engine.engine_id, EnforcementMode::Enforce)?;
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        let store = &store;
        let done = &done;

        for _ in 0..4 {
            s.spawn(move || {
                let mut last_version = 0;
                while !done.load(Ordering::Acquire) {
                    let binding = store.resolve("gwA").expect("attached");
                    let snapshot = binding.snapshot();
                    assert!(snapshot.version() >= last_version);
                    last_version = snapshot.version();
                    assert_eq!(
                        snapshot.len() % 2,
                        0,
                        "saw {} policies at version {}",
                        snapshot.len(),
                        snapshot.version()
                    );

                    let small = verdict_policy::authorize(&request(5), &snapshot);
                    let large = verdict_policy::authorize(&request(500), &snapshot);
                    assert_eq!(large.effect, DecisionEffect::Deny);
                    assert_eq!(large.determining.len(), snapshot.len() / 2);
                    if snapshot.is_empty() {
                        assert_eq!(small.effect, DecisionEffect::Deny);
                    } else {
                        assert_eq!(small.effect, DecisionEffect::Allow);
                    }
                }
            });
        }

        s.spawn(move || {
            for _ in 0..40 {
                store
                    .import_policy_set(engine.engine_id, PAIR, ValidationMode::IgnoreAllFindings)
                    .expect("import");
            }
            done.store(true, Ordering::Release);
        });
    });

    let snapshot = store.snapshot(engine.engine_id)?;
    assert_eq!(snapshot.len(), 80);
    assert_eq!(snapshot.version(), 40);
    Ok(())
}

#[test]
fn evaluation_pins_one_snapshot() -> anyhow::Result<()> {
    let store = PolicyStore::in_memory()?;
    let engine = store.create_engine("refunds", "")?;
    store.import_policy_set(engine.engine_id, PAIR, ValidationMode::IgnoreAllFindings)?;
    let pinned = store.snapshot(engine.engine_id)?;

    let policies = store.list_policies(engine.engine_id)?;
    for policy in &policies {
        store.delete_policy(policy.policy_id)?;
    }

    // The pinned snapshot is unaffected by later writes.
    let decision = verdict_policy::authorize(&request(5), &pinned);
    assert_eq!(decision.effect, DecisionEffect::Allow);
    assert_eq!(decision.snapshot_version, 1);

    let current = store.authorize(engine.engine_id, &request(5))?;
    assert_eq!(current.effect, DecisionEffect::Deny);
    assert_eq!(current.snapshot_version, 3);
    Ok(())
}

#[test]
fn unknown_engine_is_an_error_not_a_decision() {
    let store = PolicyStore::in_memory().unwrap();
    let missing = uuid::Uuid::new_v4();
    assert!(matches!(
        store.authorize(missing, &request(1)),
        Err(StoreError::EngineNotFound(id)) if id == missing
    ));
}
