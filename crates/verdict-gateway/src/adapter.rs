// adapter.rs — The boundary the external gateway calls on every tool call.
//
// Resolves the enforcement point's attachment, decides against the
// attached engine's current snapshot, applies the attachment's mode, and
// hands a record to the audit sink:
//
//   attached, ENFORCE   → the computed effect is returned
//   attached, LOG_ONLY  → ALLOW is returned; the record keeps the computed effect
//   not attached        → DENY is returned (fail closed)
//
// A sink failure is logged and never changes what the gateway is told.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use verdict_audit::{AuditSink, DecisionRecord};
use verdict_policy::{Decision, DecisionEffect, EnforcementMode, Principal, Request};
use verdict_store::PolicyStore;

/// What the gateway is told for one call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdapterResponse {
    /// The effect the gateway must apply.
    pub effect: DecisionEffect,
    /// The decision the engine computed; `None` when no engine is attached.
    pub decision: Option<Decision>,
    pub engine_id: Option<Uuid>,
    pub mode: Option<EnforcementMode>,
}

impl AdapterResponse {
    pub fn is_allowed(&self) -> bool {
        self.effect == DecisionEffect::Allow
    }
}

pub struct EnforcementAdapter {
    store: Arc<PolicyStore>,
    sink: Arc<dyn AuditSink>,
}

impl EnforcementAdapter {
    pub fn new(store: Arc<PolicyStore>, sink: Arc<dyn AuditSink>) -> Self {
        Self { store, sink }
    }

    pub fn on_request(
        &self,
        enforcement_point: &str,
        principal: Principal,
        action: &str,
        resource: &str,
        input: Value,
    ) -> AdapterResponse {
        let request = Request::new(principal, action, resource, input);
        self.handle(enforcement_point, &request)
    }

    pub fn handle(&self, enforcement_point: &str, request: &Request) -> AdapterResponse {
        let Some(binding) = self.store.resolve(enforcement_point) else {
            tracing::debug!(enforcement_point, action = %request.action, "no engine attached; denying");
            self.audit(DecisionRecord::unattached(enforcement_point, request));
            return AdapterResponse {
                effect: DecisionEffect::Deny,
                decision: None,
                engine_id: None,
                mode: None,
            };
        };

        let decision = binding.authorize(request);
        let mode = binding.mode();
        let effect = mode.returned_effect(decision.effect);
        tracing::debug!(
            enforcement_point,
            action = %request.action,
            computed = %decision.effect,
            returned = %effect,
            %mode,
            version = decision.snapshot_version,
            "decided tool call"
        );

        self.audit(
            DecisionRecord::new(enforcement_point, request, &decision)
                .with_engine(binding.engine_id())
                .with_mode(mode),
        );
        AdapterResponse {
            effect,
            decision: Some(decision),
            engine_id: Some(binding.engine_id()),
            mode: Some(mode),
        }
    }

    fn audit(&self, record: DecisionRecord) {
        if let Err(e) = self.sink.record(record) {
            tracing::warn!(error = %e, "failed to record decision");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use verdict_audit::{AuditError, MemoryAuditSink, RecordKind};
    use verdict_policy::ValidationMode;

    struct BrokenSink;

    impl AuditSink for BrokenSink {
        fn record(&self, _record: DecisionRecord) -> Result<(), AuditError> {
            Err(AuditError::SinkUnavailable("disk full".to_string()))
        }
    }

    fn store_with_permit() -> (Arc<PolicyStore>, Uuid) {
        let store = Arc::new(PolicyStore::in_memory().unwrap());
        let engine = store.create_engine("refunds", "").unwrap();
        store
            .create_policy(
                engine.engine_id,
                "small",
                r#"permit(principal, action == "process_refund", resource) when { context.input.amount < 1000 };"#,
                ValidationMode::FailOnAnyFindings,
            )
            .unwrap();
        (store, engine.engine_id)
    }

    fn refund(adapter: &EnforcementAdapter, amount: i64) -> AdapterResponse {
        adapter.on_request(
            "gwA",
            Principal::new("agent"),
            "process_refund",
            "gwA",
            json!({ "amount": amount }),
        )
    }

    #[test]
    fn unattached_point_fails_closed() {
        let (store, _) = store_with_permit();
        let sink = Arc::new(MemoryAuditSink::new());
        let adapter = EnforcementAdapter::new(store, sink.clone());
        let response = adapter.on_request(
            "gw-unknown",
            Principal::new("agent"),
            "process_refund",
            "gw-unknown",
            json!({ "amount": 1 }),
        );
        assert_eq!(response.effect, DecisionEffect::Deny);
        assert!(response.decision.is_none());
        assert_eq!(sink.records()[0].kind, RecordKind::Unattached);
    }

    #[test]
    fn enforce_returns_computed_effect() {
        let (store, engine_id) = store_with_permit();
        store
            .update_attachment("gwA", engine_id, EnforcementMode::Enforce)
            .unwrap();
        let sink = Arc::new(MemoryAuditSink::new());
        let adapter = EnforcementAdapter::new(store, sink.clone());

        let allowed = refund(&adapter, 10);
        let denied = refund(&adapter, 10_000);
        assert!(allowed.is_allowed());
        assert!(!denied.is_allowed());
        assert_eq!(allowed.engine_id, Some(engine_id));

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].decision, DecisionEffect::Deny);
        assert_eq!(records[1].returned, DecisionEffect::Deny);
    }

    #[test]
    fn sink_failure_does_not_change_the_answer() {
        let (store, engine_id) = store_with_permit();
        store
            .update_attachment("gwA", engine_id, EnforcementMode::Enforce)
            .unwrap();
        let adapter = EnforcementAdapter::new(store, Arc::new(BrokenSink));
        assert!(refund(&adapter, 10).is_allowed());
    }
}
