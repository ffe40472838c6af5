// evaluator.rs — The authorization decision.
//
// `authorize` is a pure function of (request, snapshot):
//
//   1. Take the candidates the snapshot's action index returns and keep
//      those whose principal and resource constraints match.
//   2. Evaluate each candidate's clauses. A missing attribute, a type
//      mismatch or an unusable pattern makes that policy "mismatched":
//      it is not satisfied, and the reason is kept as a diagnostic.
//   3. Any satisfied forbid → DENY (determined by the satisfied forbids).
//      Otherwise any satisfied permit → ALLOW (determined by the permits).
//      Otherwise DENY with nothing determining it.
//
// No I/O, no locks, no allocation beyond the result vectors.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ast::{
    Attribute, CmpOp, ConditionKind, Effect, Expr, Literal, PolicyStatement, PrincipalConstraint,
    ResourceConstraint,
};
use crate::snapshot::PolicySnapshot;

/// The caller of a tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// One tool call to authorize.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub principal: Principal,
    pub action: String,
    pub resource: String,
    /// The tool call's input document.
    #[serde(default)]
    pub input: Value,
}

impl Request {
    pub fn new(
        principal: Principal,
        action: impl Into<String>,
        resource: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            principal,
            action: action.into(),
            resource: resource.into(),
            input,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionEffect {
    Allow,
    Deny,
}

impl fmt::Display for DecisionEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionEffect::Allow => write!(f, "ALLOW"),
            DecisionEffect::Deny => write!(f, "DENY"),
        }
    }
}

/// How an enforcement point applies computed decisions.
///
/// Both modes consume the engine's snapshot on every request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnforcementMode {
    /// The computed effect is returned to the caller.
    Enforce,
    /// The caller always gets ALLOW; the computed effect is only audited.
    LogOnly,
}

impl EnforcementMode {
    /// The effect handed back to the gateway for a computed decision.
    pub fn returned_effect(self, computed: DecisionEffect) -> DecisionEffect {
        match self {
            EnforcementMode::Enforce => computed,
            EnforcementMode::LogOnly => DecisionEffect::Allow,
        }
    }
}

impl fmt::Display for EnforcementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnforcementMode::Enforce => write!(f, "ENFORCE"),
            EnforcementMode::LogOnly => write!(f, "LOG_ONLY"),
        }
    }
}

/// Why a policy could not be evaluated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum MismatchReason {
    MissingAttribute { attribute: String },
    TypeMismatch {
        attribute: String,
        expected: String,
        found: String,
    },
    InvalidPattern { pattern: String },
}

impl fmt::Display for MismatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MismatchReason::MissingAttribute { attribute } => {
                write!(f, "{} is missing", attribute)
            }
            MismatchReason::TypeMismatch {
                attribute,
                expected,
                found,
            } => write!(f, "{} is a {}, expected {}", attribute, found, expected),
            MismatchReason::InvalidPattern { pattern } => {
                write!(f, "pattern \"{}\" is invalid", pattern)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Diagnostic {
    pub policy_id: Uuid,
    pub reason: MismatchReason,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Decision {
    pub effect: DecisionEffect,
    /// The policies that produced the effect, in snapshot order.
    pub determining: Vec<Uuid>,
    /// Policies in scope whose conditions could not be evaluated.
    pub mismatched: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
    pub snapshot_version: u64,
    pub latency_micros: u64,
}

impl Decision {
    /// DENY with nothing determining it.
    pub fn default_deny(snapshot_version: u64) -> Self {
        Self {
            effect: DecisionEffect::Deny,
            determining: Vec::new(),
            mismatched: Vec::new(),
            diagnostics: Vec::new(),
            snapshot_version,
            latency_micros: 0,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.effect == DecisionEffect::Allow
    }
}

/// Decide one request against one snapshot.
pub fn authorize(request: &Request, snapshot: &PolicySnapshot) -> Decision {
    let started = Instant::now();
    let mut forbids = Vec::new();
    let mut permits = Vec::new();
    let mut mismatched = Vec::new();
    let mut diagnostics = Vec::new();

    for policy in snapshot.candidates(&request.action) {
        if !scope_matches(&policy.statement, request) {
            continue;
        }
        match conditions_hold(&policy.statement, request, snapshot) {
            Ok(true) => match policy.statement.effect {
                Effect::Forbid => forbids.push(policy.id),
                Effect::Permit => permits.push(policy.id),
            },
            Ok(false) => {}
            Err(reason) => {
                mismatched.push(policy.id);
                diagnostics.push(Diagnostic {
                    policy_id: policy.id,
                    reason,
                });
            }
        }
    }

    let (effect, determining) = if !forbids.is_empty() {
        (DecisionEffect::Deny, forbids)
    } else if !permits.is_empty() {
        (DecisionEffect::Allow, permits)
    } else {
        (DecisionEffect::Deny, Vec::new())
    };

    let decision = Decision {
        effect,
        determining,
        mismatched,
        diagnostics,
        snapshot_version: snapshot.version(),
        latency_micros: u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
    };
    tracing::trace!(
        action = %request.action,
        principal = %request.principal.id,
        effect = %decision.effect,
        determining = decision.determining.len(),
        mismatched = decision.mismatched.len(),
        version = decision.snapshot_version,
        "authorized request"
    );
    decision
}

fn scope_matches(statement: &PolicyStatement, request: &Request) -> bool {
    let principal = match &statement.principal {
        PrincipalConstraint::Any => true,
        PrincipalConstraint::Exact { id } => *id == request.principal.id,
        PrincipalConstraint::Tagged { key, value } => {
            request.principal.tags.get(key) == Some(value)
        }
    };
    let resource = match &statement.resource {
        ResourceConstraint::Any => true,
        ResourceConstraint::Exact { id } => *id == request.resource,
    };
    principal && resource && statement.action.contains(&request.action)
}

fn conditions_hold(
    statement: &PolicyStatement,
    request: &Request,
    snapshot: &PolicySnapshot,
) -> Result<bool, MismatchReason> {
    for condition in &statement.conditions {
        let value = eval(&condition.body, request, snapshot)?;
        let holds = match condition.kind {
            ConditionKind::When => value,
            ConditionKind::Unless => !value,
        };
        if !holds {
            return Ok(false);
        }
    }
    Ok(true)
}

/// A resolved attribute value.
#[derive(Clone, Copy)]
enum Found<'a> {
    Json(&'a Value),
    Tag(&'a str),
}

impl<'a> Found<'a> {
    fn as_str(self) -> Option<&'a str> {
        match self {
            Found::Json(v) => v.as_str(),
            Found::Tag(s) => Some(s),
        }
    }

    fn as_f64(self) -> Option<f64> {
        match self {
            Found::Json(v) => v.as_f64(),
            Found::Tag(_) => None,
        }
    }

    fn as_bool(self) -> Option<bool> {
        match self {
            Found::Json(v) => v.as_bool(),
            Found::Tag(_) => None,
        }
    }

    fn type_name(self) -> &'static str {
        match self {
            Found::Tag(_) => "string",
            Found::Json(Value::String(_)) => "string",
            Found::Json(Value::Number(_)) => "number",
            Found::Json(Value::Bool(_)) => "boolean",
            Found::Json(Value::Array(_)) => "array",
            Found::Json(Value::Object(_)) => "object",
            Found::Json(Value::Null) => "null",
        }
    }

    fn equals(self, literal: &Literal) -> Option<bool> {
        match literal {
            Literal::Number(n) => self.as_f64().map(|v| v == *n),
            Literal::String(s) => self.as_str().map(|v| v == s),
            Literal::Bool(b) => self.as_bool().map(|v| v == *b),
        }
    }
}

/// Look up an attribute; JSON `null` counts as absent.
fn resolve<'a>(attr: &Attribute, request: &'a Request) -> Option<Found<'a>> {
    match attr {
        Attribute::Input(path) => {
            let mut current = &request.input;
            for segment in path {
                current = current.as_object()?.get(segment)?;
            }
            if current.is_null() {
                None
            } else {
                Some(Found::Json(current))
            }
        }
        Attribute::PrincipalTag(key) => request
            .principal
            .tags
            .get(key)
            .map(|v| Found::Tag(v.as_str())),
    }
}

fn require<'a>(attr: &Attribute, request: &'a Request) -> Result<Found<'a>, MismatchReason> {
    resolve(attr, request).ok_or_else(|| MismatchReason::MissingAttribute {
        attribute: attr.to_string(),
    })
}

fn mismatch(attr: &Attribute, expected: &str, found: &str) -> MismatchReason {
    MismatchReason::TypeMismatch {
        attribute: attr.to_string(),
        expected: expected.to_string(),
        found: found.to_string(),
    }
}

fn eval(expr: &Expr, request: &Request, snapshot: &PolicySnapshot) -> Result<bool, MismatchReason> {
    match expr {
        Expr::Bool { value } => Ok(*value),
        Expr::Has { attr } => Ok(resolve(attr, request).is_some()),
        Expr::Compare { attr, op, value } => {
            let found = require(attr, request)?;
            compare(attr, found, *op, value)
        }
        Expr::In { attr, values } => {
            let found = require(attr, request)?;
            Ok(values
                .iter()
                .any(|literal| found.equals(literal).unwrap_or(false)))
        }
        Expr::Like { attr, pattern } => {
            let found = require(attr, request)?;
            let text = found
                .as_str()
                .ok_or_else(|| mismatch(attr, "string", found.type_name()))?;
            let compiled = snapshot
                .pattern(pattern)
                .ok_or_else(|| MismatchReason::InvalidPattern {
                    pattern: pattern.clone(),
                })?;
            Ok(compiled.matches(text))
        }
        Expr::Not { inner } => eval(inner, request, snapshot).map(|v| !v),
        Expr::And { left, right } => {
            if !eval(left, request, snapshot)? {
                return Ok(false);
            }
            eval(right, request, snapshot)
        }
        Expr::Or { left, right } => {
            if eval(left, request, snapshot)? {
                return Ok(true);
            }
            eval(right, request, snapshot)
        }
    }
}

fn compare(attr: &Attribute, found: Found<'_>, op: CmpOp, literal: &Literal) -> Result<bool, MismatchReason> {
    if op.is_ordering() {
        let Literal::Number(bound) = literal else {
            return Err(mismatch(attr, "number", literal.type_name()));
        };
        let value = found
            .as_f64()
            .ok_or_else(|| mismatch(attr, "number", found.type_name()))?;
        return Ok(match op {
            CmpOp::Lt => value < *bound,
            CmpOp::Le => value <= *bound,
            CmpOp::Gt => value > *bound,
            _ => value >= *bound,
        });
    }
    let equal = found
        .equals(literal)
        .ok_or_else(|| mismatch(attr, literal.type_name(), found.type_name()))?;
    Ok(if op == CmpOp::Eq { equal } else { !equal })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_policy;
    use crate::snapshot::SnapshotPolicy;
    use serde_json::json;

    fn snapshot(texts: &[&str]) -> (PolicySnapshot, Vec<Uuid>) {
        let policies: Vec<SnapshotPolicy> = texts
            .iter()
            .map(|t| SnapshotPolicy::new(Uuid::new_v4(), "p", parse_policy(t).unwrap()))
            .collect();
        let ids = policies.iter().map(|p| p.id).collect();
        (PolicySnapshot::new(1, policies), ids)
    }

    fn refund(amount: Value) -> Request {
        Request::new(
            Principal::new("userX"),
            "process_refund",
            "gwA",
            json!({ "amount": amount }),
        )
    }

    #[test]
    fn log_only_always_returns_allow() {
        assert_eq!(
            EnforcementMode::LogOnly.returned_effect(DecisionEffect::Deny),
            DecisionEffect::Allow
        );
        assert_eq!(
            EnforcementMode::Enforce.returned_effect(DecisionEffect::Deny),
            DecisionEffect::Deny
        );
    }

    #[test]
    fn empty_snapshot_denies() {
        let decision = authorize(&refund(json!(5)), &PolicySnapshot::empty());
        assert_eq!(decision.effect, DecisionEffect::Deny);
        assert!(decision.determining.is_empty());
    }

    #[test]
    fn permit_below_threshold() {
        let (snap, ids) = snapshot(&[
            r#"permit(*, action == "process_refund", *) when { context.input.amount < 1000 };"#,
        ]);
        let allowed = authorize(&refund(json!(500)), &snap);
        assert_eq!(allowed.effect, DecisionEffect::Allow);
        assert_eq!(allowed.determining, vec![ids[0]]);

        let denied = authorize(&refund(json!(5000)), &snap);
        assert_eq!(denied.effect, DecisionEffect::Deny);
        assert!(denied.determining.is_empty());
        assert!(denied.mismatched.is_empty());
    }

    #[test]
    fn forbid_overrides_permits() {
        let (snap, ids) = snapshot(&[
            r#"permit(principal.tags.role == "manager", action, resource);"#,
            r#"permit(*, action == "process_refund", *) when { context.input.amount < 1000 };"#,
            r#"forbid(*, action == "process_refund", *) when { context.input.amount >= 10000 };"#,
        ]);
        let request = Request::new(
            Principal::new("boss").with_tag("role", "manager"),
            "process_refund",
            "gwA",
            json!({ "amount": 12000 }),
        );
        let decision = authorize(&request, &snap);
        assert_eq!(decision.effect, DecisionEffect::Deny);
        assert_eq!(decision.determining, vec![ids[2]]);
    }

    #[test]
    fn missing_attribute_is_mismatched_not_fatal() {
        let (snap, ids) = snapshot(&[
            r#"permit(*, action == "process_refund", *) when { context.input.amount < 1000 };"#,
            r#"permit(*, action == "process_refund", *) when { context.input has reason };"#,
        ]);
        let request = Request::new(Principal::new("u"), "process_refund", "gwA", json!({}));
        let decision = authorize(&request, &snap);
        assert_eq!(decision.effect, DecisionEffect::Deny);
        assert_eq!(decision.mismatched, vec![ids[0]]);
        assert_eq!(
            decision.diagnostics[0].reason,
            MismatchReason::MissingAttribute {
                attribute: "context.input.amount".to_string()
            }
        );
    }

    #[test]
    fn type_mismatch_is_mismatched() {
        let (snap, ids) = snapshot(&[
            r#"permit(*, action == "process_refund", *) when { context.input.amount < 1000 };"#,
        ]);
        let decision = authorize(&refund(json!("lots")), &snap);
        assert_eq!(decision.effect, DecisionEffect::Deny);
        assert_eq!(decision.mismatched, vec![ids[0]]);
        assert!(matches!(
            decision.diagnostics[0].reason,
            MismatchReason::TypeMismatch { .. }
        ));
    }

    #[test]
    fn mismatched_forbid_does_not_deny_by_itself() {
        let (snap, ids) = snapshot(&[
            r#"permit(*, action == "process_refund", *);"#,
            r#"forbid(*, action == "process_refund", *) when { context.input.customer.tier == "trial" };"#,
        ]);
        let decision = authorize(&refund(json!(10)), &snap);
        assert_eq!(decision.effect, DecisionEffect::Allow);
        assert_eq!(decision.determining, vec![ids[0]]);
        assert_eq!(decision.mismatched, vec![ids[1]]);
    }

    #[test]
    fn short_circuit_guards_optional_attributes() {
        let (snap, _) = snapshot(&[
            r#"permit(*, action == "process_refund", *)
               when { !(context.input has note) || context.input.note like "ticket-*" };"#,
        ]);
        assert!(authorize(&refund(json!(1)), &snap).is_allowed());
        let with_note = Request::new(
            Principal::new("u"),
            "process_refund",
            "gwA",
            json!({ "amount": 1, "note": "ticket-42" }),
        );
        assert!(authorize(&with_note, &snap).is_allowed());
    }

    #[test]
    fn unless_clause_blocks() {
        let (snap, _) = snapshot(&[
            r#"permit(*, action, *) unless { principal.tags.suspended == "true" };"#,
        ]);
        let ok = Request::new(Principal::new("u"), "anything", "gw", json!({}));
        assert!(authorize(&ok, &snap).is_allowed());
        let suspended = Request::new(
            Principal::new("u").with_tag("suspended", "true"),
            "anything",
            "gw",
            json!({}),
        );
        assert!(!authorize(&suspended, &snap).is_allowed());
    }

    #[test]
    fn scope_filters_principal_and_resource() {
        let (snap, _) = snapshot(&[r#"permit(principal == "alice", action, resource == "gw-a");"#]);
        let alice = Request::new(Principal::new("alice"), "x", "gw-a", json!({}));
        let bob = Request::new(Principal::new("bob"), "x", "gw-a", json!({}));
        let elsewhere = Request::new(Principal::new("alice"), "x", "gw-b", json!({}));
        assert!(authorize(&alice, &snap).is_allowed());
        assert!(!authorize(&bob, &snap).is_allowed());
        assert!(!authorize(&elsewhere, &snap).is_allowed());
    }

    #[test]
    fn nested_and_bracketed_paths() {
        let (snap, _) = snapshot(&[
            r#"permit(*, action, *) when { context.input.customer["account-tier"] in ["gold", "platinum"] };"#,
        ]);
        let request = Request::new(
            Principal::new("u"),
            "x",
            "gw",
            json!({ "customer": { "account-tier": "gold" } }),
        );
        assert!(authorize(&request, &snap).is_allowed());
    }
}
