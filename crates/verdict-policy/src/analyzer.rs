// analyzer.rs — Compare a candidate policy against an existing policy set.
//
// Three relations are computed per existing policy:
//
//   overlap        the scopes intersect and both conditions can hold at once
//   contradiction  the effects differ and the forbid covers the permit, so
//                  the permit can never determine a decision
//   redundant      the effects agree and the existing policy covers the
//                  candidate, so adding it changes no decision
//
// "Covers" means: the outer scope contains the inner scope and the inner
// condition implies the outer condition. A principal tag constraint is
// treated as a condition on `principal.tags.<key>` so the solver can
// reason about it together with the `when` / `unless` clauses.
//
// Results are advisory; they never influence evaluation.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ast::{
    ActionConstraint, Attribute, CmpOp, Effect, Expr, Literal, PolicyStatement,
    PrincipalConstraint, ResourceConstraint,
};
use crate::schema::Schema;
use crate::snapshot::SnapshotPolicy;
use crate::solver::Satisfiability;
use crate::validator::{Finding, FindingKind, Validator};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisResult {
    pub overlaps: Vec<Uuid>,
    pub contradictions: Vec<Uuid>,
    pub redundant_with: Vec<Uuid>,
}

impl AnalysisResult {
    /// Contradictions and redundancies as findings. Overlaps are normal
    /// (a forbid carving an exception out of a permit overlaps it) and are
    /// not reported.
    pub fn findings(&self, existing: &[SnapshotPolicy]) -> Vec<Finding> {
        let name_of = |id: &Uuid| {
            existing
                .iter()
                .find(|p| p.id == *id)
                .map(|p| p.name.clone())
                .unwrap_or_else(|| id.to_string())
        };
        let mut findings = Vec::new();
        for id in &self.contradictions {
            findings.push(
                Finding::new(
                    FindingKind::Contradiction,
                    format!("contradicts policy '{}': the permit can never take effect", name_of(id)),
                )
                .related_to(*id),
            );
        }
        for id in &self.redundant_with {
            findings.push(
                Finding::new(
                    FindingKind::Redundant,
                    format!("already covered by policy '{}'", name_of(id)),
                )
                .related_to(*id),
            );
        }
        findings
    }

    pub fn is_clean(&self) -> bool {
        self.contradictions.is_empty() && self.redundant_with.is_empty()
    }
}

/// Analyze with the default clause cap.
pub fn analyze(candidate: &PolicyStatement, existing: &[SnapshotPolicy], schema: &Schema) -> AnalysisResult {
    Analyzer::default().analyze(candidate, existing, schema)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Analyzer {
    validator: Validator,
}

impl Analyzer {
    pub fn new(max_clauses: usize) -> Self {
        Self {
            validator: Validator::new(max_clauses),
        }
    }

    pub fn analyze(
        &self,
        candidate: &PolicyStatement,
        existing: &[SnapshotPolicy],
        schema: &Schema,
    ) -> AnalysisResult {
        let mut result = AnalysisResult::default();
        let candidate_condition = folded_condition(candidate);

        for other in existing {
            let statement = &other.statement;
            if !scopes_intersect(candidate, statement) {
                continue;
            }
            let other_condition = folded_condition(statement);
            let mut attributes = Vec::new();
            candidate_condition.attributes(&mut attributes);
            other_condition.attributes(&mut attributes);
            let solver = self
                .validator
                .solver_for(schema, &candidate.action, attributes);

            if solver.jointly_satisfiable(&candidate_condition, &other_condition)
                == Satisfiability::Unsatisfiable
            {
                continue;
            }
            result.overlaps.push(other.id);

            let candidate_covers_other = scope_covers(candidate, statement)
                && solver.implies(&other_condition, &candidate_condition);
            let other_covers_candidate = scope_covers(statement, candidate)
                && solver.implies(&candidate_condition, &other_condition);

            match (candidate.effect, statement.effect) {
                (Effect::Forbid, Effect::Permit) if candidate_covers_other => {
                    result.contradictions.push(other.id);
                }
                (Effect::Permit, Effect::Forbid) if other_covers_candidate => {
                    result.contradictions.push(other.id);
                }
                (a, b) if a == b && other_covers_candidate => {
                    result.redundant_with.push(other.id);
                }
                _ => {}
            }
        }

        tracing::debug!(
            overlaps = result.overlaps.len(),
            contradictions = result.contradictions.len(),
            redundant = result.redundant_with.len(),
            "analyzed candidate policy"
        );
        result
    }
}

/// The effective condition with a tag-scoped principal folded in.
fn folded_condition(statement: &PolicyStatement) -> Expr {
    let condition = statement.effective_condition();
    match &statement.principal {
        PrincipalConstraint::Tagged { key, value } => Expr::and(
            Expr::Compare {
                attr: Attribute::PrincipalTag(key.clone()),
                op: CmpOp::Eq,
                value: Literal::String(value.clone()),
            },
            condition,
        ),
        _ => condition,
    }
}

fn scopes_intersect(a: &PolicyStatement, b: &PolicyStatement) -> bool {
    let principals = match (&a.principal, &b.principal) {
        (PrincipalConstraint::Exact { id: x }, PrincipalConstraint::Exact { id: y }) => x == y,
        // Tag constraints are part of the folded condition.
        _ => true,
    };
    let actions = match (&a.action, &b.action) {
        (ActionConstraint::Any, _) | (_, ActionConstraint::Any) => true,
        (x, y) => x.named().iter().any(|name| y.contains(name)),
    };
    let resources = match (&a.resource, &b.resource) {
        (ResourceConstraint::Exact { id: x }, ResourceConstraint::Exact { id: y }) => x == y,
        _ => true,
    };
    principals && actions && resources
}

/// Whether `outer`'s scope contains `inner`'s scope (conditions aside).
fn scope_covers(outer: &PolicyStatement, inner: &PolicyStatement) -> bool {
    let principals = match (&outer.principal, &inner.principal) {
        (PrincipalConstraint::Exact { id: x }, PrincipalConstraint::Exact { id: y }) => x == y,
        (PrincipalConstraint::Exact { .. }, _) => false,
        _ => true,
    };
    let actions = match (&outer.action, &inner.action) {
        (ActionConstraint::Any, _) => true,
        (_, ActionConstraint::Any) => false,
        (x, y) => y.named().iter().all(|name| x.contains(name)),
    };
    let resources = match (&outer.resource, &inner.resource) {
        (ResourceConstraint::Any, _) => true,
        (ResourceConstraint::Exact { id: x }, ResourceConstraint::Exact { id: y }) => x == y,
        (ResourceConstraint::Exact { .. }, ResourceConstraint::Any) => false,
    };
    principals && actions && resources
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_policy;

    fn existing(text: &str) -> SnapshotPolicy {
        SnapshotPolicy::new(Uuid::new_v4(), "existing", parse_policy(text).unwrap())
    }

    fn candidate(text: &str) -> PolicyStatement {
        parse_policy(text).unwrap()
    }

    const SMALL_REFUNDS: &str =
        r#"permit(principal, action == "process_refund", resource) when { context.input.amount < 1000 };"#;

    #[test]
    fn forbid_covering_permit_is_a_contradiction() {
        let permit = existing(SMALL_REFUNDS);
        let forbid = candidate(r#"forbid(principal, action == "process_refund", resource);"#);
        let result = analyze(&forbid, std::slice::from_ref(&permit), &Schema::empty());
        assert_eq!(result.contradictions, vec![permit.id]);
        assert_eq!(result.overlaps, vec![permit.id]);
        let findings = result.findings(std::slice::from_ref(&permit));
        assert_eq!(findings[0].kind, FindingKind::Contradiction);
        assert_eq!(findings[0].related_policy, Some(permit.id));
    }

    #[test]
    fn carve_out_overlaps_without_contradiction() {
        let permit = existing(
            r#"permit(principal, action == "process_refund", resource) when { context.input.amount < 20000 };"#,
        );
        let forbid = candidate(
            r#"forbid(principal, action == "process_refund", resource) when { context.input.amount >= 10000 };"#,
        );
        let result = analyze(&forbid, &[permit.clone()], &Schema::empty());
        assert_eq!(result.overlaps, vec![permit.id]);
        assert!(result.contradictions.is_empty());
        assert!(result.is_clean());
    }

    #[test]
    fn disjoint_conditions_do_not_overlap() {
        let permit = existing(SMALL_REFUNDS);
        let forbid = candidate(
            r#"forbid(principal, action == "process_refund", resource) when { context.input.amount >= 10000 };"#,
        );
        let result = analyze(&forbid, &[permit], &Schema::empty());
        assert!(result.overlaps.is_empty());
    }

    #[test]
    fn permit_under_existing_forbid_is_a_contradiction() {
        let forbid = existing(r#"forbid(principal, action, resource) when { context.input.amount > 100 };"#);
        let permit = candidate(
            r#"permit(principal, action == "process_refund", resource) when { context.input.amount > 500 };"#,
        );
        let result = analyze(&permit, &[forbid.clone()], &Schema::empty());
        assert_eq!(result.contradictions, vec![forbid.id]);
    }

    #[test]
    fn narrower_duplicate_is_redundant() {
        let wide = existing(SMALL_REFUNDS);
        let narrow = candidate(
            r#"permit(principal.tags.role == "agent", action == "process_refund", resource == "gw-a")
               when { context.input.amount < 500 };"#,
        );
        let result = analyze(&narrow, &[wide.clone()], &Schema::empty());
        assert_eq!(result.redundant_with, vec![wide.id]);

        // The wider candidate is not covered by the narrower one.
        let narrow_existing = SnapshotPolicy::new(Uuid::new_v4(), "narrow", narrow);
        let result = analyze(&candidate(SMALL_REFUNDS), &[narrow_existing], &Schema::empty());
        assert!(result.redundant_with.is_empty());
    }

    #[test]
    fn tag_scopes_are_reasoned_about_as_conditions() {
        let interns = existing(r#"permit(principal.tags.role == "intern", action, resource);"#);
        let managers = candidate(r#"forbid(principal.tags.role == "manager", action, resource);"#);
        let result = analyze(&managers, &[interns], &Schema::empty());
        assert!(result.overlaps.is_empty());
    }

    #[test]
    fn different_actions_are_ignored() {
        let permit = existing(SMALL_REFUNDS);
        let forbid = candidate(r#"forbid(principal, action == "lookup_order", resource);"#);
        let result = analyze(&forbid, &[permit], &Schema::empty());
        assert_eq!(result, AnalysisResult::default());
    }
}
