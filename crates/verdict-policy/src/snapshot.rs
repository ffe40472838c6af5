// snapshot.rs — Immutable, versioned policy set for one engine.
//
// Policies live in an arena (`Vec`) and are referenced by index. The
// action index maps each explicitly named action to the indices of the
// policies naming it; policies with `action` unconstrained sit in a
// separate wildcard list that every lookup includes. A snapshot is never
// mutated after construction; the store builds a new one per change and
// publishes it atomically.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ast::{ActionConstraint, Expr, PolicyStatement};

/// One policy as the evaluator sees it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotPolicy {
    pub id: Uuid,
    pub name: String,
    pub statement: PolicyStatement,
}

impl SnapshotPolicy {
    pub fn new(id: Uuid, name: impl Into<String>, statement: PolicyStatement) -> Self {
        Self {
            id,
            name: name.into(),
            statement,
        }
    }
}

#[derive(Debug, Default)]
pub struct PolicySnapshot {
    version: u64,
    policies: Vec<SnapshotPolicy>,
    by_action: HashMap<String, Vec<usize>>,
    wildcard: Vec<usize>,
    /// Compiled `like` patterns; `None` for patterns that do not compile.
    patterns: HashMap<String, Option<glob::Pattern>>,
}

impl PolicySnapshot {
    /// Version 0, no policies. Every request against it is denied.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(version: u64, policies: Vec<SnapshotPolicy>) -> Self {
        let mut by_action: HashMap<String, Vec<usize>> = HashMap::new();
        let mut wildcard = Vec::new();
        let mut patterns = HashMap::new();
        for (index, policy) in policies.iter().enumerate() {
            match &policy.statement.action {
                ActionConstraint::Any => wildcard.push(index),
                named => {
                    for name in named.named() {
                        by_action.entry(name.to_string()).or_default().push(index);
                    }
                }
            }
            for condition in &policy.statement.conditions {
                collect_patterns(&condition.body, &mut patterns);
            }
        }
        Self {
            version,
            policies,
            by_action,
            wildcard,
            patterns,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn policies(&self) -> &[SnapshotPolicy] {
        &self.policies
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&SnapshotPolicy> {
        self.policies.iter().find(|p| p.id == id)
    }

    /// Policies whose action constraint can match `action`, in arena order.
    pub fn candidates(&self, action: &str) -> Vec<&SnapshotPolicy> {
        let named: &[usize] = self.by_action.get(action).map(Vec::as_slice).unwrap_or(&[]);
        let mut out = Vec::with_capacity(named.len() + self.wildcard.len());
        let (mut i, mut j) = (0, 0);
        // Both index lists are ascending; merge to keep arena order.
        while i < named.len() || j < self.wildcard.len() {
            let take_named = match (named.get(i), self.wildcard.get(j)) {
                (Some(a), Some(b)) => a < b,
                (Some(_), None) => true,
                _ => false,
            };
            let index = if take_named {
                i += 1;
                named[i - 1]
            } else {
                j += 1;
                self.wildcard[j - 1]
            };
            if let Some(policy) = self.policies.get(index) {
                out.push(policy);
            }
        }
        out
    }

    pub(crate) fn pattern(&self, pattern: &str) -> Option<&glob::Pattern> {
        self.patterns.get(pattern).and_then(Option::as_ref)
    }
}

fn collect_patterns(expr: &Expr, out: &mut HashMap<String, Option<glob::Pattern>>) {
    match expr {
        Expr::Like { pattern, .. } => {
            out.entry(pattern.clone())
                .or_insert_with(|| glob::Pattern::new(pattern).ok());
        }
        Expr::Not { inner } => collect_patterns(inner, out),
        Expr::And { left, right } | Expr::Or { left, right } => {
            collect_patterns(left, out);
            collect_patterns(right, out);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_policy;

    fn policy(text: &str) -> SnapshotPolicy {
        SnapshotPolicy::new(Uuid::new_v4(), "p", parse_policy(text).unwrap())
    }

    #[test]
    fn candidates_merge_named_and_wildcard_in_order() {
        let policies = vec![
            policy(r#"permit(principal, action, resource);"#),
            policy(r#"permit(principal, action == "a", resource);"#),
            policy(r#"forbid(principal, action in ["a", "b"], resource);"#),
            policy(r#"forbid(principal, action == "b", resource);"#),
            policy(r#"forbid(principal, action, resource);"#),
        ];
        let ids: Vec<Uuid> = policies.iter().map(|p| p.id).collect();
        let snapshot = PolicySnapshot::new(3, policies);

        let for_a: Vec<Uuid> = snapshot.candidates("a").iter().map(|p| p.id).collect();
        assert_eq!(for_a, vec![ids[0], ids[1], ids[2], ids[4]]);

        let for_c: Vec<Uuid> = snapshot.candidates("c").iter().map(|p| p.id).collect();
        assert_eq!(for_c, vec![ids[0], ids[4]]);
        assert_eq!(snapshot.version(), 3);
    }

    #[test]
    fn empty_snapshot_has_no_candidates() {
        let snapshot = PolicySnapshot::empty();
        assert!(snapshot.candidates("anything").is_empty());
        assert_eq!(snapshot.version(), 0);
    }

    #[test]
    fn patterns_are_compiled_once() {
        let snapshot = PolicySnapshot::new(
            1,
            vec![policy(
                r#"permit(principal, action, resource) when { context.input.path like "reports/*" };"#,
            )],
        );
        assert!(snapshot.pattern("reports/*").is_some());
        assert!(snapshot.pattern("other").is_none());
    }
}
