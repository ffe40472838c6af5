// validator.rs — Schema-aware checks on a single policy statement.
//
// A statement that parses can still be wrong for the enforcement point it
// is meant for: it may name actions the gateway does not expose, read
// parameters the tools never send, compare a number with a string, or
// carry a condition that can never (or always) hold. The validator reports
// each of these as a `Finding`; the caller's `ValidationMode` decides
// whether findings block creation.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ast::{
    ActionConstraint, Attribute, CmpOp, ConditionKind, Expr, Literal, PolicyStatement,
    ResourceConstraint,
};
use crate::error::PolicyError;
use crate::parser::parse_policy;
use crate::schema::{ParameterType, Schema};
use crate::solver::{Solver, DEFAULT_MAX_CLAUSES};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FindingKind {
    UnknownAction,
    UnknownResource,
    UnknownAttribute,
    TypeMismatch,
    InvalidPattern,
    AlwaysTrue,
    AlwaysFalse,
    /// Produced by the analyzer: the candidate makes an opposite-effect policy dead.
    Contradiction,
    /// Produced by the analyzer: an existing policy already covers the candidate.
    Redundant,
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FindingKind::UnknownAction => "unknown_action",
            FindingKind::UnknownResource => "unknown_resource",
            FindingKind::UnknownAttribute => "unknown_attribute",
            FindingKind::TypeMismatch => "type_mismatch",
            FindingKind::InvalidPattern => "invalid_pattern",
            FindingKind::AlwaysTrue => "always_true",
            FindingKind::AlwaysFalse => "always_false",
            FindingKind::Contradiction => "contradiction",
            FindingKind::Redundant => "redundant",
        };
        write!(f, "{}", s)
    }
}

/// One problem found in a statement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Finding {
    pub kind: FindingKind,
    pub message: String,
    /// The existing policy involved, for analyzer findings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_policy: Option<Uuid>,
}

impl Finding {
    pub fn new(kind: FindingKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            related_policy: None,
        }
    }

    pub fn related_to(mut self, policy: Uuid) -> Self {
        self.related_policy = Some(policy);
        self
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// How findings affect policy creation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationMode {
    /// Any finding rejects the statement.
    #[default]
    FailOnAnyFindings,
    /// Findings are kept as warnings. Intended for controlled testing.
    IgnoreAllFindings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationResult {
    pub ok: bool,
    pub findings: Vec<Finding>,
}

impl ValidationResult {
    pub fn from_findings(findings: Vec<Finding>, mode: ValidationMode) -> Self {
        let ok = findings.is_empty() || mode == ValidationMode::IgnoreAllFindings;
        Self { ok, findings }
    }

    pub fn has(&self, kind: FindingKind) -> bool {
        self.findings.iter().any(|f| f.kind == kind)
    }
}

/// Validate with the default clause cap.
pub fn validate(statement: &PolicyStatement, schema: &Schema, mode: ValidationMode) -> ValidationResult {
    Validator::default().validate(statement, schema, mode)
}

#[derive(Debug, Clone, Copy)]
pub struct Validator {
    max_clauses: usize,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CLAUSES)
    }
}

impl Validator {
    pub fn new(max_clauses: usize) -> Self {
        Self { max_clauses }
    }

    /// Parse then validate. Syntax errors are returned as `Err`, never as findings.
    pub fn validate_text(
        &self,
        text: &str,
        schema: &Schema,
        mode: ValidationMode,
    ) -> Result<(PolicyStatement, ValidationResult), PolicyError> {
        let statement = parse_policy(text)?;
        let result = self.validate(&statement, schema, mode);
        Ok((statement, result))
    }

    pub fn validate(
        &self,
        statement: &PolicyStatement,
        schema: &Schema,
        mode: ValidationMode,
    ) -> ValidationResult {
        let mut findings = Vec::new();
        check_scope(statement, schema, &mut findings);
        check_attributes(statement, schema, &mut findings);
        for condition in &statement.conditions {
            check_types(&condition.body, statement, schema, &mut findings);
        }
        self.check_satisfiability(statement, schema, &mut findings);
        dedup(&mut findings);

        let result = ValidationResult::from_findings(findings, mode);
        tracing::debug!(
            ok = result.ok,
            findings = result.findings.len(),
            "validated policy statement"
        );
        result
    }

    /// A solver primed with the closed enums every relevant action declares
    /// for the given attributes.
    pub fn solver_for<'a>(
        &self,
        schema: &Schema,
        action: &ActionConstraint,
        attributes: impl IntoIterator<Item = &'a Attribute>,
    ) -> Solver {
        let mut solver = Solver::new(self.max_clauses);
        let actions = relevant_actions(schema, action);
        if actions.is_empty() {
            return solver;
        }
        let attributes: BTreeSet<&Attribute> = attributes.into_iter().collect();
        for attr in attributes {
            let path = match attr {
                Attribute::Input(path) => path,
                Attribute::PrincipalTag(_) => continue,
            };
            let mut universe: Option<BTreeSet<String>> = Some(BTreeSet::new());
            for name in &actions {
                match schema.lookup(name, path).and_then(ParameterType::enum_values) {
                    Some(values) => {
                        if let Some(u) = universe.as_mut() {
                            u.extend(values.iter().cloned());
                        }
                    }
                    None => universe = None,
                }
            }
            if let Some(values) = universe {
                solver = solver.with_enum(attr.clone(), values);
            }
        }
        solver
    }

    fn check_satisfiability(
        &self,
        statement: &PolicyStatement,
        schema: &Schema,
        findings: &mut Vec<Finding>,
    ) {
        if statement.conditions.is_empty() {
            return;
        }
        let solver = self.solver_for(schema, &statement.action, statement.attributes());
        if solver.always_false(&statement.effective_condition()) {
            findings.push(Finding::new(
                FindingKind::AlwaysFalse,
                "the policy's conditions can never be satisfied; it will never apply",
            ));
            return;
        }
        for condition in &statement.conditions {
            if matches!(condition.body, Expr::Bool { .. }) {
                continue;
            }
            match condition.kind {
                ConditionKind::When if solver.always_true(&condition.body) => {
                    findings.push(Finding::new(
                        FindingKind::AlwaysTrue,
                        format!("when clause `{}` is always true", condition.body),
                    ));
                }
                ConditionKind::Unless if solver.always_false(&condition.body) => {
                    findings.push(Finding::new(
                        FindingKind::AlwaysFalse,
                        format!("unless clause `{}` can never hold", condition.body),
                    ));
                }
                _ => {}
            }
        }
    }
}

/// Schema actions a statement can apply to.
pub(crate) fn relevant_actions<'s>(schema: &'s Schema, action: &ActionConstraint) -> Vec<&'s str> {
    match action {
        ActionConstraint::Any => schema.actions.keys().map(String::as_str).collect(),
        named => schema
            .actions
            .keys()
            .filter(|name| named.contains(name))
            .map(String::as_str)
            .collect(),
    }
}

fn check_scope(statement: &PolicyStatement, schema: &Schema, findings: &mut Vec<Finding>) {
    if let ActionConstraint::In { names } = &statement.action {
        if names.is_empty() {
            findings.push(Finding::new(
                FindingKind::AlwaysFalse,
                "the action set is empty; the policy can never apply",
            ));
        }
    }
    if !schema.is_empty() {
        for name in statement.action.named() {
            if !schema.has_action(name) {
                findings.push(Finding::new(
                    FindingKind::UnknownAction,
                    format!("action '{}' is not declared by any tool", name),
                ));
            }
        }
    }
    if let ResourceConstraint::Exact { id } = &statement.resource {
        if !schema.resources.is_empty() && !schema.resources.contains(id) {
            findings.push(Finding::new(
                FindingKind::UnknownResource,
                format!("resource '{}' is not a known target", id),
            ));
        }
    }
}

fn check_attributes(statement: &PolicyStatement, schema: &Schema, findings: &mut Vec<Finding>) {
    let actions = relevant_actions(schema, &statement.action);
    if actions.is_empty() {
        return;
    }
    let attributes: BTreeSet<&Attribute> = statement.attributes().into_iter().collect();
    for attr in attributes {
        let Attribute::Input(path) = attr else { continue };
        if path.is_empty() {
            continue;
        }
        if !actions.iter().any(|a| schema.lookup(a, path).is_some()) {
            findings.push(Finding::new(
                FindingKind::UnknownAttribute,
                format!(
                    "{} is not a parameter of {}",
                    attr,
                    actions.join(", ")
                ),
            ));
        }
    }
}

static TAG_TYPE: ParameterType = ParameterType::String;

/// Declared types of an attribute across the statement's actions.
fn declared_types<'s>(
    attr: &Attribute,
    statement: &PolicyStatement,
    schema: &'s Schema,
) -> Vec<&'s ParameterType> {
    match attr {
        Attribute::Input(path) => relevant_actions(schema, &statement.action)
            .into_iter()
            .filter_map(|a| schema.lookup(a, path))
            .filter(|ty| **ty != ParameterType::Any)
            .collect(),
        // Principal tags are always strings.
        Attribute::PrincipalTag(_) => vec![&TAG_TYPE],
    }
}

fn literal_fits(ty: &ParameterType, literal: &Literal) -> bool {
    matches!(
        (ty, literal),
        (ParameterType::Number, Literal::Number(_))
            | (ParameterType::String, Literal::String(_))
            | (ParameterType::Enum { .. }, Literal::String(_))
            | (ParameterType::Boolean, Literal::Bool(_))
    )
}

fn check_types(expr: &Expr, statement: &PolicyStatement, schema: &Schema, findings: &mut Vec<Finding>) {
    match expr {
        Expr::Bool { .. } | Expr::Has { .. } => {}
        Expr::Not { inner } => check_types(inner, statement, schema, findings),
        Expr::And { left, right } | Expr::Or { left, right } => {
            check_types(left, statement, schema, findings);
            check_types(right, statement, schema, findings);
        }
        Expr::Compare { attr, op, value } => {
            if is_ordering_on_non_number(*op, value) {
                findings.push(Finding::new(
                    FindingKind::TypeMismatch,
                    format!("`{}` orders a {}; only numbers can be ordered", expr, value.type_name()),
                ));
                return;
            }
            for ty in declared_types(attr, statement, schema) {
                if !literal_fits(ty, value) {
                    findings.push(Finding::new(
                        FindingKind::TypeMismatch,
                        format!(
                            "{} is declared as {} but compared with a {}",
                            attr,
                            ty.type_name(),
                            value.type_name()
                        ),
                    ));
                }
            }
        }
        Expr::In { attr, values } => {
            for ty in declared_types(attr, statement, schema) {
                if let Some(bad) = values.iter().find(|v| !literal_fits(ty, v)) {
                    findings.push(Finding::new(
                        FindingKind::TypeMismatch,
                        format!(
                            "{} is declared as {} but the set contains the {} {}",
                            attr,
                            ty.type_name(),
                            bad.type_name(),
                            bad
                        ),
                    ));
                }
            }
        }
        Expr::Like { attr, pattern } => {
            if glob::Pattern::new(pattern).is_err() {
                findings.push(Finding::new(
                    FindingKind::InvalidPattern,
                    format!("\"{}\" is not a valid pattern", pattern),
                ));
            }
            for ty in declared_types(attr, statement, schema) {
                if !matches!(ty, ParameterType::String | ParameterType::Enum { .. }) {
                    findings.push(Finding::new(
                        FindingKind::TypeMismatch,
                        format!("{} is declared as {}; `like` needs a string", attr, ty.type_name()),
                    ));
                }
            }
        }
    }
}

fn is_ordering_on_non_number(op: CmpOp, value: &Literal) -> bool {
    op.is_ordering() && !matches!(value, Literal::Number(_))
}

fn dedup(findings: &mut Vec<Finding>) {
    let mut seen = BTreeSet::new();
    findings.retain(|f| seen.insert((f.kind, f.message.clone())));
}
