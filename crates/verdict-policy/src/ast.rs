// ast.rs — Policy statement syntax tree.
//
// A statement is a head (effect + three scope constraints) followed by an
// ordered list of `when` / `unless` clauses:
//
//   permit(principal, action == "process_refund", resource)
//   when { context.input.amount < 1000 };
//
// Every kind is a closed enum so the evaluator and the analyzer can match
// exhaustively. Comparisons always relate one attribute to one literal;
// the parser flips `literal op attribute` into that shape.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Whether a policy grants or blocks access.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Permit,
    Forbid,
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Permit => write!(f, "permit"),
            Effect::Forbid => write!(f, "forbid"),
        }
    }
}

/// Which principals a policy applies to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PrincipalConstraint {
    Any,
    /// A single principal identity.
    Exact { id: String },
    /// Any principal carrying the tag `key` with exactly `value`.
    Tagged { key: String, value: String },
}

/// Which actions (tool names) a policy applies to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionConstraint {
    Any,
    Exact { name: String },
    In { names: BTreeSet<String> },
}

impl ActionConstraint {
    /// Whether the named action falls inside this constraint.
    pub fn contains(&self, action: &str) -> bool {
        match self {
            ActionConstraint::Any => true,
            ActionConstraint::Exact { name } => name == action,
            ActionConstraint::In { names } => names.contains(action),
        }
    }

    /// The explicitly named actions, empty for `Any`.
    pub fn named(&self) -> Vec<&str> {
        match self {
            ActionConstraint::Any => Vec::new(),
            ActionConstraint::Exact { name } => vec![name.as_str()],
            ActionConstraint::In { names } => names.iter().map(String::as_str).collect(),
        }
    }
}

/// Which resources (enforcement points) a policy applies to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceConstraint {
    Any,
    Exact { id: String },
}

/// A request attribute a condition can read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum Attribute {
    /// `context.input.a.b`: a field inside the tool call's input document.
    Input(Vec<String>),
    /// `principal.tags.key`: a tag on the calling principal.
    PrincipalTag(String),
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribute::Input(path) => {
                write!(f, "context.input")?;
                for segment in path {
                    write_segment(f, segment)?;
                }
                Ok(())
            }
            Attribute::PrincipalTag(key) => {
                write!(f, "principal.tags")?;
                write_segment(f, key)
            }
        }
    }
}

/// A literal value on the right-hand side of a comparison.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Number(f64),
    String(String),
}

impl Literal {
    /// Short type name used in findings and diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Literal::Bool(_) => "boolean",
            Literal::Number(_) => "number",
            Literal::String(_) => "string",
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Bool(b) => write!(f, "{}", b),
            Literal::Number(n) => write_number(f, *n),
            Literal::String(s) => write_quoted(f, s),
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// The operator that yields the same truth value with operands swapped.
    pub fn flipped(self) -> Self {
        match self {
            CmpOp::Eq => CmpOp::Eq,
            CmpOp::Ne => CmpOp::Ne,
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
        }
    }

    /// The logical complement (`!(a < b)` is `a >= b`).
    pub fn negated(self) -> Self {
        match self {
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Le => CmpOp::Gt,
            CmpOp::Gt => CmpOp::Le,
            CmpOp::Ge => CmpOp::Lt,
        }
    }

    pub fn is_ordering(self) -> bool {
        !matches!(self, CmpOp::Eq | CmpOp::Ne)
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        write!(f, "{}", s)
    }
}

/// A boolean condition over request attributes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "expr", rename_all = "snake_case")]
pub enum Expr {
    Bool {
        value: bool,
    },
    Compare {
        attr: Attribute,
        op: CmpOp,
        value: Literal,
    },
    In {
        attr: Attribute,
        values: Vec<Literal>,
    },
    /// Glob match over a string attribute (`*`, `?`, `[...]`).
    Like {
        attr: Attribute,
        pattern: String,
    },
    /// Presence check; never fails on a missing attribute.
    Has {
        attr: Attribute,
    },
    Not {
        inner: Box<Expr>,
    },
    And {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Or {
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    pub fn not(inner: Expr) -> Self {
        Expr::Not {
            inner: Box::new(inner),
        }
    }

    pub fn and(left: Expr, right: Expr) -> Self {
        Expr::And {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn or(left: Expr, right: Expr) -> Self {
        Expr::Or {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Collect every attribute this expression reads, in source order.
    pub fn attributes<'a>(&'a self, out: &mut Vec<&'a Attribute>) {
        match self {
            Expr::Bool { .. } => {}
            Expr::Compare { attr, .. }
            | Expr::In { attr, .. }
            | Expr::Like { attr, .. }
            | Expr::Has { attr } => out.push(attr),
            Expr::Not { inner } => inner.attributes(out),
            Expr::And { left, right } | Expr::Or { left, right } => {
                left.attributes(out);
                right.attributes(out);
            }
        }
    }

    /// Binding strength used when printing; higher binds tighter.
    fn precedence(&self) -> u8 {
        match self {
            Expr::Or { .. } => 1,
            Expr::And { .. } => 2,
            Expr::Not { .. } => 3,
            _ => 4,
        }
    }

    fn write_child(&self, f: &mut fmt::Formatter<'_>, parens: bool) -> fmt::Result {
        if parens {
            write!(f, "({})", self)
        } else {
            write!(f, "{}", self)
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Bool { value } => write!(f, "{}", value),
            Expr::Compare { attr, op, value } => write!(f, "{} {} {}", attr, op, value),
            Expr::In { attr, values } => {
                write!(f, "{} in [", attr)?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Expr::Like { attr, pattern } => {
                write!(f, "{} like ", attr)?;
                write_quoted(f, pattern)
            }
            Expr::Has { attr } => write_has(f, attr),
            Expr::Not { inner } => {
                write!(f, "!")?;
                inner.write_child(f, inner.precedence() < 3)
            }
            // Both operators parse left-associatively, so a right child of
            // equal precedence must keep its parentheses.
            Expr::And { left, right } => {
                left.write_child(f, left.precedence() < 2)?;
                write!(f, " && ")?;
                right.write_child(f, right.precedence() <= 2)
            }
            Expr::Or { left, right } => {
                left.write_child(f, left.precedence() < 1)?;
                write!(f, " || ")?;
                right.write_child(f, right.precedence() <= 1)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    When,
    Unless,
}

/// One `when { ... }` or `unless { ... }` clause.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    pub kind: ConditionKind,
    pub body: Expr,
}

/// A complete policy statement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyStatement {
    /// `@key("value")` annotations preceding the statement.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    pub effect: Effect,
    pub principal: PrincipalConstraint,
    pub action: ActionConstraint,
    pub resource: ResourceConstraint,
    /// Clauses in source order. All `when` bodies must hold and no
    /// `unless` body may hold for the policy to be satisfied.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl PolicyStatement {
    /// A statement with the given scope and no conditions.
    pub fn new(
        effect: Effect,
        principal: PrincipalConstraint,
        action: ActionConstraint,
        resource: ResourceConstraint,
    ) -> Self {
        Self {
            annotations: BTreeMap::new(),
            effect,
            principal,
            action,
            resource,
            conditions: Vec::new(),
        }
    }

    /// Append a `when` clause (builder style).
    pub fn when(mut self, body: Expr) -> Self {
        self.conditions.push(Condition {
            kind: ConditionKind::When,
            body,
        });
        self
    }

    /// Append an `unless` clause (builder style).
    pub fn unless(mut self, body: Expr) -> Self {
        self.conditions.push(Condition {
            kind: ConditionKind::Unless,
            body,
        });
        self
    }

    /// Fold all clauses into a single expression.
    pub fn effective_condition(&self) -> Expr {
        let mut folded: Option<Expr> = None;
        for condition in &self.conditions {
            let term = match condition.kind {
                ConditionKind::When => condition.body.clone(),
                ConditionKind::Unless => Expr::not(condition.body.clone()),
            };
            folded = Some(match folded {
                None => term,
                Some(acc) => Expr::and(acc, term),
            });
        }
        folded.unwrap_or(Expr::Bool { value: true })
    }

    /// Every attribute read by any clause.
    pub fn attributes(&self) -> Vec<&Attribute> {
        let mut out = Vec::new();
        for condition in &self.conditions {
            condition.body.attributes(&mut out);
        }
        out
    }

    /// The `@id` annotation, if present.
    pub fn id_annotation(&self) -> Option<&str> {
        self.annotations.get("id").map(String::as_str)
    }
}

impl fmt::Display for PolicyStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.annotations {
            write!(f, "@{}(", key)?;
            write_quoted(f, value)?;
            writeln!(f, ")")?;
        }
        write!(f, "{}(", self.effect)?;
        match &self.principal {
            PrincipalConstraint::Any => write!(f, "principal")?,
            PrincipalConstraint::Exact { id } => {
                write!(f, "principal == ")?;
                write_quoted(f, id)?;
            }
            PrincipalConstraint::Tagged { key, value } => {
                write!(f, "principal.tags")?;
                write_segment(f, key)?;
                write!(f, " == ")?;
                write_quoted(f, value)?;
            }
        }
        write!(f, ", ")?;
        match &self.action {
            ActionConstraint::Any => write!(f, "action")?,
            ActionConstraint::Exact { name } => {
                write!(f, "action == ")?;
                write_quoted(f, name)?;
            }
            ActionConstraint::In { names } => {
                write!(f, "action in [")?;
                for (i, name) in names.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write_quoted(f, name)?;
                }
                write!(f, "]")?;
            }
        }
        write!(f, ", ")?;
        match &self.resource {
            ResourceConstraint::Any => write!(f, "resource")?,
            ResourceConstraint::Exact { id } => {
                write!(f, "resource == ")?;
                write_quoted(f, id)?;
            }
        }
        write!(f, ")")?;
        for condition in &self.conditions {
            let keyword = match condition.kind {
                ConditionKind::When => "when",
                ConditionKind::Unless => "unless",
            };
            write!(f, "\n{} {{ {} }}", keyword, condition.body)?;
        }
        write!(f, ";")
    }
}

/// Whether a path segment can be printed with dot syntax.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && !is_reserved(s)
}

/// Words the parser treats specially after an attribute.
fn is_reserved(s: &str) -> bool {
    matches!(s, "has" | "like" | "in" | "true" | "false")
}

fn write_segment(f: &mut fmt::Formatter<'_>, segment: &str) -> fmt::Result {
    if is_identifier(segment) {
        write!(f, ".{}", segment)
    } else {
        write!(f, "[")?;
        write_quoted(f, segment)?;
        write!(f, "]")
    }
}

fn write_has(f: &mut fmt::Formatter<'_>, attr: &Attribute) -> fmt::Result {
    let (base, key) = match attr {
        Attribute::Input(path) => match path.split_last() {
            Some((last, rest)) => (Attribute::Input(rest.to_vec()), last.as_str()),
            None => return write!(f, "context has input"),
        },
        Attribute::PrincipalTag(key) => {
            write!(f, "principal.tags has ")?;
            return write_has_key(f, key);
        }
    };
    write!(f, "{} has ", base)?;
    write_has_key(f, key)
}

fn write_has_key(f: &mut fmt::Formatter<'_>, key: &str) -> fmt::Result {
    if is_identifier(key) {
        write!(f, "{}", key)
    } else {
        write_quoted(f, key)
    }
}

fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    write!(f, "\"")?;
    for c in s.chars() {
        match c {
            '"' => write!(f, "\\\"")?,
            '\\' => write!(f, "\\\\")?,
            '\n' => write!(f, "\\n")?,
            '\t' => write!(f, "\\t")?,
            '\r' => write!(f, "\\r")?,
            other => write!(f, "{}", other)?,
        }
    }
    write!(f, "\"")
}

fn write_number(f: &mut fmt::Formatter<'_>, n: f64) -> fmt::Result {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        write!(f, "{}", n as i64)
    } else {
        write!(f, "{}", n)
    }
}
