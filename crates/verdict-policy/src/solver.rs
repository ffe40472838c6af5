// solver.rs — Lightweight satisfiability over policy conditions.
//
// Conditions are rewritten into disjunctive normal form (negations pushed
// down to the literals) and every clause is checked by intersecting one
// domain per attribute:
//
//   numbers   interval with open/closed bounds, optional point set, excluded points
//   strings   optional allow-set (intersected with the schema enum, if any),
//             deny-set, glob patterns
//   booleans  allowed values
//   presence  required present / required absent
//
// An attribute used in a comparison must be present and of the literal's
// type, mirroring the evaluator: a missing or mistyped attribute never
// satisfies a comparison. Patterns that cannot be decided are treated as
// unconstrained, so `Unsatisfiable` is only reported when it is proven.
// Normal forms larger than the clause cap yield `Unknown`.

use std::collections::{BTreeMap, BTreeSet};

use crate::ast::{Attribute, CmpOp, Expr, Literal};

/// Default cap on the number of clauses in a normal form.
pub const DEFAULT_MAX_CLAUSES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Satisfiability {
    Satisfiable,
    Unsatisfiable,
    /// The normal form exceeded the clause cap.
    Unknown,
}

/// Checks conditions for satisfiability, validity and implication.
#[derive(Debug, Clone)]
pub struct Solver {
    max_clauses: usize,
    enums: BTreeMap<Attribute, BTreeSet<String>>,
}

impl Default for Solver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CLAUSES)
    }
}

impl Solver {
    pub fn new(max_clauses: usize) -> Self {
        Self {
            max_clauses: max_clauses.max(1),
            enums: BTreeMap::new(),
        }
    }

    /// Restrict a string attribute to a closed value set.
    pub fn with_enum(mut self, attr: Attribute, values: BTreeSet<String>) -> Self {
        self.enums.insert(attr, values);
        self
    }

    pub fn satisfiability(&self, expr: &Expr) -> Satisfiability {
        self.verdict(self.normal_form(expr, false))
    }

    /// Whether `left && right` can hold at once.
    pub fn jointly_satisfiable(&self, left: &Expr, right: &Expr) -> Satisfiability {
        let dnf = self.normal_form(left, false).and_then(|l| {
            let r = self.normal_form(right, false)?;
            self.product(l, r)
        });
        self.verdict(dnf)
    }

    /// Proven to hold for every well-typed input.
    pub fn always_true(&self, expr: &Expr) -> bool {
        self.verdict(self.normal_form(expr, true)) == Satisfiability::Unsatisfiable
    }

    /// Proven to hold for no input.
    pub fn always_false(&self, expr: &Expr) -> bool {
        self.satisfiability(expr) == Satisfiability::Unsatisfiable
    }

    /// Proven: every input satisfying `premise` also satisfies `conclusion`.
    pub fn implies(&self, premise: &Expr, conclusion: &Expr) -> bool {
        let dnf = self.normal_form(premise, false).and_then(|p| {
            let c = self.normal_form(conclusion, true)?;
            self.product(p, c)
        });
        self.verdict(dnf) == Satisfiability::Unsatisfiable
    }

    fn verdict(&self, dnf: Option<Dnf>) -> Satisfiability {
        match dnf {
            None => Satisfiability::Unknown,
            // Unsatisfiable clauses are pruned while the form is built.
            Some(clauses) if clauses.is_empty() => Satisfiability::Unsatisfiable,
            Some(_) => Satisfiability::Satisfiable,
        }
    }

    /// Normal form of `expr` (or of its negation), unsatisfiable clauses removed.
    fn normal_form(&self, expr: &Expr, negated: bool) -> Option<Dnf> {
        let dnf = match expr {
            Expr::Bool { value } => {
                if *value != negated {
                    vec![Vec::new()]
                } else {
                    Vec::new()
                }
            }
            Expr::Compare { attr, op, value } => {
                let op = if negated { op.negated() } else { *op };
                self.unit(Lit::Cmp {
                    attr: attr.clone(),
                    op,
                    value: value.clone(),
                })
            }
            Expr::In { attr, values } => self.unit(Lit::In {
                attr: attr.clone(),
                values: values.clone(),
                negated,
            }),
            Expr::Like { attr, pattern } => self.unit(Lit::Like {
                attr: attr.clone(),
                pattern: pattern.clone(),
                negated,
            }),
            Expr::Has { attr } => self.unit(Lit::Has {
                attr: attr.clone(),
                negated,
            }),
            Expr::Not { inner } => self.normal_form(inner, !negated)?,
            Expr::And { left, right } | Expr::Or { left, right } => {
                let conjunction = matches!(expr, Expr::And { .. }) != negated;
                let l = self.normal_form(left, negated)?;
                let r = self.normal_form(right, negated)?;
                if conjunction {
                    self.product(l, r)?
                } else {
                    let mut both = l;
                    both.extend(r);
                    if both.len() > self.max_clauses {
                        return None;
                    }
                    both
                }
            }
        };
        Some(dnf)
    }

    fn unit(&self, lit: Lit) -> Dnf {
        let clause = vec![lit];
        if self.clause_satisfiable(&clause) {
            vec![clause]
        } else {
            Vec::new()
        }
    }

    fn product(&self, left: Dnf, right: Dnf) -> Option<Dnf> {
        let mut out = Vec::new();
        for l in &left {
            for r in &right {
                let mut clause = l.clone();
                clause.extend(r.iter().cloned());
                if self.clause_satisfiable(&clause) {
                    out.push(clause);
                    if out.len() > self.max_clauses {
                        return None;
                    }
                }
            }
        }
        Some(out)
    }

    fn clause_satisfiable(&self, clause: &[Lit]) -> bool {
        let mut domains: BTreeMap<&Attribute, Domain> = BTreeMap::new();
        for lit in clause {
            domains.entry(lit.attr()).or_default().apply(lit);
        }
        domains
            .iter()
            .all(|(attr, domain)| domain.satisfiable(self.enums.get(*attr)))
    }
}

type Dnf = Vec<Vec<Lit>>;

/// A condition leaf with its polarity resolved.
#[derive(Debug, Clone)]
enum Lit {
    Cmp {
        attr: Attribute,
        op: CmpOp,
        value: Literal,
    },
    In {
        attr: Attribute,
        values: Vec<Literal>,
        negated: bool,
    },
    Like {
        attr: Attribute,
        pattern: String,
        negated: bool,
    },
    Has {
        attr: Attribute,
        negated: bool,
    },
}

impl Lit {
    fn attr(&self) -> &Attribute {
        match self {
            Lit::Cmp { attr, .. }
            | Lit::In { attr, .. }
            | Lit::Like { attr, .. }
            | Lit::Has { attr, .. } => attr,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Number,
    String,
    Bool,
}

#[derive(Debug, Clone, Copy)]
struct Bound {
    value: f64,
    inclusive: bool,
}

#[derive(Debug, Default)]
struct Domain {
    contradiction: bool,
    present: Option<bool>,
    kind: Option<Kind>,
    lower: Option<Bound>,
    upper: Option<Bound>,
    points: Option<Vec<f64>>,
    excluded: Vec<f64>,
    only: Option<BTreeSet<String>>,
    except: BTreeSet<String>,
    /// `(pattern, must_match)`
    patterns: Vec<(String, bool)>,
    bool_true: Option<bool>,
    bool_false: Option<bool>,
}

impl Domain {
    fn apply(&mut self, lit: &Lit) {
        match lit {
            Lit::Cmp { op, value, .. } => self.compare(*op, value),
            Lit::In {
                values, negated, ..
            } => {
                if *negated {
                    self.require_present();
                    for value in values {
                        match value {
                            Literal::Number(n) => self.excluded.push(*n),
                            Literal::String(s) => {
                                self.except.insert(s.clone());
                            }
                            Literal::Bool(b) => self.forbid_bool(*b),
                        }
                    }
                } else {
                    self.member_of(values);
                }
            }
            Lit::Like {
                pattern, negated, ..
            } => {
                if has_wildcards(pattern) {
                    self.require_kind(Kind::String);
                    self.patterns.push((pattern.clone(), !negated));
                } else {
                    let op = if *negated { CmpOp::Ne } else { CmpOp::Eq };
                    self.compare(op, &Literal::String(pattern.clone()));
                }
            }
            Lit::Has { negated, .. } => {
                if *negated {
                    self.require_absent();
                } else {
                    self.require_present();
                }
            }
        }
    }

    fn compare(&mut self, op: CmpOp, value: &Literal) {
        match value {
            Literal::Number(n) => {
                self.require_kind(Kind::Number);
                let n = *n;
                match op {
                    CmpOp::Eq => {
                        self.tighten_lower(Bound {
                            value: n,
                            inclusive: true,
                        });
                        self.tighten_upper(Bound {
                            value: n,
                            inclusive: true,
                        });
                    }
                    CmpOp::Ne => self.excluded.push(n),
                    CmpOp::Lt => self.tighten_upper(Bound {
                        value: n,
                        inclusive: false,
                    }),
                    CmpOp::Le => self.tighten_upper(Bound {
                        value: n,
                        inclusive: true,
                    }),
                    CmpOp::Gt => self.tighten_lower(Bound {
                        value: n,
                        inclusive: false,
                    }),
                    CmpOp::Ge => self.tighten_lower(Bound {
                        value: n,
                        inclusive: true,
                    }),
                }
            }
            // Ordering is only defined on numbers.
            Literal::String(_) | Literal::Bool(_) if op.is_ordering() => {
                self.contradiction = true;
            }
            Literal::String(s) => {
                self.require_kind(Kind::String);
                if op == CmpOp::Eq {
                    self.restrict_strings(std::iter::once(s.clone()).collect());
                } else {
                    self.except.insert(s.clone());
                }
            }
            Literal::Bool(b) => {
                self.require_kind(Kind::Bool);
                if op == CmpOp::Eq {
                    self.forbid_bool(!b);
                } else {
                    self.forbid_bool(*b);
                }
            }
        }
    }

    fn member_of(&mut self, values: &[Literal]) {
        if values.is_empty() {
            self.contradiction = true;
            return;
        }
        if values.iter().all(|v| matches!(v, Literal::Number(_))) {
            self.require_kind(Kind::Number);
            let set: Vec<f64> = values
                .iter()
                .filter_map(|v| match v {
                    Literal::Number(n) => Some(*n),
                    _ => None,
                })
                .collect();
            self.points = Some(match self.points.take() {
                Some(existing) => existing.into_iter().filter(|p| set.contains(p)).collect(),
                None => set,
            });
        } else if values.iter().all(|v| matches!(v, Literal::String(_))) {
            self.require_kind(Kind::String);
            let set = values
                .iter()
                .filter_map(|v| match v {
                    Literal::String(s) => Some(s.clone()),
                    _ => None,
                })
                .collect();
            self.restrict_strings(set);
        } else if values.iter().all(|v| matches!(v, Literal::Bool(_))) {
            self.require_kind(Kind::Bool);
            if !values.contains(&Literal::Bool(true)) {
                self.forbid_bool(true);
            }
            if !values.contains(&Literal::Bool(false)) {
                self.forbid_bool(false);
            }
        } else {
            // Mixed literal types: only presence is certain.
            self.require_present();
        }
    }

    fn require_present(&mut self) {
        if self.present == Some(false) {
            self.contradiction = true;
        }
        self.present = Some(true);
    }

    fn require_absent(&mut self) {
        if self.present == Some(true) {
            self.contradiction = true;
        }
        self.present = Some(false);
    }

    fn require_kind(&mut self, kind: Kind) {
        self.require_present();
        match self.kind {
            Some(existing) if existing != kind => self.contradiction = true,
            _ => self.kind = Some(kind),
        }
    }

    fn tighten_lower(&mut self, bound: Bound) {
        let replace = match self.lower {
            None => true,
            Some(current) => {
                bound.value > current.value
                    || (bound.value == current.value && !bound.inclusive)
            }
        };
        if replace {
            self.lower = Some(bound);
        }
    }

    fn tighten_upper(&mut self, bound: Bound) {
        let replace = match self.upper {
            None => true,
            Some(current) => {
                bound.value < current.value
                    || (bound.value == current.value && !bound.inclusive)
            }
        };
        if replace {
            self.upper = Some(bound);
        }
    }

    fn restrict_strings(&mut self, set: BTreeSet<String>) {
        self.only = Some(match self.only.take() {
            Some(existing) => existing.intersection(&set).cloned().collect(),
            None => set,
        });
    }

    fn forbid_bool(&mut self, value: bool) {
        if value {
            self.bool_true = Some(false);
        } else {
            self.bool_false = Some(false);
        }
    }

    fn within_bounds(&self, n: f64) -> bool {
        let above = match self.lower {
            None => true,
            Some(b) if b.inclusive => n >= b.value,
            Some(b) => n > b.value,
        };
        let below = match self.upper {
            None => true,
            Some(b) if b.inclusive => n <= b.value,
            Some(b) => n < b.value,
        };
        above && below
    }

    fn satisfiable(&self, universe: Option<&BTreeSet<String>>) -> bool {
        if self.contradiction {
            return false;
        }
        // With a closed enum the schema fixes the type of a present value.
        let kind = match (self.kind, universe) {
            (Some(kind), _) => Some(kind),
            (None, Some(_)) if self.present == Some(true) => Some(Kind::String),
            _ => None,
        };
        match kind {
            None => true,
            Some(Kind::Number) => self.numbers_satisfiable(),
            Some(Kind::String) => self.strings_satisfiable(universe),
            Some(Kind::Bool) => self.bool_true != Some(false) || self.bool_false != Some(false),
        }
    }

    fn numbers_satisfiable(&self) -> bool {
        if let Some(points) = &self.points {
            return points
                .iter()
                .any(|p| self.within_bounds(*p) && !self.excluded.contains(p));
        }
        match (self.lower, self.upper) {
            (Some(lo), Some(hi)) => {
                if lo.value > hi.value {
                    false
                } else if lo.value == hi.value {
                    lo.inclusive && hi.inclusive && !self.excluded.contains(&lo.value)
                } else {
                    // A non-degenerate real interval survives finitely many exclusions.
                    true
                }
            }
            _ => true,
        }
    }

    fn strings_satisfiable(&self, universe: Option<&BTreeSet<String>>) -> bool {
        let candidates: Option<BTreeSet<&String>> = match (&self.only, universe) {
            (Some(only), Some(universe)) => Some(only.intersection(universe).collect()),
            (Some(only), None) => Some(only.iter().collect()),
            (None, Some(universe)) => Some(universe.iter().collect()),
            (None, None) => None,
        };
        match candidates {
            Some(candidates) => candidates.into_iter().any(|c| {
                !self.except.contains(c)
                    && self
                        .patterns
                        .iter()
                        .all(|(pattern, must_match)| match glob_matches(pattern, c) {
                            Some(matched) => matched == *must_match,
                            None => true,
                        })
            }),
            // Infinitely many strings remain; only a pattern and its own
            // negation can rule them all out.
            None => !self.patterns.iter().any(|(p, must)| {
                *must
                    && self
                        .patterns
                        .iter()
                        .any(|(q, other)| q == p && !*other)
            }),
        }
    }
}

/// Whether a `like` pattern uses any glob metacharacter.
pub fn has_wildcards(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Glob match, `None` when the pattern does not compile.
pub fn glob_matches(pattern: &str, candidate: &str) -> Option<bool> {
    glob::Pattern::new(pattern)
        .ok()
        .map(|compiled| compiled.matches(candidate))
}
