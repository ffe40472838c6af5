//! # verdict-policy
//!
//! Policy language and decision core for Verdict.
//!
//! A policy is a `permit` or `forbid` statement scoped to principals,
//! actions (tool names) and resources (enforcement points), optionally
//! narrowed by `when` / `unless` conditions over the tool call's input and
//! the caller's tags:
//!
//! ```text
//! permit(principal, action == "process_refund", resource)
//! when { context.input.amount < 1000 };
//! ```
//!
//! This crate parses and prints statements, compiles tool definitions into
//! a typed [`Schema`], validates statements against it, analyzes candidates
//! against an existing set, and evaluates requests against an immutable
//! [`PolicySnapshot`].
//!
//! ## Key invariants
//!
//! - **Default deny**: no satisfied policy → DENY with nothing determining it.
//! - **Forbid wins**: any satisfied forbid → DENY, whatever permits hold.
//! - **Never throws on requests**: a missing or mistyped attribute makes the
//!   policy that reads it "mismatched" (not satisfied), never an error.
//! - **Pure evaluation**: [`authorize`] depends only on its arguments.

pub mod analyzer;
pub mod ast;
pub mod error;
pub mod evaluator;
pub mod parser;
pub mod schema;
pub mod snapshot;
pub mod solver;
pub mod validator;

pub use analyzer::{analyze, AnalysisResult, Analyzer};
pub use ast::{
    ActionConstraint, Attribute, CmpOp, Condition, ConditionKind, Effect, Expr, Literal,
    PolicyStatement, PrincipalConstraint, ResourceConstraint,
};
pub use error::{PolicyError, SchemaError};
pub use evaluator::{
    authorize, Decision, DecisionEffect, Diagnostic, EnforcementMode, MismatchReason, Principal,
    Request,
};
pub use parser::{parse_policy, parse_policy_set};
pub use schema::{ActionSchema, Parameter, ParameterType, Schema, SchemaCompiler, ToolDefinition};
pub use snapshot::{PolicySnapshot, SnapshotPolicy};
pub use solver::{Satisfiability, Solver, DEFAULT_MAX_CLAUSES};
pub use validator::{validate, Finding, FindingKind, ValidationMode, ValidationResult, Validator};
