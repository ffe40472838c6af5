// error.rs — Error types for the policy language and schema compiler.

use thiserror::Error;

/// Errors raised while reading policy text.
///
/// Parse errors are returned synchronously to the control-plane caller;
/// they are never swallowed or downgraded to warnings.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    /// The statement text is not valid policy syntax.
    #[error("parse error at {line}:{column}: {message}")]
    Parse {
        line: usize,
        column: usize,
        message: String,
    },

    /// The text contained no policy statements at all.
    #[error("no policy statement found")]
    Empty,

    /// A single statement was expected but the text held several.
    #[error("expected exactly one policy statement, found {count}")]
    MultipleStatements { count: usize },
}

/// Errors raised by the schema compiler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaError {
    /// Two tools declare the same action with incompatible parameter types.
    #[error(
        "schema conflict on action '{action}' parameter '{parameter}': \
         '{existing_tool}' declares {existing}, '{incoming_tool}' declares {incoming}"
    )]
    Conflict {
        action: String,
        parameter: String,
        existing_tool: String,
        existing: String,
        incoming_tool: String,
        incoming: String,
    },

    /// An action name cannot be referenced from policy text.
    #[error("invalid action name '{name}' in tool '{tool}'")]
    InvalidActionName { tool: String, name: String },

    /// A tool's input schema is not a usable JSON Schema object.
    #[error("invalid input schema for tool '{tool}': {reason}")]
    InvalidToolSchema { tool: String, reason: String },

    /// A tool manifest file could not be decoded.
    #[error("failed to read tool manifest: {0}")]
    Manifest(String),

    #[error("invalid name pattern: {0}")]
    Pattern(String),
}
