//! Error types for voltage-formula

use thiserror::Error;

/// Formula engine errors
///
/// Every variant is fatal for the formula it is attached to. Transient
/// conditions (an input momentarily unavailable) are not errors and travel as
/// [`crate::TransientReason`] instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    #[error("Parse error in '{formula}' at {position}: {message}")]
    Parse {
        formula: String,
        position: usize,
        message: String,
    },

    #[error("Invalid call to {function}(): {message}")]
    InvalidReferenceCall { function: String, message: String },

    #[error("Circular dependency between formulas: {}", members.join(" -> "))]
    Cycle { members: Vec<String> },

    #[error("Unresolved name: {0}")]
    UnresolvedName(String),

    #[error("No handler registered for {0}()")]
    UnknownHandler(String),

    #[error("Evaluation of '{formula}' failed: {message}")]
    Execution { formula: String, message: String },

    #[error("Function error: {0}")]
    Function(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid formula group: {0}")]
    InvalidGroup(String),

    #[error("Subject {subject} is {state}")]
    SubjectUnavailable { subject: String, state: String },

    #[error("Not evaluated: group aborted after fatal outcome of {cause}")]
    Aborted { cause: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FormulaError {
    pub fn parse(formula: impl Into<String>, position: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            formula: formula.into(),
            position,
            message: message.into(),
        }
    }

    pub fn invalid_call(function: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidReferenceCall {
            function: function.into(),
            message: message.into(),
        }
    }

    pub fn execution(formula: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            formula: formula.into(),
            message: message.into(),
        }
    }

    pub fn function(msg: impl Into<String>) -> Self {
        Self::Function(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_group(msg: impl Into<String>) -> Self {
        Self::InvalidGroup(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Internal errors indicate a broken engine invariant rather than bad
    /// input, and are logged under their own target.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

pub type Result<T> = std::result::Result<T, FormulaError>;
