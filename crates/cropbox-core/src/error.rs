//! Error types for cropbox-core

use crate::EntityId;
use thiserror::Error;

/// Core error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A rule that does not tolerate reentry is already being evaluated
    /// for the same entity in the current regime.
    #[error("Cyclic dependency: {rule} on {entity} is already being evaluated")]
    CyclicDependency { rule: String, entity: String },

    #[error("Incompatible units: cannot convert {from} to {to}")]
    IncompatibleUnit { from: String, to: String },

    #[error("Unresolved dependency: {name} required by {rule} on {entity}")]
    UnresolvedDependency {
        rule: String,
        entity: String,
        name: String,
    },

    #[error("No convergence for {rule} after {iterations} iterations: {reason}")]
    Convergence {
        rule: String,
        iterations: usize,
        reason: String,
    },

    #[error("Type error: expected {expected}, got {got}")]
    TypeError { expected: String, got: String },

    #[error("Unknown unit: {0}")]
    UnknownUnit(String),

    #[error("Unknown rule: {name} on {entity}")]
    UnknownRule { entity: String, name: String },

    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failure raised while computing a rule, tagged with the rule and
    /// entity that triggered it.
    #[error("{rule} on {entity}: {source}")]
    Evaluation {
        rule: String,
        entity: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn type_error(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Error::TypeError {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Tag this error with the rule and entity it surfaced from.
    ///
    /// Errors that already carry an identity are returned unchanged so the
    /// innermost rule is the one reported.
    pub(crate) fn within(self, rule: &str, entity: &str) -> Self {
        match self {
            Error::Evaluation { .. }
            | Error::CyclicDependency { .. }
            | Error::UnresolvedDependency { .. }
            | Error::Convergence { .. } => self,
            other => Error::Evaluation {
                rule: rule.to_string(),
                entity: entity.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, skipping `Evaluation` wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Evaluation { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
