//! Error types for the dataflow engine

use thiserror::Error;

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the dataflow engine
///
/// The enum is `Clone` because pull results are shared between every
/// caller awaiting the same in-flight computation; source errors are
/// therefore carried as rendered strings rather than wrapped values.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A field value failed its type contract
    #[error("invalid value for field '{field}': {message}")]
    Validation { field: String, message: String },

    /// Adding the edge would close a cycle
    #[error("edge '{from}' -> '{to}' would close a cycle")]
    Cycle { from: String, to: String },

    /// A transform threw or rejected
    #[error("operator '{operator}' failed: {message}")]
    Execution { operator: String, message: String },

    /// A cross-operator reference resolved to a missing operator
    #[error("operator '{0}' not found")]
    OperatorNotFound(String),

    /// A port reference resolved to a missing field
    #[error("no field '{field}' on operator '{operator}'")]
    FieldNotFound { operator: String, field: String },

    /// A leaf operator declined an input combination
    #[error("unsupported input format: {0}")]
    UnsupportedFormat(String),

    /// Embedded query backend error
    #[error("query backend error: {0}")]
    Query(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    /// Create an execution error for an operator
    pub fn execution(operator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            operator: operator.into(),
            message: message.into(),
        }
    }

    /// Create a validation error for a field
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
