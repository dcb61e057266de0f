use crate::catalog::CanonicalType;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Introspection error: {0}")]
    Introspection(String),

    #[error("No database is connected")]
    NotConnected,

    #[error("Ambiguous reference '{term}': could mean {}", .candidates.join(", "))]
    AmbiguousReference { term: String, candidates: Vec<String> },

    #[error("No relationship path joins '{from}' to '{to}'")]
    UnresolvedJoinPath { from: String, to: String },

    #[error("Could not match '{0}' to any table, column or known value")]
    UnresolvedReference(String),

    #[error("Unsupported intent: {0}")]
    UnsupportedIntent(String),

    #[error("Type mismatch: '{literal}' is not a valid {expected} value for {column}")]
    TypeMismatch {
        column: String,
        expected: CanonicalType,
        literal: String,
    },

    #[error("Query execution timed out after {after_ms}ms")]
    ExecutionTimeout { after_ms: u64 },

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),
}

impl EngineError {
    /// Failures reported to the user as "could not understand query".
    pub fn is_understanding_failure(&self) -> bool {
        matches!(
            self,
            EngineError::AmbiguousReference { .. }
                | EngineError::UnresolvedJoinPath { .. }
                | EngineError::UnresolvedReference(_)
                | EngineError::UnsupportedIntent(_)
                | EngineError::TypeMismatch { .. }
        )
    }

    /// Failures the user may simply try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Connection(_) | EngineError::ExecutionTimeout { .. }
        )
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Json(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
