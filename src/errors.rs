// Error Taxonomy - Structured failures surfaced to callers
// Every failure carries a stable kind tag and a human-readable reason.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::query_validation::ViolationReason;

/// Result alias used across the engine's public entry points
pub type EngineResult<T> = std::result::Result<T, QueryError>;

/// Stable, machine-readable classification of a [`QueryError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationRejected,
    ExecutionTimeout,
    ExecutionError,
    UnresolvedLocation,
    NoMatchingIntent,
    CacheUnavailable,
    Cancelled,
    InvalidInput,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationRejected => "validation_rejected",
            ErrorKind::ExecutionTimeout => "execution_timeout",
            ErrorKind::ExecutionError => "execution_error",
            ErrorKind::UnresolvedLocation => "unresolved_location",
            ErrorKind::NoMatchingIntent => "no_matching_intent",
            ErrorKind::CacheUnavailable => "cache_unavailable",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidInput => "invalid_input",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    #[error("Statement rejected: {}", summarize(violations))]
    ValidationRejected { violations: Vec<ViolationReason> },

    #[error("Execution exceeded timeout of {timeout_ms}ms")]
    ExecutionTimeout { timeout_ms: u64, query_id: String },

    #[error("Graph store error: {message}")]
    ExecutionError { message: String },

    #[error("Parameter ${name} is referenced but not bound")]
    UnboundParameter { name: String },

    #[error("No source location for node {node_id}")]
    UnresolvedLocation { node_id: String },

    #[error("No intent matched the prompt: {reason}")]
    NoMatchingIntent { reason: String },

    #[error("Cache unavailable: {reason}")]
    CacheUnavailable { reason: String },

    #[error("Request cancelled during {stage}")]
    Cancelled { stage: String },

    #[error("Invalid input: {field} - {reason}")]
    InvalidInput { field: String, reason: String },
}

fn summarize(violations: &[ViolationReason]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl QueryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::ValidationRejected { .. } => ErrorKind::ValidationRejected,
            QueryError::ExecutionTimeout { .. } => ErrorKind::ExecutionTimeout,
            QueryError::ExecutionError { .. } | QueryError::UnboundParameter { .. } => {
                ErrorKind::ExecutionError
            }
            QueryError::UnresolvedLocation { .. } => ErrorKind::UnresolvedLocation,
            QueryError::NoMatchingIntent { .. } => ErrorKind::NoMatchingIntent,
            QueryError::CacheUnavailable { .. } => ErrorKind::CacheUnavailable,
            QueryError::Cancelled { .. } => ErrorKind::Cancelled,
            QueryError::InvalidInput { .. } => ErrorKind::InvalidInput,
        }
    }

    /// Only timeouts are worth another attempt, and only with a different statement
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueryError::ExecutionTimeout { .. })
    }

    pub fn invalid_input(field: &str, err: impl fmt::Display) -> Self {
        QueryError::InvalidInput {
            field: field.to_string(),
            reason: err.to_string(),
        }
    }

    pub fn cancelled(stage: &str) -> Self {
        QueryError::Cancelled {
            stage: stage.to_string(),
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            reason: self.to_string(),
        }
    }
}

/// Serializable `{kind, reason}` form of an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_are_stable() {
        let err = QueryError::UnboundParameter {
            name: "object".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::ExecutionError);
        assert_eq!(err.kind().as_str(), "execution_error");

        let json = serde_json::to_value(QueryError::cancelled("execution").report()).unwrap();
        assert_eq!(json["kind"], "cancelled");
        assert_eq!(json["reason"], "Request cancelled during execution");
    }

    #[test]
    fn test_rejection_message_lists_violations() {
        let err = QueryError::ValidationRejected {
            violations: vec![
                ViolationReason::WriteOperation {
                    keyword: "DELETE".to_string(),
                },
                ViolationReason::TooManyHops { hops: 9, max_hops: 6 },
            ],
        };
        let message = err.to_string();
        assert!(message.contains("DELETE"));
        assert!(message.contains("9"));
        assert!(!err.is_retryable());
    }
}
