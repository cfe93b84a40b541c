//! Error types for bqlink

use std::fmt;
use std::time::Duration;

/// Result type alias using BqlinkError
pub type Result<T> = std::result::Result<T, BqlinkError>;

/// Failure reported by a remote collaborator (submission, page fetch,
/// stream read or client-info service). Code and message are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ServiceError {
    pub code: String,
    pub message: String,
}

impl ServiceError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Main error type for bqlink
#[derive(Debug, Clone, thiserror::Error)]
pub enum BqlinkError {
    /// Bad configuration or argument, detected before any I/O
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Operation on a closed connection
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Operation on an exhausted, closed or failed cursor
    #[error("Cursor is {state}{}", describe_cause(.cause))]
    CursorState {
        state: String,
        cause: Option<Box<BqlinkError>>,
    },

    /// Transport or backend failure while reading rows
    #[error("Backend read failed: {0}")]
    BackendRead(ServiceError),

    /// Query submission exceeded the synchronous response timeout
    #[error("Query submission timed out after {0:?}")]
    Timeout(Duration),

    /// Query submission rejected by the warehouse
    #[error("BigQuery error: {0}")]
    BigQuery(ServiceError),

    /// Client info property rejected, or set on a closed connection
    #[error("Client info property '{name}' could not be set: {reason}")]
    ClientInfo { name: String, reason: String },
}

fn describe_cause(cause: &Option<Box<BqlinkError>>) -> String {
    match cause {
        Some(cause) => format!(" (caused by: {})", cause),
        None => String::new(),
    }
}

impl BqlinkError {
    /// Create a validation error from any displayable value
    pub fn validation<E: fmt::Display>(err: E) -> Self {
        BqlinkError::Validation(err.to_string())
    }

    /// Cursor state error without an underlying cause
    pub fn cursor_state(state: impl Into<String>) -> Self {
        BqlinkError::CursorState {
            state: state.into(),
            cause: None,
        }
    }

    /// Get the error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            BqlinkError::Validation(_) => "VALIDATION_ERROR",
            BqlinkError::IllegalState(_) => "ILLEGAL_STATE",
            BqlinkError::CursorState { .. } => "CURSOR_STATE",
            BqlinkError::BackendRead(_) => "BACKEND_READ_ERROR",
            BqlinkError::Timeout(_) => "DEADLINE_EXCEEDED",
            BqlinkError::BigQuery(_) => "BIGQUERY_ERROR",
            BqlinkError::ClientInfo { .. } => "CLIENT_INFO_ERROR",
        }
    }

    /// The collaborator-reported failure behind this error, if any
    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            BqlinkError::BackendRead(e) | BqlinkError::BigQuery(e) => Some(e),
            BqlinkError::CursorState {
                cause: Some(cause), ..
            } => cause.service_error(),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for BqlinkError {
    fn from(err: config::ConfigError) -> Self {
        BqlinkError::Validation(format!("configuration: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(BqlinkError::Validation("x".into()).code(), "VALIDATION_ERROR");
        assert_eq!(
            BqlinkError::Timeout(Duration::from_secs(1)).code(),
            "DEADLINE_EXCEEDED"
        );
        assert_eq!(BqlinkError::cursor_state("closed").code(), "CURSOR_STATE");
    }

    #[test]
    fn test_cursor_state_mentions_cause() {
        let cause = BqlinkError::BackendRead(ServiceError::new("UNAVAILABLE", "stream reset"));
        let err = BqlinkError::CursorState {
            state: "failed".into(),
            cause: Some(Box::new(cause)),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("Cursor is failed"));
        assert!(msg.contains("UNAVAILABLE: stream reset"));
        assert_eq!(err.service_error().map(|e| e.code.as_str()), Some("UNAVAILABLE"));
    }

    #[test]
    fn test_service_error_is_preserved() {
        let err = BqlinkError::BigQuery(ServiceError::new("NOT_FOUND", "Table t not found"));
        assert_eq!(err.to_string(), "BigQuery error: NOT_FOUND: Table t not found");
        assert!(BqlinkError::cursor_state("exhausted").service_error().is_none());
    }
}
