//! Error types for Wiregate

use thiserror::Error;

/// Result type alias using Wiregate Error
pub type Result<T> = std::result::Result<T, Error>;

/// A single failed validation check, tied to the offending field.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Wiregate error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("{0}")]
    Immutable(String),

    #[error("Validation failed: {}", format_field_errors(.0))]
    Validation(Vec<FieldError>),

    #[error("No free tunnel address left on interface {interface}")]
    AllocationExhausted { interface: String },

    #[error("Domain {domain} unavailable: {reason}")]
    DomainUnavailable { domain: String, reason: String },

    #[error("Route sync failed: {0}")]
    RouteSync(String),

    #[error("Reconciliation failed: {0}")]
    Reconciliation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a single-field validation failure.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation(vec![FieldError::new(field, message)])
    }

    pub fn not_found(kind: impl Into<String>, id: impl std::fmt::Display) -> Self {
        Error::NotFound {
            kind: kind.into(),
            id: id.to_string(),
        }
    }
}

fn format_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display() {
        let err = Error::Validation(vec![
            FieldError::new("domain", "already in use"),
            FieldError::new("port", "out of range"),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("domain: already in use"));
        assert!(msg.contains("port: out of range"));
    }

    #[test]
    fn test_not_found_display() {
        let err = Error::not_found("node", "42");
        assert_eq!(err.to_string(), "Resource not found: node with id 42");
    }
}
