//! Error taxonomy for the menu sync engine.
//!
//! Every failure is classified as [`FailureType::Transient`] (retry with
//! backoff, then dead-letter) or [`FailureType::Permanent`] (dead-letter
//! immediately). Cancellation is reported separately and is neither.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure classification used by the orchestrator and the dead letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    Transient,
    Permanent,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

/// Persistence failures surfaced by repository implementations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Database internal error: {0}")]
    Internal(String),
}

/// External collaborator that produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collaborator {
    CatalogSource,
    DeltaSubmission,
}

impl std::fmt::Display for Collaborator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CatalogSource => write!(f, "catalog source"),
            Self::DeltaSubmission => write!(f, "delta submission"),
        }
    }
}

/// What went wrong when talking to a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CollaboratorErrorKind {
    Timeout,
    RateLimited,
    Connection,
    Http { status: u16 },
    /// The collaborator rejected the request outright (bad payload, business rule).
    Rejected,
}

/// Failure reported by an upstream fetch or downstream submission.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{collaborator} {kind:?}: {message}")]
pub struct CollaboratorError {
    pub collaborator: Collaborator,
    pub kind: CollaboratorErrorKind,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(
        collaborator: Collaborator,
        kind: CollaboratorErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            collaborator,
            kind,
            message: message.into(),
        }
    }

    /// Builds an error from an HTTP status code returned by a collaborator.
    pub fn from_status(collaborator: Collaborator, status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            408 => CollaboratorErrorKind::Timeout,
            429 => CollaboratorErrorKind::RateLimited,
            _ => CollaboratorErrorKind::Http { status },
        };
        Self::new(collaborator, kind, message)
    }

    pub fn timeout(collaborator: Collaborator, message: impl Into<String>) -> Self {
        Self::new(collaborator, CollaboratorErrorKind::Timeout, message)
    }

    pub fn rejected(collaborator: Collaborator, message: impl Into<String>) -> Self {
        Self::new(collaborator, CollaboratorErrorKind::Rejected, message)
    }

    pub fn failure_type(&self) -> FailureType {
        match self.kind {
            CollaboratorErrorKind::Timeout
            | CollaboratorErrorKind::RateLimited
            | CollaboratorErrorKind::Connection => FailureType::Transient,
            CollaboratorErrorKind::Http { status } => classify_http_status(status),
            CollaboratorErrorKind::Rejected => FailureType::Permanent,
        }
    }
}

/// Classify HTTP status into retry behavior.
pub fn classify_http_status(status: u16) -> FailureType {
    match status {
        408 | 425 | 429 => FailureType::Transient,
        500..=599 => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

/// Errors that can occur anywhere in the engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Missing required mapping: {0}")]
    MissingMapping(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Payload codec error: {0}")]
    Codec(#[from] std::io::Error),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Concurrency conflict: {0}")]
    Conflict(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::Database(DatabaseError::NotFound(message.into()))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Classify error for retry policy.
    ///
    /// Connection-level persistence failures and optimistic-concurrency
    /// conflicts are transient; everything describing bad data is permanent.
    pub fn failure_type(&self) -> FailureType {
        match self {
            Self::Collaborator(err) => err.failure_type(),
            Self::Database(DatabaseError::ConnectionFailed(_)) => FailureType::Transient,
            Self::Database(DatabaseError::QueryFailed(_)) => FailureType::Transient,
            Self::Database(_) => FailureType::Permanent,
            Self::Conflict(_) => FailureType::Transient,
            Self::Cancelled(_) => FailureType::Transient,
            Self::Validation(_)
            | Self::MissingMapping(_)
            | Self::Serialization(_)
            | Self::Codec(_)
            | Self::InvalidTransition(_)
            | Self::Config(_)
            | Self::Internal(_) => FailureType::Permanent,
        }
    }

    /// Short machine-readable code stored alongside run errors.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "database",
            Self::Validation(_) => "validation",
            Self::MissingMapping(_) => "missing_mapping",
            Self::Serialization(_) => "serialization",
            Self::Codec(_) => "codec",
            Self::Collaborator(err) => match err.kind {
                CollaboratorErrorKind::Timeout => "timeout",
                CollaboratorErrorKind::RateLimited => "rate_limited",
                CollaboratorErrorKind::Connection => "connection",
                CollaboratorErrorKind::Http { .. } => "http",
                CollaboratorErrorKind::Rejected => "rejected",
            },
            Self::InvalidTransition(_) => "invalid_transition",
            Self::Conflict(_) => "conflict",
            Self::Cancelled(_) => "cancelled",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }

    /// Summarized message safe to show on the run record.
    pub fn summary(&self) -> String {
        match self {
            Self::Database(_) => "Persistence failure while synchronizing the menu".to_string(),
            Self::Codec(_) | Self::Internal(_) => "Internal error while synchronizing the menu".to_string(),
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_http_status_for_retry_policy() {
        assert_eq!(classify_http_status(500), FailureType::Transient);
        assert_eq!(classify_http_status(503), FailureType::Transient);
        assert_eq!(classify_http_status(429), FailureType::Transient);
        assert_eq!(classify_http_status(408), FailureType::Transient);
        assert_eq!(classify_http_status(425), FailureType::Transient);
        assert_eq!(classify_http_status(400), FailureType::Permanent);
        assert_eq!(classify_http_status(409), FailureType::Permanent);
        assert_eq!(classify_http_status(423), FailureType::Permanent);
        assert_eq!(classify_http_status(422), FailureType::Permanent);
    }

    #[test]
    fn timeouts_are_transient_and_rejections_permanent() {
        let timeout = Error::from(CollaboratorError::timeout(
            Collaborator::DeltaSubmission,
            "deadline elapsed",
        ));
        assert_eq!(timeout.failure_type(), FailureType::Transient);
        assert_eq!(timeout.code(), "timeout");

        let rejected = Error::from(CollaboratorError::rejected(
            Collaborator::DeltaSubmission,
            "menu payload invalid",
        ));
        assert_eq!(rejected.failure_type(), FailureType::Permanent);
    }

    #[test]
    fn status_429_maps_to_rate_limited() {
        let err = CollaboratorError::from_status(Collaborator::CatalogSource, 429, "slow down");
        assert_eq!(err.kind, CollaboratorErrorKind::RateLimited);
        assert_eq!(err.failure_type(), FailureType::Transient);
    }

    #[test]
    fn validation_errors_are_permanent() {
        assert_eq!(
            Error::validation("empty product id").failure_type(),
            FailureType::Permanent
        );
        assert_eq!(
            Error::MissingMapping("category c9".into()).failure_type(),
            FailureType::Permanent
        );
    }

    #[test]
    fn summary_hides_persistence_details() {
        let err = Error::Database(DatabaseError::QueryFailed("disk I/O error at page 7".into()));
        assert!(!err.summary().contains("page 7"));
    }
}
