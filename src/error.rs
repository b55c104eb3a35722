//! Error types shared by every evidence-vault component.

use std::io;

use thiserror::Error;

/// Errors that can occur while storing, linking, deleting or notifying about evidence.
#[derive(Error, Debug)]
pub enum EvidenceError {
    /// Evidence record or storage locator does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Ownership mismatch or a denied authorization check.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Duplicate evidence identifier or locator collision.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The upload stream grew past the configured maximum.
    #[error("Size limit exceeded: more than {limit} bytes")]
    SizeLimitExceeded { limit: u64 },

    /// A guarded dependency is unreachable or its breaker is open.
    #[error("Dependency unavailable: {dependency}: {reason}")]
    DependencyUnavailable { dependency: String, reason: String },

    /// Read or write failure against a storage backend.
    #[error("Storage IO error: {0}")]
    StorageIo(#[from] io::Error),

    /// Declared and committed byte counts disagree.
    #[error("Corruption: declared {expected} bytes but {actual} were written")]
    Corruption { expected: u64, actual: u64 },

    /// Metadata store failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Caller supplied an unusable value.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Settings could not be loaded or are inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invariant broken inside the engine (e.g. poisoned lock).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for evidence operations.
pub type EvidenceResult<T> = Result<T, EvidenceError>;

impl EvidenceError {
    pub fn dependency(dependency: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DependencyUnavailable {
            dependency: dependency.into(),
            reason: reason.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageIo(io::Error::other(message.into()))
    }

    /// Stable label used in logs and ingress responses.
    pub fn kind_label(&self) -> &'static str {
        match self {
            EvidenceError::NotFound(_) => "not_found",
            EvidenceError::Forbidden(_) => "forbidden",
            EvidenceError::Conflict(_) => "conflict",
            EvidenceError::SizeLimitExceeded { .. } => "size_limit_exceeded",
            EvidenceError::DependencyUnavailable { .. } => "dependency_unavailable",
            EvidenceError::StorageIo(_) => "storage_io",
            EvidenceError::Corruption { .. } => "corruption",
            EvidenceError::Database(_) => "database",
            EvidenceError::Json(_) => "json",
            EvidenceError::InvalidInput(_) => "invalid_input",
            EvidenceError::Config(_) => "config",
            EvidenceError::Internal(_) => "internal",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EvidenceError::StorageIo(_)
                | EvidenceError::DependencyUnavailable { .. }
                | EvidenceError::Database(_)
        )
    }

    /// Authorization-relevant outcomes. Both fail closed.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            EvidenceError::Forbidden(_) | EvidenceError::DependencyUnavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels_are_stable() {
        assert_eq!(EvidenceError::NotFound("x".into()).kind_label(), "not_found");
        assert_eq!(
            EvidenceError::SizeLimitExceeded { limit: 1 }.kind_label(),
            "size_limit_exceeded"
        );
        assert_eq!(
            EvidenceError::dependency("case", "breaker open").kind_label(),
            "dependency_unavailable"
        );
        assert_eq!(EvidenceError::storage("disk full").kind_label(), "storage_io");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(EvidenceError::storage("timeout").is_retryable());
        assert!(EvidenceError::dependency("auth", "down").is_retryable());
        assert!(!EvidenceError::Forbidden("nope".into()).is_retryable());
        assert!(!EvidenceError::Corruption {
            expected: 10,
            actual: 9
        }
        .is_retryable());
    }

    #[test]
    fn test_denial_covers_breaker_and_forbidden() {
        assert!(EvidenceError::Forbidden("not owner".into()).is_denial());
        assert!(EvidenceError::dependency("case", "open").is_denial());
        assert!(!EvidenceError::NotFound("e1".into()).is_denial());
    }

    #[test]
    fn test_display_includes_context() {
        let err = EvidenceError::Corruption {
            expected: 10,
            actual: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains("10"));
        assert!(msg.contains("7"));
    }
}
