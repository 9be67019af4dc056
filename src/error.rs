//! Reconciler Error Types

use thiserror::Error;

use crate::history::VersionHistoryItem;

/// Result type alias for reconciler operations
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Version history errors
    #[error("Invalid history sequence: {0}")]
    InvalidSequence(String),

    #[error("History gap: expected history to end at {expected}, reached {reached:?}")]
    HistoryGap {
        expected: VersionHistoryItem,
        reached: Option<VersionHistoryItem>,
    },

    #[error("No common ancestor between version histories")]
    NoCommonAncestor,

    // Persistence errors
    #[error("Workflow already exists: {0}")]
    AlreadyExists(String),

    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Conditional update failed: {0}")]
    ConditionFailed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Peer / network errors
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable by redelivering the task
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Cancelled
                | Error::Unavailable(_)
                | Error::Network(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::ConditionFailed(_)
                | Error::AlreadyExists(_)
                | Error::Io(_)
        )
    }

    /// Errors that indicate a bug or corrupted lineage rather than bad luck
    pub fn is_protocol_fatal(&self) -> bool {
        matches!(self, Error::NoCommonAncestor)
    }

    /// Short, stable label used in logs and lease outcome records
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::ConfigParse(_) => "config",
            Error::InvalidSequence(_) => "invalid_sequence",
            Error::HistoryGap { .. } => "history_gap",
            Error::NoCommonAncestor => "no_common_ancestor",
            Error::AlreadyExists(_) => "already_exists",
            Error::NotFound(_) => "not_found",
            Error::ConditionFailed(_) => "condition_failed",
            Error::Storage(_) => "storage",
            Error::Serialization(_) => "serialization",
            Error::Unavailable(_) => "unavailable",
            Error::Network(_) | Error::ConnectionFailed { .. } | Error::ConnectionTimeout(_) => {
                "network"
            }
            Error::Io(_) => "io",
            Error::Internal(_) => "internal",
            Error::Cancelled => "cancelled",
            Error::ShuttingDown => "shutting_down",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(Error::Cancelled.is_retryable());
        assert!(Error::Unavailable("cluster-a".into()).is_retryable());
        assert!(Error::ConnectionTimeout("10.0.0.1:7700".into()).is_retryable());
        assert!(!Error::InvalidSequence("bad".into()).is_retryable());
        assert!(!Error::NoCommonAncestor.is_retryable());
        assert!(Error::NoCommonAncestor.is_protocol_fatal());

        let gap = Error::HistoryGap {
            expected: VersionHistoryItem::new(12, 11),
            reached: Some(VersionHistoryItem::new(10, 2)),
        };
        assert!(!gap.is_retryable());
        assert_eq!(gap.kind(), "history_gap");
    }
}
