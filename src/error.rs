//! Error types for the change-feed dispatcher.

use crate::subscriptions::SubscriberId;
use crate::types::ResumeCursor;
use thiserror::Error;

/// Main error type for dispatcher and checkpoint operations.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checkpoint directory is locked by another process")]
    Locked,

    #[error("Invalid checkpoint format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Subscriber not found: {0}")]
    SubscriberNotFound(SubscriberId),

    #[error(
        "Resume cursor {cursor} is older than the source's retention window; \
         reseed the consumer from a fresh snapshot and clear its stored cursor"
    )]
    CursorTooOld { cursor: ResumeCursor },

    #[error("Dispatcher thread panicked")]
    Panicked,

    #[error("Shutdown requested")]
    Shutdown,
}

impl FeedError {
    /// Whether the dispatcher may retry after this error.
    ///
    /// Corrupted or undecodable checkpoints and expired cursors need an
    /// operator; everything else is treated as transient.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FeedError::Corruption(_)
                | FeedError::Deserialization(_)
                | FeedError::ChecksumMismatch { .. }
                | FeedError::InvalidFormat(_)
                | FeedError::CursorTooOld { .. }
                | FeedError::Locked
                | FeedError::Shutdown
        )
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        FeedError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for FeedError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        FeedError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for FeedError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        FeedError::Deserialization(e.to_string())
    }
}

/// Result type for dispatcher operations.
pub type Result<T> = std::result::Result<T, FeedError>;
