//! Event source adapters.
//!
//! An [`EventSource`] wraps a backing store's change feed. The dispatcher
//! opens a [`SourceConnection`] with its last persisted cursor and reads
//! events from it until the connection fails, at which point the
//! connection is dropped and a new one is opened from the same cursor.
//!
//! Reads distinguish three outcomes:
//! - `Ok(Some(event))`: the next event in source order;
//! - `Ok(None)`: nothing arrived within the wait, the connection is healthy;
//! - `Err(SourceError::ConnectionLost(_))`: the connection is dead.
//!
//! # Example
//!
//! ```ignore
//! let feed = MemoryFeed::with_retention("orders", 10_000);
//! let mut conn = feed.clone().open(&ResumeCursor::empty())?;
//! feed.append(Operation::Insert { document: json!({"total": 500}) }, ns, key);
//! let event = conn.next(Duration::from_millis(100))?;
//! ```

mod document;
mod memory;

pub use document::decode_change_document;
pub use memory::{MemoryConnection, MemoryFeed};

use crate::types::{ChangeEvent, ResumeCursor};
use std::time::Duration;
use thiserror::Error;

/// Failures reported at the source boundary.
#[derive(Clone, Debug, Error)]
pub enum SourceError {
    /// Source could not be reached; retry with backoff.
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    /// A live connection broke; reopen from the last persisted cursor.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The source no longer retains events after this cursor.
    #[error("Resume cursor {cursor} has fallen out of the source's retention window")]
    CursorTooOld { cursor: ResumeCursor },

    /// A source-native event could not be converted.
    #[error("Malformed change document: {0}")]
    Malformed(String),
}

impl SourceError {
    /// Everything except an expired cursor is worth retrying.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SourceError::CursorTooOld { .. })
    }
}

/// A backing store's change feed.
pub trait EventSource: Send {
    type Connection: SourceConnection;

    /// Stable identity of this source, used to key persisted cursors.
    fn identity(&self) -> &str;

    /// Open a read session.
    ///
    /// An empty cursor starts from the current end of the feed. A prior
    /// cursor resumes strictly after that position, or fails with
    /// [`SourceError::CursorTooOld`] if the source can no longer honor it.
    fn open(&mut self, cursor: &ResumeCursor) -> Result<Self::Connection, SourceError>;
}

/// One live read session. Invalid after any error; never reused.
pub trait SourceConnection: Send {
    /// Wait up to `wait` for the next event.
    fn next(&mut self, wait: Duration) -> Result<Option<ChangeEvent>, SourceError>;

    /// The cursor this connection was opened with.
    fn cursor(&self) -> &ResumeCursor;

    /// A cursor that resumes exactly where this connection stands.
    ///
    /// Connections opened with an empty cursor should report the concrete
    /// start position here, so the consumer can anchor it before any event
    /// arrives. Defaults to the opening cursor.
    fn resume_point(&self) -> ResumeCursor {
        self.cursor().clone()
    }
}
