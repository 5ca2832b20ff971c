//! In-process change feed.
//!
//! An append-ordered log of change events with a bounded retention window.
//! Useful for tests and for embedding the dispatcher in front of a store
//! that already produces events in-process. Supports fault injection:
//! availability toggling and severing of live connections.

use super::{EventSource, SourceConnection, SourceError};
use crate::types::{
    ChangeEvent, Namespace, Operation, RecordKey, ResumeCursor, SequencePosition, Timestamp,
};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default number of events retained before the oldest are trimmed.
const DEFAULT_RETENTION: usize = 100_000;

struct FeedLog {
    /// Retained events, oldest first.
    events: VecDeque<ChangeEvent>,
    /// Sequence number the next append receives (starts at 1).
    next_seq: u64,
    /// Max retained events.
    retention: usize,
    /// Whether `open` succeeds.
    available: bool,
    /// Bumped to invalidate every live connection.
    generation: u64,
}

impl FeedLog {
    fn first_retained(&self) -> u64 {
        self.next_seq - self.events.len() as u64
    }
}

struct FeedInner {
    identity: String,
    log: Mutex<FeedLog>,
    appended: Condvar,
}

/// In-memory change feed. Cheap to clone; clones share the log.
#[derive(Clone)]
pub struct MemoryFeed {
    inner: Arc<FeedInner>,
}

impl MemoryFeed {
    /// Create a feed with the default retention window.
    pub fn new(identity: impl Into<String>) -> Self {
        Self::with_retention(identity, DEFAULT_RETENTION)
    }

    /// Create a feed that keeps at most `retention` events.
    pub fn with_retention(identity: impl Into<String>, retention: usize) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                identity: identity.into(),
                log: Mutex::new(FeedLog {
                    events: VecDeque::new(),
                    next_seq: 1,
                    retention: retention.max(1),
                    available: true,
                    generation: 0,
                }),
                appended: Condvar::new(),
            }),
        }
    }

    /// Append a mutation. Returns the position assigned to it.
    pub fn append(
        &self,
        operation: Operation,
        namespace: Namespace,
        key: RecordKey,
    ) -> SequencePosition {
        let mut log = self.inner.log.lock();
        let position = SequencePosition::from_u64(log.next_seq);
        log.next_seq += 1;

        log.events.push_back(ChangeEvent {
            position: position.clone(),
            operation,
            namespace,
            key,
            timestamp: Timestamp::now(),
        });
        while log.events.len() > log.retention {
            log.events.pop_front();
        }

        drop(log);
        self.inner.appended.notify_all();
        position
    }

    /// Position of the most recent event, if any.
    pub fn latest_position(&self) -> Option<SequencePosition> {
        let log = self.inner.log.lock();
        log.next_seq
            .checked_sub(1)
            .filter(|seq| *seq > 0)
            .map(SequencePosition::from_u64)
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.inner.log.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Toggle availability. While unavailable, `open` fails and live
    /// connections report a lost connection.
    pub fn set_available(&self, available: bool) {
        self.inner.log.lock().available = available;
        self.inner.appended.notify_all();
    }

    /// Break every live connection; each fails on its next read.
    pub fn sever_connections(&self) {
        self.inner.log.lock().generation += 1;
        self.inner.appended.notify_all();
    }
}

impl EventSource for MemoryFeed {
    type Connection = MemoryConnection;

    fn identity(&self) -> &str {
        &self.inner.identity
    }

    fn open(&mut self, cursor: &ResumeCursor) -> Result<MemoryConnection, SourceError> {
        let log = self.inner.log.lock();
        if !log.available {
            return Err(SourceError::Unavailable(format!(
                "feed {} is not accepting connections",
                self.inner.identity
            )));
        }

        let next = match cursor.position() {
            None => log.next_seq,
            Some(position) => {
                let after = position.as_u64().ok_or_else(|| SourceError::CursorTooOld {
                    cursor: cursor.clone(),
                })?;
                let next = after.saturating_add(1);
                if next < log.first_retained() {
                    return Err(SourceError::CursorTooOld {
                        cursor: cursor.clone(),
                    });
                }
                next
            }
        };

        Ok(MemoryConnection {
            inner: Arc::clone(&self.inner),
            cursor: cursor.clone(),
            next,
            generation: log.generation,
        })
    }
}

/// Live read session on a [`MemoryFeed`].
pub struct MemoryConnection {
    inner: Arc<FeedInner>,
    cursor: ResumeCursor,
    /// Sequence number of the next event to hand out.
    next: u64,
    generation: u64,
}

impl SourceConnection for MemoryConnection {
    fn next(&mut self, wait: Duration) -> Result<Option<ChangeEvent>, SourceError> {
        let deadline = Instant::now() + wait;
        let mut log = self.inner.log.lock();

        loop {
            if log.generation != self.generation {
                return Err(SourceError::ConnectionLost("connection severed".into()));
            }
            if !log.available {
                return Err(SourceError::ConnectionLost("feed went away".into()));
            }

            let first = log.first_retained();
            if self.next < first {
                return Err(SourceError::ConnectionLost(
                    "reader fell behind the retention window".into(),
                ));
            }

            if self.next < log.next_seq {
                let index = (self.next - first) as usize;
                let event = log.events.get(index).cloned();
                if event.is_some() {
                    self.next += 1;
                }
                return Ok(event);
            }

            if self
                .inner
                .appended
                .wait_until(&mut log, deadline)
                .timed_out()
            {
                return Ok(None);
            }
        }
    }

    fn cursor(&self) -> &ResumeCursor {
        &self.cursor
    }

    fn resume_point(&self) -> ResumeCursor {
        ResumeCursor::at(SequencePosition::from_u64(self.next - 1))
    }
}
