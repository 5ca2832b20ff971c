//! Operator-visible dispatcher status.

use crate::types::ResumeCursor;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Where the control loop is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatcherState {
    /// Not running. Check `last_fatal_error` to tell a fatal stop from a
    /// requested one.
    Stopped,
    /// Opening the first connection.
    Connecting,
    /// Reading and dispatching events.
    Streaming,
    /// Reopening after a lost connection.
    Reconnecting,
}

/// Point-in-time view for operators.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatcherStatus {
    pub state: DispatcherState,
    /// Cursor most recently written to the cursor store.
    pub last_persisted_cursor: Option<ResumeCursor>,
    pub active_subscribers: usize,
    /// Set when the dispatcher stopped on a non-retryable failure.
    pub last_fatal_error: Option<String>,
    /// Most recent transient failure (retried).
    pub last_error: Option<String>,
    pub stats: DispatchStats,
}

impl DispatcherStatus {
    /// Stopped on a non-retryable failure.
    pub fn is_fatal(&self) -> bool {
        self.state == DispatcherState::Stopped && self.last_fatal_error.is_some()
    }
}

/// Counters since the dispatcher was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub events_dispatched: u64,
    pub deliveries: u64,
    pub filtered_out: u64,
    pub filter_errors: u64,
    pub subscriber_timeouts: u64,
    pub subscribers_disconnected: u64,
    pub open_failures: u64,
    pub reconnects: u64,
    pub checkpoints: u64,
    pub checkpoint_failures: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub events_dispatched: AtomicU64,
    pub deliveries: AtomicU64,
    pub filtered_out: AtomicU64,
    pub filter_errors: AtomicU64,
    pub subscriber_timeouts: AtomicU64,
    pub subscribers_disconnected: AtomicU64,
    pub open_failures: AtomicU64,
    pub reconnects: AtomicU64,
    pub checkpoints: AtomicU64,
    pub checkpoint_failures: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatchStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DispatchStats {
            events_dispatched: get(&self.events_dispatched),
            deliveries: get(&self.deliveries),
            filtered_out: get(&self.filtered_out),
            filter_errors: get(&self.filter_errors),
            subscriber_timeouts: get(&self.subscriber_timeouts),
            subscribers_disconnected: get(&self.subscribers_disconnected),
            open_failures: get(&self.open_failures),
            reconnects: get(&self.reconnects),
            checkpoints: get(&self.checkpoints),
            checkpoint_failures: get(&self.checkpoint_failures),
        }
    }
}

struct Board {
    state: DispatcherState,
    last_persisted_cursor: Option<ResumeCursor>,
    last_fatal_error: Option<String>,
    last_error: Option<String>,
}

/// Shared between the dispatcher thread and its handles.
pub(crate) struct StatusBoard {
    board: RwLock<Board>,
    pub counters: Counters,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self {
            board: RwLock::new(Board {
                state: DispatcherState::Stopped,
                last_persisted_cursor: None,
                last_fatal_error: None,
                last_error: None,
            }),
            counters: Counters::default(),
        }
    }

    pub fn state(&self) -> DispatcherState {
        self.board.read().state
    }

    pub fn set_state(&self, state: DispatcherState) {
        self.board.write().state = state;
    }

    pub fn set_persisted(&self, cursor: ResumeCursor) {
        self.board.write().last_persisted_cursor = Some(cursor);
    }

    pub fn set_error(&self, error: String) {
        self.board.write().last_error = Some(error);
    }

    pub fn set_fatal(&self, error: String) {
        let mut board = self.board.write();
        board.state = DispatcherState::Stopped;
        board.last_fatal_error = Some(error);
    }

    pub fn snapshot(&self, active_subscribers: usize) -> DispatcherStatus {
        let board = self.board.read();
        DispatcherStatus {
            state: board.state,
            last_persisted_cursor: board.last_persisted_cursor.clone(),
            active_subscribers,
            last_fatal_error: board.last_fatal_error.clone(),
            last_error: board.last_error.clone(),
            stats: self.counters.snapshot(),
        }
    }
}
