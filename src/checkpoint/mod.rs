//! Resume cursor persistence.
//!
//! A [`CursorStore`] keeps one opaque cursor per (source, consumer) pair so
//! a restarted dispatcher resumes where the previous one stopped.

mod file;

pub use file::FileCursorStore;

use crate::error::{FeedError, Result};
use crate::types::{CheckpointKey, ResumeCursor};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Durable home for resume cursors.
pub trait CursorStore: Send + Sync {
    /// Load the cursor for `key`, if one was saved.
    fn load(&self, key: &CheckpointKey) -> Result<Option<ResumeCursor>>;

    /// Replace the cursor for `key`.
    fn save(&self, key: &CheckpointKey, cursor: &ResumeCursor) -> Result<()>;

    /// Forget the cursor for `key` (used when reseeding a consumer).
    fn clear(&self, key: &CheckpointKey) -> Result<()>;
}

/// Process-local cursor store.
///
/// Survives dispatcher restarts within one process, which is enough for
/// tests and for consumers that re-read from "now" after a crash anyway.
#[derive(Default)]
pub struct MemoryCursorStore {
    cursors: RwLock<HashMap<CheckpointKey, ResumeCursor>>,
    fail_saves: AtomicBool,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent save fail with an I/O error.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

impl CursorStore for MemoryCursorStore {
    fn load(&self, key: &CheckpointKey) -> Result<Option<ResumeCursor>> {
        Ok(self.cursors.read().get(key).cloned())
    }

    fn save(&self, key: &CheckpointKey, cursor: &ResumeCursor) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(FeedError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "cursor store rejected the write",
            )));
        }
        self.cursors.write().insert(key.clone(), cursor.clone());
        Ok(())
    }

    fn clear(&self, key: &CheckpointKey) -> Result<()> {
        self.cursors.write().remove(key);
        Ok(())
    }
}
