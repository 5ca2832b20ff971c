//! Handle to a dispatcher running on its own thread.

use super::status::{DispatcherState, DispatcherStatus, StatusBoard};
use crate::error::{FeedError, Result};
use crate::shutdown::Shutdown;
use crate::subscriptions::SubscriberRegistry;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Controls a spawned [`Dispatcher`](super::Dispatcher).
///
/// Dropping the handle requests shutdown and waits for the thread.
pub struct DispatcherHandle {
    shutdown: Shutdown,
    status: Arc<StatusBoard>,
    registry: Arc<SubscriberRegistry>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl DispatcherHandle {
    pub(crate) fn new(
        shutdown: Shutdown,
        status: Arc<StatusBoard>,
        registry: Arc<SubscriberRegistry>,
        thread: JoinHandle<Result<()>>,
    ) -> Self {
        Self {
            shutdown,
            status,
            registry,
            thread: Some(thread),
        }
    }

    /// Current state, cursor, subscriber count and last fatal error.
    pub fn status(&self) -> DispatcherStatus {
        self.status.snapshot(self.registry.active_count())
    }

    pub fn state(&self) -> DispatcherState {
        self.status.state()
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Ask the dispatcher to stop. Returns immediately.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Poll the status until `predicate` holds or `timeout` passes.
    pub fn wait_for<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&DispatcherStatus) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate(&self.status()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    /// Wait for the dispatcher thread to exit and return its result.
    ///
    /// Does not request shutdown; call [`Self::shutdown`] first to stop a
    /// healthy dispatcher.
    pub fn join(mut self) -> Result<()> {
        self.join_thread()
    }

    /// Request shutdown and wait for the thread.
    pub fn stop(self) -> Result<()> {
        self.shutdown();
        self.join()
    }

    fn join_thread(&mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| FeedError::Panicked)?,
            None => Ok(()),
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.shutdown.trigger();
        let _ = self.join_thread();
    }
}
