//! Dispatcher configuration.

use crate::policies::BackoffPolicy;
use std::time::Duration;

/// Configuration for a [`Dispatcher`](super::Dispatcher).
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Identity of this consumer; together with the source identity it
    /// keys the persisted cursor.
    pub consumer_id: String,

    /// Max time one subscriber may take to accept one event before it is
    /// drained. Also bounds how long a shutdown request can go unnoticed.
    /// Default: 1s
    pub delivery_timeout: Duration,

    /// Max wait on the source per read before re-checking for shutdown.
    /// Default: 100ms
    pub poll_interval: Duration,

    /// Reconnect policy for unavailable sources and lost connections.
    pub backoff: BackoffPolicy,

    /// Max threads delivering one event to blocked subscribers in parallel.
    /// Default: 8
    pub fanout_workers: usize,

    /// Persist the cursor every N fully dispatched events (0 and 1 both
    /// mean every event). Default: 1
    pub checkpoint_interval: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            consumer_id: "default".to_string(),
            delivery_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            backoff: BackoffPolicy::default(),
            fanout_workers: 8,
            checkpoint_interval: 1,
        }
    }
}

impl DispatcherConfig {
    pub fn for_consumer(consumer_id: impl Into<String>) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            ..Default::default()
        }
    }

    /// Wait used for each source read.
    pub(crate) fn read_wait(&self) -> Duration {
        self.poll_interval.min(self.delivery_timeout)
    }
}
