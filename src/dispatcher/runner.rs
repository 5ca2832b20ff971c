//! The dispatch control loop.

use super::config::DispatcherConfig;
use super::handle::DispatcherHandle;
use super::status::{Counters, DispatcherState, DispatcherStatus, StatusBoard};
use crate::checkpoint::CursorStore;
use crate::error::{FeedError, Result};
use crate::shutdown::{Cancellation, Shutdown};
use crate::source::{EventSource, SourceConnection, SourceError};
use crate::subscriptions::{
    DeliveryOutcome, DropReason, Subscriber, SubscriberId, SubscriberRegistry,
};
use crate::types::{ChangeEvent, CheckpointKey, ResumeCursor};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, trace, warn};

/// How a streaming session ended.
enum StreamExit {
    Shutdown,
    Lost(SourceError),
    Fatal(FeedError),
}

/// How a dispatch round ended.
#[derive(Debug, PartialEq, Eq)]
enum RoundOutcome {
    /// Every snapshot subscriber received, was filtered out, or timed out.
    Complete,
    /// Shutdown interrupted at least one delivery.
    Cancelled,
}

/// Pulls events from a source and fans them out to the registry.
///
/// One event is in flight at a time. The cursor only moves past an event
/// after every subscriber in that round's snapshot has been dealt with.
pub struct Dispatcher<S: EventSource> {
    config: DispatcherConfig,
    source: S,
    registry: Arc<SubscriberRegistry>,
    cursors: Arc<dyn CursorStore>,
    status: Arc<StatusBoard>,
    key: CheckpointKey,
    /// Fully dispatched events not yet persisted.
    unsaved: u64,
}

impl<S: EventSource> Dispatcher<S> {
    pub fn new(
        config: DispatcherConfig,
        source: S,
        registry: Arc<SubscriberRegistry>,
        cursors: Arc<dyn CursorStore>,
    ) -> Self {
        let key = CheckpointKey::new(source.identity(), config.consumer_id.clone());
        Self {
            config,
            source,
            registry,
            cursors,
            status: Arc::new(StatusBoard::new()),
            key,
            unsaved: 0,
        }
    }

    pub fn checkpoint_key(&self) -> &CheckpointKey {
        &self.key
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub fn status(&self) -> DispatcherStatus {
        self.status.snapshot(self.registry.active_count())
    }

    pub(crate) fn status_board(&self) -> Arc<StatusBoard> {
        Arc::clone(&self.status)
    }

    /// Run on a dedicated thread.
    pub fn spawn(self) -> Result<DispatcherHandle>
    where
        S: 'static,
    {
        let shutdown = Shutdown::new();
        let cancel = shutdown.cancellation();
        let status = self.status_board();
        let registry = Arc::clone(&self.registry);
        let name = format!("dispatch-{}", self.key.consumer);

        let mut dispatcher = self;
        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || dispatcher.run(&cancel))?;

        Ok(DispatcherHandle::new(shutdown, status, registry, thread))
    }

    /// Run the control loop on the current thread until shutdown or a
    /// fatal error.
    ///
    /// Returns `Ok(())` after a requested shutdown and an error only for
    /// failures that need an operator (an expired cursor, a corrupted
    /// checkpoint).
    pub fn run(&mut self, cancel: &Cancellation) -> Result<()> {
        let span = info_span!(
            "dispatcher",
            source = %self.key.source,
            consumer = %self.key.consumer
        );
        let _enter = span.enter();

        self.status.set_state(DispatcherState::Connecting);
        let result = self.run_loop(cancel);

        match result {
            Ok(()) => {
                self.status.set_state(DispatcherState::Stopped);
                info!("dispatcher stopped");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "dispatcher stopped on fatal error");
                self.status.set_fatal(e.to_string());
                Err(e)
            }
        }
    }

    fn run_loop(&mut self, cancel: &Cancellation) -> Result<()> {
        let Some(mut cursor) = self.load_cursor(cancel)? else {
            return Ok(());
        };
        info!(cursor = %cursor, "starting");

        let mut attempt = 0u32;
        let mut reconnecting = false;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.status.set_state(if reconnecting {
                DispatcherState::Reconnecting
            } else {
                DispatcherState::Connecting
            });

            let conn = match self.source.open(&cursor) {
                Ok(conn) => conn,
                Err(SourceError::CursorTooOld { cursor: expired }) => {
                    self.flush(&cursor);
                    return Err(FeedError::CursorTooOld { cursor: expired });
                }
                Err(e) => {
                    Counters::bump(&self.status.counters.open_failures);
                    self.status.set_error(e.to_string());
                    let delay = self.config.backoff.delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "source open failed, backing off"
                    );
                    attempt = attempt.saturating_add(1);
                    if cancel.sleep(delay) {
                        break;
                    }
                    continue;
                }
            };

            attempt = 0;
            if cursor.is_empty() {
                // Anchor "now" so a restart does not skip what happens meanwhile.
                let anchored = conn.resume_point();
                if !anchored.is_empty() {
                    cursor = anchored;
                    self.unsaved += 1;
                    self.checkpoint(&cursor);
                }
            }

            self.status.set_state(DispatcherState::Streaming);
            info!(cursor = %cursor, "streaming");

            match self.stream(conn, &mut cursor, cancel) {
                StreamExit::Shutdown => break,
                StreamExit::Fatal(e) => {
                    self.flush(&cursor);
                    return Err(e);
                }
                StreamExit::Lost(e) => {
                    Counters::bump(&self.status.counters.reconnects);
                    self.status.set_error(e.to_string());
                    warn!(error = %e, cursor = %cursor, "connection lost, reconnecting");
                    reconnecting = true;
                }
            }
        }

        self.flush(&cursor);
        Ok(())
    }

    /// Load the persisted cursor, retrying transient store failures.
    /// Returns None if shutdown was requested while retrying.
    fn load_cursor(&self, cancel: &Cancellation) -> Result<Option<ResumeCursor>> {
        let mut attempt = 0u32;
        loop {
            match self.cursors.load(&self.key) {
                Ok(Some(cursor)) => {
                    self.status.set_persisted(cursor.clone());
                    return Ok(Some(cursor));
                }
                Ok(None) => return Ok(Some(ResumeCursor::empty())),
                Err(e) if e.is_retryable() => {
                    self.status.set_error(e.to_string());
                    let delay = self.config.backoff.delay(attempt);
                    warn!(attempt, error = %e, "cursor load failed, backing off");
                    attempt = attempt.saturating_add(1);
                    if cancel.sleep(delay) {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn stream(
        &mut self,
        mut conn: S::Connection,
        cursor: &mut ResumeCursor,
        cancel: &Cancellation,
    ) -> StreamExit {
        let wait = self.config.read_wait();
        let interval = self.config.checkpoint_interval.max(1);

        loop {
            if cancel.is_cancelled() {
                return StreamExit::Shutdown;
            }

            let event = match conn.next(wait) {
                Ok(Some(event)) => event,
                Ok(None) => {
                    // Idle: persist anything a batched interval left behind.
                    if self.unsaved > 0 {
                        self.checkpoint(cursor);
                    }
                    continue;
                }
                Err(SourceError::CursorTooOld { cursor: expired }) => {
                    return StreamExit::Fatal(FeedError::CursorTooOld { cursor: expired })
                }
                Err(e) => return StreamExit::Lost(e),
            };

            if let Some(current) = cursor.position() {
                if &event.position <= current {
                    debug!(position = %event.position, "skipping already dispatched event");
                    continue;
                }
            }

            match self.dispatch(&event, cancel) {
                RoundOutcome::Complete => {
                    cursor.advance(&event.position);
                    Counters::bump(&self.status.counters.events_dispatched);
                    self.unsaved += 1;
                    if self.unsaved >= interval {
                        self.checkpoint(cursor);
                    }
                }
                RoundOutcome::Cancelled => {
                    debug!(position = %event.position, "round interrupted by shutdown");
                    return StreamExit::Shutdown;
                }
            }
        }
    }

    /// Deliver one event to every matching subscriber in a registry snapshot.
    fn dispatch(&self, event: &ChangeEvent, cancel: &Cancellation) -> RoundOutcome {
        let snapshot = self.registry.snapshot();
        let counters = &self.status.counters;

        let targets: Vec<Arc<Subscriber>> = snapshot
            .into_iter()
            .filter(|sub| match sub.matches(event) {
                Ok(true) => true,
                Ok(false) => {
                    Counters::bump(&counters.filtered_out);
                    false
                }
                Err(e) => {
                    Counters::bump(&counters.filter_errors);
                    warn!(
                        subscriber = %sub.id(),
                        error = %e,
                        "filter failed, treating as no match"
                    );
                    false
                }
            })
            .collect();

        trace!(
            position = %event.position,
            kind = %event.kind(),
            targets = targets.len(),
            "dispatching"
        );

        // Fast pass: most channels have room, so try each without waiting.
        let mut blocked = Vec::new();
        let mut outcomes = Vec::with_capacity(targets.len());
        for sub in targets {
            match sub.deliver(event, Duration::ZERO, cancel) {
                Some(DeliveryOutcome::TimedOut) => blocked.push(sub),
                Some(outcome) => outcomes.push((sub.id(), outcome)),
                None => {}
            }
        }

        // Slow pass: wait on full channels in parallel, each bounded by the timeout.
        outcomes.extend(self.deliver_blocked(&blocked, event, cancel));

        let mut cancelled = false;
        let mut drained = false;
        for (id, outcome) in outcomes {
            match outcome {
                DeliveryOutcome::Delivered => Counters::bump(&counters.deliveries),
                DeliveryOutcome::TimedOut => {
                    Counters::bump(&counters.subscriber_timeouts);
                    warn!(
                        subscriber = %id,
                        timeout_ms = self.config.delivery_timeout.as_millis() as u64,
                        "delivery timed out"
                    );
                    drained |= self.registry.mark_draining(id, DropReason::Timeout);
                }
                DeliveryOutcome::Closed => {
                    Counters::bump(&counters.subscribers_disconnected);
                    info!(subscriber = %id, "subscriber channel closed");
                    drained |= self.registry.mark_draining(id, DropReason::Disconnected);
                }
                DeliveryOutcome::Cancelled => cancelled = true,
            }
        }

        if drained {
            for id in self.registry.remove_draining() {
                debug!(subscriber = %id, "removed drained subscriber");
            }
        }

        if cancelled {
            RoundOutcome::Cancelled
        } else {
            RoundOutcome::Complete
        }
    }

    fn deliver_blocked(
        &self,
        blocked: &[Arc<Subscriber>],
        event: &ChangeEvent,
        cancel: &Cancellation,
    ) -> Vec<(SubscriberId, DeliveryOutcome)> {
        let timeout = self.config.delivery_timeout;
        let attempt = |sub: &Arc<Subscriber>| {
            sub.deliver(event, timeout, cancel)
                .map(|outcome| (sub.id(), outcome))
        };

        let workers = self.config.fanout_workers.max(1).min(blocked.len());
        if workers <= 1 {
            return blocked.iter().filter_map(attempt).collect();
        }

        let next = AtomicUsize::new(0);
        let results = Mutex::new(Vec::with_capacity(blocked.len()));
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    let Some(sub) = blocked.get(i) else {
                        break;
                    };
                    if let Some(result) = attempt(sub) {
                        results.lock().push(result);
                    }
                });
            }
        });
        results.into_inner()
    }

    /// Persist the cursor. Failures are logged and retried at the next
    /// opportunity; they never stop dispatch.
    fn checkpoint(&mut self, cursor: &ResumeCursor) {
        match self.cursors.save(&self.key, cursor) {
            Ok(()) => {
                self.unsaved = 0;
                Counters::bump(&self.status.counters.checkpoints);
                self.status.set_persisted(cursor.clone());
                trace!(cursor = %cursor, "checkpointed");
            }
            Err(e) => {
                Counters::bump(&self.status.counters.checkpoint_failures);
                self.status.set_error(e.to_string());
                warn!(cursor = %cursor, error = %e, "cursor checkpoint failed");
            }
        }
    }

    /// Persist if any completed round is not yet saved.
    fn flush(&mut self, cursor: &ResumeCursor) {
        if self.unsaved > 0 {
            self.checkpoint(cursor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCursorStore;
    use crate::policies::BackoffPolicy;
    use crate::source::MemoryFeed;
    use crate::subscriptions::{Notification, SubscriptionFilter};
    use crate::types::{Namespace, Operation, OperationKind, RecordKey, SequencePosition};
    use serde_json::json;

    fn test_config() -> DispatcherConfig {
        DispatcherConfig {
            consumer_id: "test".into(),
            delivery_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            backoff: BackoffPolicy::constant(Duration::from_millis(5)),
            fanout_workers: 4,
            checkpoint_interval: 1,
        }
    }

    fn dispatcher(feed: &MemoryFeed) -> Dispatcher<MemoryFeed> {
        Dispatcher::new(
            test_config(),
            feed.clone(),
            Arc::new(SubscriberRegistry::new()),
            Arc::new(MemoryCursorStore::new()),
        )
    }

    fn event(n: u64, operation: Operation) -> ChangeEvent {
        ChangeEvent {
            position: SequencePosition::from_u64(n),
            operation,
            namespace: Namespace::new("shop", "orders"),
            key: RecordKey::new(json!({"_id": n})),
            timestamp: crate::types::Timestamp(0),
        }
    }

    #[test]
    fn test_round_delivers_to_matching_only() {
        let feed = MemoryFeed::new("orders");
        let d = dispatcher(&feed);
        let inserts = d
            .registry()
            .subscribe(SubscriptionFilter::operations(vec![OperationKind::Insert]), 8);
        let all = d.registry().subscribe(SubscriptionFilter::all(), 8);

        let insert = event(1, Operation::Insert { document: json!({}) });
        let delete = event(2, Operation::Delete);
        assert_eq!(d.dispatch(&insert, &Cancellation::never()), RoundOutcome::Complete);
        assert_eq!(d.dispatch(&delete, &Cancellation::never()), RoundOutcome::Complete);

        assert_eq!(inserts.receiver.len(), 1);
        assert_eq!(all.receiver.len(), 2);
        let stats = d.status().stats;
        assert_eq!(stats.deliveries, 3);
        assert_eq!(stats.filtered_out, 1);
    }

    #[test]
    fn test_round_drains_full_subscriber() {
        let feed = MemoryFeed::new("orders");
        let d = dispatcher(&feed);
        let slow = d.registry().subscribe(SubscriptionFilter::all(), 1);
        let fast = d.registry().subscribe(SubscriptionFilter::all(), 8);

        d.dispatch(&event(1, Operation::Delete), &Cancellation::never());
        d.dispatch(&event(2, Operation::Delete), &Cancellation::never());

        assert_eq!(d.registry().active_count(), 1);
        assert!(d.registry().get(slow.id).is_none());
        assert_eq!(fast.receiver.len(), 2);
        assert_eq!(d.status().stats.subscriber_timeouts, 1);
    }

    #[test]
    fn test_filter_error_does_not_stop_round() {
        let feed = MemoryFeed::new("orders");
        let d = dispatcher(&feed);
        let _broken = d.registry().subscribe(
            SubscriptionFilter::all().with_predicate(|_| {
                Err(crate::subscriptions::FilterError::Predicate("bad".into()))
            }),
            8,
        );
        let ok = d.registry().subscribe(SubscriptionFilter::all(), 8);

        assert_eq!(
            d.dispatch(&event(1, Operation::Delete), &Cancellation::never()),
            RoundOutcome::Complete
        );
        assert!(matches!(ok.try_recv(), Ok(Notification::Event { .. })));
        assert_eq!(d.status().stats.filter_errors, 1);
    }

    #[test]
    fn test_cancelled_round_is_incomplete() {
        let feed = MemoryFeed::new("orders");
        let d = dispatcher(&feed);
        let _full = d.registry().subscribe(SubscriptionFilter::all(), 0);

        let shutdown = Shutdown::new();
        shutdown.trigger();
        assert_eq!(
            d.dispatch(&event(1, Operation::Delete), &shutdown.cancellation()),
            RoundOutcome::Cancelled
        );
    }

    #[test]
    fn test_closed_subscriber_is_removed() {
        let feed = MemoryFeed::new("orders");
        let d = dispatcher(&feed);
        let gone = d.registry().subscribe(SubscriptionFilter::all(), 8);
        let id = gone.id;
        drop(gone);

        d.dispatch(&event(1, Operation::Delete), &Cancellation::never());
        assert!(d.registry().get(id).is_none());
        assert_eq!(d.status().stats.subscribers_disconnected, 1);
    }
}
