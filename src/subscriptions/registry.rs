//! Subscriber registry.

use crate::error::{FeedError, Result};
use crate::shutdown::Cancellation;
use crate::types::ChangeEvent;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::filter::{FilterError, SubscriptionFilter};
use super::sink::{ChannelSink, DeliveryChannel, DeliveryOutcome};
use super::types::{DropReason, SubscriberId, SubscriberState, SubscriptionHandle};

/// Default buffer for channel-backed subscriptions.
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

/// A registered subscriber.
///
/// Owned by the registry; the dispatcher only borrows an `Arc` for the
/// duration of one round.
pub struct Subscriber {
    id: SubscriberId,
    filter: SubscriptionFilter,
    channel: Arc<dyn DeliveryChannel>,
    state: AtomicU8,
    /// Set when the subscriber starts draining.
    drain_reason: Mutex<Option<DropReason>>,
}

impl Subscriber {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn filter(&self) -> &SubscriptionFilter {
        &self.filter
    }

    pub fn state(&self) -> SubscriberState {
        SubscriberState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == SubscriberState::Active
    }

    /// Evaluate this subscriber's filter.
    pub fn matches(&self, event: &ChangeEvent) -> std::result::Result<bool, FilterError> {
        self.filter.evaluate(event)
    }

    /// Attempt delivery. Subscribers that left the registry are skipped.
    pub fn deliver(
        &self,
        event: &ChangeEvent,
        timeout: Duration,
        cancel: &Cancellation,
    ) -> Option<DeliveryOutcome> {
        if !self.is_active() {
            return None;
        }
        Some(self.channel.deliver(event, timeout, cancel))
    }

    fn transition(&self, from: SubscriberState, to: SubscriberState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn retire(&self, reason: DropReason) {
        self.state
            .store(SubscriberState::Removed.as_u8(), Ordering::Release);
        self.channel.close(reason);
    }
}

/// Tracks active subscribers.
///
/// Membership changes take the write lock; snapshots take the read lock,
/// so a snapshot never observes a half-applied register or unregister.
pub struct SubscriberRegistry {
    /// Subscribers by ID (ordered, so snapshots are stable).
    subscribers: RwLock<BTreeMap<SubscriberId, Arc<Subscriber>>>,
    /// Counter for generating subscriber IDs.
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber with its own delivery channel.
    pub fn register<C>(&self, filter: SubscriptionFilter, channel: C) -> SubscriberId
    where
        C: DeliveryChannel + 'static,
    {
        self.register_shared(filter, Arc::new(channel))
    }

    /// Register a subscriber with a shared delivery channel.
    pub fn register_shared(
        &self,
        filter: SubscriptionFilter,
        channel: Arc<dyn DeliveryChannel>,
    ) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let subscriber = Arc::new(Subscriber {
            id,
            filter,
            channel,
            state: AtomicU8::new(SubscriberState::Active.as_u8()),
            drain_reason: Mutex::new(None),
        });

        self.subscribers.write().insert(id, subscriber);
        debug!(subscriber = %id, "registered");
        id
    }

    /// Register a channel-backed subscriber and return its receiving end.
    pub fn subscribe(&self, filter: SubscriptionFilter, buffer_size: usize) -> SubscriptionHandle {
        let (sink, receiver) = ChannelSink::bounded(buffer_size);
        let id = self.register(filter, sink);
        SubscriptionHandle { id, receiver }
    }

    /// Unregister and clean up.
    ///
    /// Safe while a round is in flight: a delivery already started completes;
    /// one not yet started is skipped.
    pub fn unregister(&self, id: SubscriberId) -> Result<()> {
        let removed = self.subscribers.write().remove(&id);
        match removed {
            Some(sub) => {
                sub.retire(DropReason::Unsubscribed);
                debug!(subscriber = %id, "unregistered");
                Ok(())
            }
            None => Err(FeedError::SubscriberNotFound(id)),
        }
    }

    /// Consistent view of the active subscribers, ordered by ID.
    pub fn snapshot(&self) -> Vec<Arc<Subscriber>> {
        self.subscribers
            .read()
            .values()
            .filter(|sub| sub.is_active())
            .cloned()
            .collect()
    }

    pub fn get(&self, id: SubscriberId) -> Option<Arc<Subscriber>> {
        self.subscribers.read().get(&id).cloned()
    }

    /// Number of active subscribers.
    pub fn active_count(&self) -> usize {
        self.subscribers
            .read()
            .values()
            .filter(|sub| sub.is_active())
            .count()
    }

    /// Number of registered subscribers, including draining ones.
    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move an active subscriber to draining. Returns false if it was not active.
    pub fn mark_draining(&self, id: SubscriberId, reason: DropReason) -> bool {
        let Some(sub) = self.get(id) else {
            return false;
        };
        if sub.transition(SubscriberState::Active, SubscriberState::Draining) {
            *sub.drain_reason.lock() = Some(reason);
            info!(subscriber = %id, ?reason, "subscriber draining");
            true
        } else {
            false
        }
    }

    /// Remove every draining subscriber. Returns the removed IDs.
    pub fn remove_draining(&self) -> Vec<SubscriberId> {
        let drained: Vec<Arc<Subscriber>> = {
            let mut subs = self.subscribers.write();
            let ids: Vec<SubscriberId> = subs
                .values()
                .filter(|sub| sub.state() == SubscriberState::Draining)
                .map(|sub| sub.id)
                .collect();
            ids.iter().filter_map(|id| subs.remove(id)).collect()
        };

        drained
            .into_iter()
            .map(|sub| {
                let reason = sub.drain_reason.lock().unwrap_or(DropReason::Timeout);
                sub.retire(reason);
                sub.id
            })
            .collect()
    }

    /// Remove everyone (used on dispatcher teardown by embedders).
    pub fn clear(&self) {
        let all: Vec<Arc<Subscriber>> = std::mem::take(&mut *self.subscribers.write())
            .into_values()
            .collect();
        for sub in all {
            sub.retire(DropReason::Unsubscribed);
        }
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::types::Notification;
    use crate::types::{Namespace, Operation, OperationKind, RecordKey, SequencePosition, Timestamp};
    use serde_json::json;

    fn make_test_event(operation: Operation) -> ChangeEvent {
        ChangeEvent {
            position: SequencePosition::from_u64(1),
            operation,
            namespace: Namespace::new("shop", "orders"),
            key: RecordKey::new(json!({"_id": 1})),
            timestamp: Timestamp::now(),
        }
    }

    #[test]
    fn test_register_unregister() {
        let registry = SubscriberRegistry::new();

        let handle = registry.subscribe(SubscriptionFilter::all(), 8);
        assert_eq!(registry.active_count(), 1);

        registry.unregister(handle.id).unwrap();
        assert_eq!(registry.active_count(), 0);

        match handle.try_recv() {
            Ok(Notification::Dropped { reason }) => assert_eq!(reason, DropReason::Unsubscribed),
            other => panic!("Expected Dropped, got {:?}", other),
        }
    }

    #[test]
    fn test_unregister_unknown() {
        let registry = SubscriberRegistry::new();
        assert!(matches!(
            registry.unregister(SubscriberId(99)),
            Err(FeedError::SubscriberNotFound(SubscriberId(99)))
        ));
    }

    #[test]
    fn test_snapshot_is_detached_from_later_changes() {
        let registry = SubscriberRegistry::new();
        let a = registry.subscribe(SubscriptionFilter::all(), 8);
        let b = registry.subscribe(SubscriptionFilter::all(), 8);

        let snapshot = registry.snapshot();
        registry.unregister(a.id).unwrap();
        let _c = registry.subscribe(SubscriptionFilter::all(), 8);

        let ids: Vec<_> = snapshot.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![a.id, b.id]);

        // The removed subscriber is skipped when the round reaches it.
        let event = make_test_event(Operation::Delete);
        assert_eq!(
            snapshot[0].deliver(&event, Duration::from_millis(10), &Cancellation::never()),
            None
        );
        assert_eq!(
            snapshot[1].deliver(&event, Duration::from_millis(10), &Cancellation::never()),
            Some(DeliveryOutcome::Delivered)
        );
    }

    #[test]
    fn test_draining_is_excluded_and_removed() {
        let registry = SubscriberRegistry::new();
        let slow = registry.subscribe(SubscriptionFilter::all(), 1);
        let fast = registry.subscribe(SubscriptionFilter::all(), 8);

        assert!(registry.mark_draining(slow.id, DropReason::Timeout));
        assert!(!registry.mark_draining(slow.id, DropReason::Timeout));
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.snapshot().len(), 1);

        let removed = registry.remove_draining();
        assert_eq!(removed, vec![slow.id]);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(fast.id).is_some());

        match slow.try_recv() {
            Ok(Notification::Dropped { reason }) => assert_eq!(reason, DropReason::Timeout),
            other => panic!("Expected Dropped, got {:?}", other),
        }
    }

    #[test]
    fn test_matches_uses_filter() {
        let registry = SubscriberRegistry::new();
        let handle = registry.subscribe(
            SubscriptionFilter::operations(vec![OperationKind::Insert]),
            8,
        );
        let sub = registry.get(handle.id).unwrap();

        let insert = make_test_event(Operation::Insert {
            document: json!({"total": 1}),
        });
        assert!(sub.matches(&insert).unwrap());
        assert!(!sub.matches(&make_test_event(Operation::Delete)).unwrap());
    }

    #[test]
    fn test_clear_retires_everyone() {
        let registry = SubscriberRegistry::new();
        let handle = registry.subscribe(SubscriptionFilter::all(), 8);
        registry.clear();
        assert!(registry.is_empty());
        assert!(matches!(
            handle.try_recv(),
            Ok(Notification::Dropped {
                reason: DropReason::Unsubscribed
            })
        ));
    }
}
