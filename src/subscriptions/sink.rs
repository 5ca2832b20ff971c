//! Delivery channels.
//!
//! A [`DeliveryChannel`] accepts one event at a time within a deadline.
//! Channels must never buffer without bound: when there is no room, they
//! wait up to the timeout and then report [`DeliveryOutcome::TimedOut`].

use super::types::{DropReason, Notification};
use crate::shutdown::Cancellation;
use crate::types::ChangeEvent;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use std::time::Duration;

/// Result of a single delivery attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Accepted by the channel.
    Delivered,
    /// No room within the timeout.
    TimedOut,
    /// Receiving end is gone.
    Closed,
    /// Shutdown interrupted the attempt.
    Cancelled,
}

/// Capability to accept change events for one subscriber.
pub trait DeliveryChannel: Send + Sync {
    /// Deliver one event, waiting at most `timeout`.
    ///
    /// Implementations that block must also wake on `cancel`.
    fn deliver(&self, event: &ChangeEvent, timeout: Duration, cancel: &Cancellation)
        -> DeliveryOutcome;

    /// Called once when the subscriber leaves the registry. Best effort.
    fn close(&self, _reason: DropReason) {}
}

/// Bounded crossbeam channel feeding a [`SubscriptionHandle`](super::SubscriptionHandle).
pub struct ChannelSink {
    sender: Sender<Notification>,
}

impl ChannelSink {
    /// Create a sink and its receiving end.
    pub fn bounded(capacity: usize) -> (Self, Receiver<Notification>) {
        let (sender, receiver) = bounded(capacity);
        (Self { sender }, receiver)
    }

    pub fn from_sender(sender: Sender<Notification>) -> Self {
        Self { sender }
    }
}

impl DeliveryChannel for ChannelSink {
    fn deliver(
        &self,
        event: &ChangeEvent,
        timeout: Duration,
        cancel: &Cancellation,
    ) -> DeliveryOutcome {
        send_within(&self.sender, || Notification::Event { event: event.clone() }, timeout, cancel)
    }

    fn close(&self, reason: DropReason) {
        // Try to notify about the drop (might fail, that's ok)
        let _ = self.sender.try_send(Notification::Dropped { reason });
    }
}

/// In-process handler run on its own worker thread.
///
/// Events queue in a bounded channel in front of the handler; a handler
/// that falls behind fills the queue and then times out like any other
/// slow subscriber. If the handler panics the worker exits and further
/// deliveries report [`DeliveryOutcome::Closed`].
pub struct CallbackSink {
    sender: Mutex<Option<Sender<ChangeEvent>>>,
}

impl CallbackSink {
    /// Spawn a worker running `handler` for each delivered event.
    pub fn spawn<F>(name: &str, queue: usize, mut handler: F) -> std::io::Result<Self>
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        let (sender, receiver) = bounded::<ChangeEvent>(queue);
        std::thread::Builder::new()
            .name(format!("sink-{}", name))
            .spawn(move || {
                for event in receiver {
                    handler(event);
                }
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
        })
    }
}

impl DeliveryChannel for CallbackSink {
    fn deliver(
        &self,
        event: &ChangeEvent,
        timeout: Duration,
        cancel: &Cancellation,
    ) -> DeliveryOutcome {
        let sender = match self.sender.lock().as_ref() {
            Some(sender) => sender.clone(),
            None => return DeliveryOutcome::Closed,
        };
        send_within(&sender, || event.clone(), timeout, cancel)
    }

    fn close(&self, _reason: DropReason) {
        // Worker drains what is queued, then exits.
        self.sender.lock().take();
    }
}

/// Send on a bounded channel, racing the timeout and the cancellation.
fn send_within<T, F>(
    sender: &Sender<T>,
    message: F,
    timeout: Duration,
    cancel: &Cancellation,
) -> DeliveryOutcome
where
    F: FnOnce() -> T,
{
    select! {
        send(sender, message()) -> res => match res {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(_) => DeliveryOutcome::Closed,
        },
        recv(cancel.receiver()) -> _ => DeliveryOutcome::Cancelled,
        default(timeout) => DeliveryOutcome::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::Shutdown;
    use crate::types::{Namespace, Operation, RecordKey, SequencePosition, Timestamp};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn event(n: u64) -> ChangeEvent {
        ChangeEvent {
            position: SequencePosition::from_u64(n),
            operation: Operation::Delete,
            namespace: Namespace::new("shop", "orders"),
            key: RecordKey::new(json!(n)),
            timestamp: Timestamp(0),
        }
    }

    #[test]
    fn test_channel_sink_delivers_then_times_out() {
        let (sink, receiver) = ChannelSink::bounded(1);
        let never = Cancellation::never();

        assert_eq!(
            sink.deliver(&event(1), Duration::from_millis(10), &never),
            DeliveryOutcome::Delivered
        );
        assert_eq!(
            sink.deliver(&event(2), Duration::from_millis(10), &never),
            DeliveryOutcome::TimedOut
        );

        assert!(matches!(
            receiver.try_recv(),
            Ok(Notification::Event { event }) if event.position == SequencePosition::from_u64(1)
        ));
    }

    #[test]
    fn test_channel_sink_closed_receiver() {
        let (sink, receiver) = ChannelSink::bounded(1);
        drop(receiver);
        assert_eq!(
            sink.deliver(&event(1), Duration::from_millis(10), &Cancellation::never()),
            DeliveryOutcome::Closed
        );
    }

    #[test]
    fn test_blocked_delivery_wakes_on_shutdown() {
        let (sink, _receiver) = ChannelSink::bounded(0);
        let shutdown = Shutdown::new();
        shutdown.trigger();

        assert_eq!(
            sink.deliver(&event(1), Duration::from_secs(10), &shutdown.cancellation()),
            DeliveryOutcome::Cancelled
        );
    }

    #[test]
    fn test_callback_sink_runs_handler() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let sink = CallbackSink::spawn("test", 4, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        for n in 0..3 {
            assert_eq!(
                sink.deliver(&event(n), Duration::from_millis(100), &Cancellation::never()),
                DeliveryOutcome::Delivered
            );
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while seen.load(Ordering::SeqCst) < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        sink.close(DropReason::Unsubscribed);
        assert_eq!(
            sink.deliver(&event(4), Duration::from_millis(10), &Cancellation::never()),
            DeliveryOutcome::Closed
        );
    }
}
