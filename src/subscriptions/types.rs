//! Subscriber-facing types.

use crate::types::ChangeEvent;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Lifecycle of a subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberState {
    /// Receives events.
    Active,
    /// Failed to keep up; will be removed after the current round.
    Draining,
    /// Gone from the registry.
    Removed,
}

impl SubscriberState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            SubscriberState::Active => 0,
            SubscriberState::Draining => 1,
            SubscriberState::Removed => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => SubscriberState::Active,
            1 => SubscriberState::Draining,
            _ => SubscriberState::Removed,
        }
    }
}

/// Why a subscriber was dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Explicitly unregistered.
    Unsubscribed,
    /// Delivery exceeded the timeout (slow consumer).
    Timeout,
    /// Receiving end went away.
    Disconnected,
}

/// What a channel-backed subscriber receives.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A change event.
    Event { event: ChangeEvent },
    /// The subscriber was removed; no further events follow.
    Dropped { reason: DropReason },
}

/// Receiving end of a channel-backed subscription.
pub struct SubscriptionHandle {
    pub id: SubscriberId,
    /// Channel to receive notifications.
    pub receiver: crossbeam_channel::Receiver<Notification>,
}

impl SubscriptionHandle {
    /// Receive the next notification (blocking).
    pub fn recv(&self) -> Result<Notification, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a notification (non-blocking).
    pub fn try_recv(&self) -> Result<Notification, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<Notification, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Receive the next change event, skipping nothing. Returns None on
    /// timeout, disconnect or a drop notice.
    pub fn next_event(&self, timeout: std::time::Duration) -> Option<ChangeEvent> {
        match self.receiver.recv_timeout(timeout) {
            Ok(Notification::Event { event }) => Some(event),
            _ => None,
        }
    }
}
