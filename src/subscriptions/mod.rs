//! Subscribers of the change feed.
//!
//! This module provides:
//! - Declarative filters over change events
//! - Delivery channels (bounded crossbeam channels, in-process callbacks)
//! - The registry that tracks who is subscribed
//!
//! Subscriptions support:
//! - Filtering by operation kind, namespace, document fields or a custom predicate
//! - Dynamic add/remove while the dispatcher is running
//! - Bounded buffers with slow-subscriber draining
//!
//! # Example
//!
//! ```ignore
//! let registry = Arc::new(SubscriberRegistry::new());
//!
//! // Subscribe to new orders
//! let filter = SubscriptionFilter::operations(vec![OperationKind::Insert])
//!     .with_field(FieldMatch::gt("total", 100));
//! let handle = registry.subscribe(filter, 256);
//!
//! // Receive events
//! loop {
//!     match handle.recv() {
//!         Ok(Notification::Event { event }) => println!("Got change: {:?}", event),
//!         Ok(Notification::Dropped { reason }) => break,
//!         Err(_) => break,
//!     }
//! }
//! ```

mod filter;
mod registry;
mod sink;
mod types;

pub use filter::{FieldMatch, FieldOp, FilterError, NamespacePattern, Predicate, SubscriptionFilter};
pub use registry::{Subscriber, SubscriberRegistry, DEFAULT_BUFFER_SIZE};
pub use sink::{CallbackSink, ChannelSink, DeliveryChannel, DeliveryOutcome};
pub use types::{DropReason, Notification, SubscriberId, SubscriberState, SubscriptionHandle};
