//! # Change Feed
//!
//! A resumable change-feed dispatcher. It reads an ordered stream of
//! mutation events from a backing store and fans each event out to a
//! dynamic set of subscribers, at least once and in source order per key.
//!
//! ## Core Concepts
//!
//! - **Sources**: Resumable, interruptible readers of a store's change feed
//! - **Cursors**: Opaque positions persisted per (source, consumer)
//! - **Subscriptions**: Filters plus bounded delivery channels, added and
//!   removed at any time
//! - **Dispatcher**: The control loop that reads, filters, fans out,
//!   checkpoints and reconnects
//!
//! ## Example
//!
//! ```ignore
//! use changefeed::{
//!     Dispatcher, DispatcherConfig, FileCursorStore, MemoryFeed, OperationKind,
//!     SubscriberRegistry, SubscriptionFilter,
//! };
//!
//! let feed = MemoryFeed::new("shop");
//! let registry = Arc::new(SubscriberRegistry::new());
//! let cursors = Arc::new(FileCursorStore::open("./cursors")?);
//!
//! let handle = Dispatcher::new(
//!     DispatcherConfig::for_consumer("search-indexer"),
//!     feed.clone(),
//!     Arc::clone(&registry),
//!     cursors,
//! )
//! .spawn()?;
//!
//! let inserts = registry.subscribe(SubscriptionFilter::operations(vec![OperationKind::Insert]), 256);
//! while let Some(event) = inserts.next_event(Duration::from_secs(1)) {
//!     println!("{} {}", event.namespace, event.key);
//! }
//!
//! handle.stop()?;
//! ```

pub mod checkpoint;
pub mod dispatcher;
pub mod error;
pub mod policies;
pub mod shutdown;
pub mod source;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use checkpoint::{CursorStore, FileCursorStore, MemoryCursorStore};
pub use dispatcher::{
    DispatchStats, Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherState,
    DispatcherStatus,
};
pub use error::{FeedError, Result};
pub use policies::{BackoffPolicy, JitterPolicy};
pub use shutdown::{Cancellation, Shutdown};
pub use source::{
    decode_change_document, EventSource, MemoryConnection, MemoryFeed, SourceConnection,
    SourceError,
};
pub use subscriptions::{
    CallbackSink, ChannelSink, DeliveryChannel, DeliveryOutcome, DropReason, FieldMatch, FieldOp,
    FilterError, NamespacePattern, Notification, Predicate, Subscriber, SubscriberId,
    SubscriberRegistry, SubscriberState, SubscriptionFilter, SubscriptionHandle,
    DEFAULT_BUFFER_SIZE,
};
pub use types::*;
