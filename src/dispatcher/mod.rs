//! Change-feed dispatcher.
//!
//! The dispatcher owns the source connection and the resume cursor. It
//! moves through these states:
//!
//! ```text
//! Stopped -> Connecting -> Streaming <-> Reconnecting
//!                 |                          |
//!                 +------> Stopped (fatal) <-+
//! ```
//!
//! - `Connecting` / `Reconnecting`: open the source with the last cursor,
//!   backing off on `SourceUnavailable`. An expired cursor is fatal.
//! - `Streaming`: read, filter, fan out, checkpoint. A lost connection goes
//!   back to `Reconnecting` with the same cursor.
//!
//! # Example
//!
//! ```ignore
//! let registry = Arc::new(SubscriberRegistry::new());
//! let cursors = Arc::new(FileCursorStore::open("./cursors")?);
//! let dispatcher = Dispatcher::new(
//!     DispatcherConfig::for_consumer("mailer"),
//!     feed,
//!     Arc::clone(&registry),
//!     cursors,
//! );
//! let handle = dispatcher.spawn()?;
//!
//! let orders = registry.subscribe(SubscriptionFilter::operations(vec![OperationKind::Insert]), 256);
//! // ...
//! handle.stop()?;
//! ```

mod config;
mod handle;
mod runner;
mod status;

pub use config::DispatcherConfig;
pub use handle::DispatcherHandle;
pub use runner::Dispatcher;
pub use status::{DispatchStats, DispatcherState, DispatcherStatus};
