//! Shutdown signalling.
//!
//! A [`Shutdown`] owns the sending half of a zero-capacity channel that
//! never carries a message. Triggering drops the sender, which disconnects
//! every [`Cancellation`] at once. Anything blocked in a crossbeam `select!`
//! on the cancellation receiver wakes immediately.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::time::Duration;

/// Trigger side of a shutdown signal.
pub struct Shutdown {
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
        }
    }

    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        self.sender.lock().take();
    }

    pub fn is_triggered(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// A cancellation observer tied to this signal.
    pub fn cancellation(&self) -> Cancellation {
        Cancellation {
            receiver: self.receiver.clone(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a shutdown signal. Cheap to clone.
#[derive(Clone)]
pub struct Cancellation {
    receiver: Receiver<()>,
}

impl Cancellation {
    /// A cancellation that never fires.
    pub fn never() -> Self {
        Self {
            receiver: crossbeam_channel::never(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.receiver.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for `duration` or until cancelled. Returns true if cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        match self.receiver.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => true,
            // Nothing is ever sent; treat a message like a disconnect.
            Ok(()) => true,
        }
    }

    /// Receiver to use in `crossbeam_channel::select!`; becomes ready
    /// (disconnected) once shutdown is triggered.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.receiver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_trigger_wakes_sleepers() {
        let shutdown = Shutdown::new();
        let cancel = shutdown.cancellation();
        assert!(!cancel.is_cancelled());

        let waiter = std::thread::spawn(move || {
            let start = Instant::now();
            let cancelled = cancel.sleep(Duration::from_secs(10));
            (cancelled, start.elapsed())
        });

        std::thread::sleep(Duration::from_millis(20));
        shutdown.trigger();

        let (cancelled, elapsed) = waiter.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(5));
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn test_sleep_times_out_without_trigger() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.cancellation().sleep(Duration::from_millis(5)));
        assert!(!Cancellation::never().sleep(Duration::from_millis(5)));
    }
}
