// Scheduler module
// Coalescing request queue between navigation calls and the background refill worker.
// The channel holds at most one request: while one is waiting, further requests are
// dropped, so a burst of advances never queues up more than one extra refill pass.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Why a refill pass was requested. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefillReason {
    /// First fill after the cache was built.
    Initial,
    /// The consumer advanced (or polled while buffering).
    Advance,
    /// An in-window forward skip drained the forward queue.
    Skip,
    /// The consumer asked for a check without moving.
    Poll,
}

#[derive(Debug, Clone, Copy)]
pub struct RefillRequest {
    pub reason: RefillReason,
}

/// Sending half of the refill queue.
pub struct RefillScheduler {
    sender: mpsc::Sender<RefillRequest>,
    accepted: AtomicU64,
    coalesced: AtomicU64,
}

impl RefillScheduler {
    /// Create the scheduler and the receiver the worker loop drains.
    pub fn new() -> (Self, mpsc::Receiver<RefillRequest>) {
        let (sender, receiver) = mpsc::channel(1);
        let scheduler = Self {
            sender,
            accepted: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        };
        (scheduler, receiver)
    }

    /// Queue a refill check without blocking.
    ///
    /// Returns false when the request was folded into one already waiting, or when the
    /// worker is gone.
    pub fn request(&self, reason: RefillReason) -> bool {
        match self.sender.try_send(RefillRequest { reason }) {
            Ok(()) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(?reason, "refill already queued, coalescing request");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(?reason, "refill worker stopped, dropping request");
                false
            }
        }
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }
}
