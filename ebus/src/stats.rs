use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// Running counters of one bus client.
#[derive(Debug, Default)]
pub struct Stats {
    pub(crate) published: AtomicU64,
    pub(crate) publish_failures: AtomicU64,
    pub(crate) publish_exhausted: AtomicU64,
    pub(crate) consumed: AtomicU64,
    pub(crate) dropped: AtomicU64,
    pub(crate) handler_errors: AtomicU64,
    pub(crate) faults: AtomicU64,
    last_fault: Mutex<Option<Fault>>,
}

/// The delivery a handler panicked on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fault {
    pub topic: String,
    /// Message id, `-` when the delivery carried none.
    pub id: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Publish calls that reached the broker.
    pub published: u64,
    /// Failed publish attempts, retries included.
    pub publish_failures: u64,
    /// Publish calls that ran out of attempts.
    pub publish_exhausted: u64,
    /// Deliveries a handler accepted.
    pub consumed: u64,
    /// Deliveries without a handler or with an undecryptable body.
    pub dropped: u64,
    pub handler_errors: u64,
    /// Handler panics that restarted the consumer loop.
    pub faults: u64,
}

impl Stats {
    #[inline]
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fault(&self, fault: Fault) {
        Self::incr(&self.faults);
        *self.last_fault.lock() = Some(fault);
    }

    #[inline]
    pub fn last_fault(&self) -> Option<Fault> {
        self.last_fault.lock().clone()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            publish_exhausted: self.publish_exhausted.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }
}
