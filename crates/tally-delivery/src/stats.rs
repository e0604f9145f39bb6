//! Engine-wide delivery counters.
//!
//! Counters are updated from the producer path (`emit` is synchronous) as
//! well as from workers and the sweeper, so they are plain atomics rather
//! than a lock-guarded struct.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

/// Point-in-time view of engine activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Events accepted by `emit`.
    pub events_accepted: u64,
    /// Events rejected by `emit` because of backpressure or shutdown.
    pub events_rejected: u64,
    /// Attempts inserted by the dispatcher or the scheduler.
    pub attempts_created: u64,
    /// Dispatches skipped by the idempotency window.
    pub duplicates_suppressed: u64,
    /// Attempts that ended in a 2xx response.
    pub deliveries_succeeded: u64,
    /// Attempts that failed for any reason.
    pub deliveries_failed: u64,
    /// Failed attempts moved to retrying.
    pub retries_scheduled: u64,
    /// Attempts moved to abandoned.
    pub attempts_abandoned: u64,
    /// HTTP calls currently running.
    pub in_flight: usize,
    /// Worker tasks currently alive.
    pub active_workers: usize,
}

/// Shared atomic counters behind [`EngineStats`].
#[derive(Debug, Default)]
pub struct DeliveryCounters {
    pub(crate) events_accepted: AtomicU64,
    pub(crate) events_rejected: AtomicU64,
    pub(crate) attempts_created: AtomicU64,
    pub(crate) duplicates_suppressed: AtomicU64,
    pub(crate) deliveries_succeeded: AtomicU64,
    pub(crate) deliveries_failed: AtomicU64,
    pub(crate) retries_scheduled: AtomicU64,
    pub(crate) attempts_abandoned: AtomicU64,
    pub(crate) in_flight: AtomicUsize,
    pub(crate) active_workers: AtomicUsize,
}

impl DeliveryCounters {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> EngineStats {
        EngineStats {
            events_accepted: self.events_accepted.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
            attempts_created: self.attempts_created.load(Ordering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
            deliveries_succeeded: self.deliveries_succeeded.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            attempts_abandoned: self.attempts_abandoned.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Increments a gauge for the lifetime of the guard.
pub(crate) struct GaugeGuard<'a>(&'a AtomicUsize);

impl<'a> GaugeGuard<'a> {
    pub(crate) fn enter(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self(gauge)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let counters = DeliveryCounters::new();
        bump(&counters.events_accepted);
        bump(&counters.events_accepted);
        bump(&counters.attempts_abandoned);

        let stats = counters.snapshot();
        assert_eq!(stats.events_accepted, 2);
        assert_eq!(stats.attempts_abandoned, 1);
        assert_eq!(stats.deliveries_succeeded, 0);
    }

    #[test]
    fn gauge_guard_decrements_on_drop() {
        let counters = DeliveryCounters::new();
        {
            let _outer = GaugeGuard::enter(&counters.in_flight);
            let _inner = GaugeGuard::enter(&counters.in_flight);
            assert_eq!(counters.snapshot().in_flight, 2);
        }
        assert_eq!(counters.snapshot().in_flight, 0);
    }
}
