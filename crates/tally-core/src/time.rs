//! Wall-clock abstraction shared by the dispatcher, sender and scheduler.
//!
//! Retry schedules are absolute UTC instants, so every component reads time
//! through `Clock` instead of calling `Utc::now()`. Tests swap in `TestClock`
//! and move time forward explicitly.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Notify;

/// Clock abstraction for time operations.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current UTC time.
    fn now(&self) -> DateTime<Utc>;

    /// Sleeps for the specified duration of this clock's time.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Production clock backed by the system time and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually driven clock for deterministic tests.
///
/// Time only moves when `advance` or `set` is called. Pending `sleep` futures
/// wake once the clock has been moved past their deadline, so a periodic task
/// running on a `TestClock` ticks exactly when the test says so.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Microseconds since the Unix epoch
    now_micros: Arc<AtomicI64>,
    changed: Arc<Notify>,
}

impl TestClock {
    /// Creates a test clock starting at the current system time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a test clock starting at a specific instant.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now_micros: Arc::new(AtomicI64::new(start.timestamp_micros())),
            changed: Arc::new(Notify::new()),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, duration: Duration) {
        let micros = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
        self.now_micros.fetch_add(micros, Ordering::AcqRel);
        self.changed.notify_waiters();
    }

    /// Sets the clock to an absolute instant. Moving backwards is allowed.
    pub fn set(&self, instant: DateTime<Utc>) {
        self.now_micros.store(instant.timestamp_micros(), Ordering::Release);
        self.changed.notify_waiters();
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        let micros = self.now_micros.load(Ordering::Acquire);
        DateTime::from_timestamp_micros(micros).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let deadline =
            TimeDelta::from_std(duration).ok().and_then(|d| self.now().checked_add_signed(d));

        Box::pin(async move {
            let Some(deadline) = deadline else {
                return std::future::pending().await;
            };

            loop {
                // Register before checking so an advance in between is not lost
                let notified = self.changed.notified();
                if self.now() >= deadline {
                    return;
                }
                notified.await;
            }
        })
    }
}
