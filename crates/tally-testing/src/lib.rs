//! Test infrastructure for Tally webhook delivery.
//!
//! Provides fixture builders, an in-memory [`TestEnv`] running a real
//! delivery engine against a wiremock subscriber, a manually driven clock
//! so retry schedules can be walked through deterministically, and a
//! migrated Postgres connection for storage tests.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod database;
pub mod env;
pub mod fixtures;

pub use database::TestDatabase;
pub use env::{wait_until, TestEnv, TestEnvBuilder, DEFAULT_WAIT};
pub use fixtures::{EventBuilder, SubscriptionBuilder, DEFAULT_TEST_SECRET};
pub use tally_core::{Clock, TestClock};

/// Installs a test-writer tracing subscriber once per process.
///
/// Filter comes from `RUST_LOG`, defaulting to errors only.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
        )
        .with_test_writer()
        .try_init();
}
