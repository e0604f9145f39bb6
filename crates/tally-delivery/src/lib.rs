//! Webhook delivery for Tally: dispatch, signed HTTP delivery and retries.
//!
//! Producers hand domain events to [`DeliveryEngine::emit`] and move on. The
//! engine fans each event out to matching subscriptions, delivers one signed
//! HTTP request per attempt from a bounded worker pool, and retries failures
//! with exponential backoff until the subscription's attempt budget runs out.
//!
//! # Architecture
//!
//! 1. **Dispatcher** - Non-blocking intake, fan-out to matching subscriptions
//! 2. **Worker Pool** - Bounded concurrency for outbound HTTP calls
//! 3. **Sender** - One signed request per attempt, outcome recorded
//! 4. **Retry Scheduler** - Periodic sweep turning due retries into new
//!    attempts through an atomic claim
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tally_core::{
//!     InMemoryDeliveryStore, InMemorySubscriptionRegistry, RealClock, RegistryConfig,
//! };
//! use tally_delivery::{DeliveryEngine, DeliveryError, EngineConfig};
//!
//! # async fn example() -> std::result::Result<(), DeliveryError> {
//! let clock = Arc::new(RealClock::new());
//! let registry =
//!     Arc::new(InMemorySubscriptionRegistry::new(clock.clone(), RegistryConfig::default()));
//! let store = Arc::new(InMemoryDeliveryStore::new());
//!
//! let mut engine = DeliveryEngine::new(registry, store, clock, EngineConfig::default())?;
//! engine.start().await?;
//! // engine.emit(event)?;
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod payload;
pub mod retry;
pub mod sender;
pub mod signing;
pub mod stats;
pub mod worker_pool;

pub use client::{ClientConfig, DeliveryClient};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use engine::{DeliveryEngine, EngineConfig};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use retry::{backoff_delay, RetryDecision, RetryScheduler, SchedulerConfig, SweepReport};
pub use sender::{SendOutcome, Sender, SenderConfig};
pub use signing::{sign_payload, verify_signature};
pub use stats::EngineStats;
pub use worker_pool::{DeliveryJob, WorkerPool};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default capacity of the job queue feeding the workers.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
