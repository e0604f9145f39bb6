//! Core domain model for Tally webhook delivery.
//!
//! Defines subscriptions, domain events, delivery attempts and the state
//! machine attempts move through, plus the two storage seams the delivery
//! engine depends on:
//!
//! - [`SubscriptionRegistry`]: which subscriptions want which events
//! - [`DeliveryStore`]: durable, queryable history of every attempt
//!
//! Both have an in-memory implementation and a PostgreSQL implementation in
//! [`storage`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod attempt;
pub mod error;
pub mod models;
pub mod registry;
pub mod storage;
pub mod store;
pub mod time;

pub use attempt::{
    AbandonReason, AttemptQuery, AttemptResult, AttemptState, AttemptStatus, DeliveryAttempt,
    DeliveryStats,
};
pub use error::{CoreError, Result};
pub use models::{
    Actor, AttemptId, Entity, Event, EventId, EventPattern, HttpMethod, NewSubscription,
    SigningSecret, Subscription, SubscriptionId, SubscriptionUpdate,
};
pub use registry::{InMemorySubscriptionRegistry, RegistryConfig, SubscriptionRegistry};
pub use store::{DeliveryStore, InMemoryDeliveryStore};
pub use time::{Clock, RealClock, TestClock};
