//! Event intake and fan-out.
//!
//! Producers call [`Dispatcher::emit`], which only pushes the event onto a
//! bounded channel and returns. A single fan-out task drains the channel and
//! turns each event into one pending attempt per matching subscription.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use tally_core::{
    Clock, CoreError, DeliveryAttempt, DeliveryStore, Event, EventId, SubscriptionId,
    SubscriptionRegistry,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    error::{DeliveryError, Result},
    payload,
    signing::sign_payload,
    stats::{bump, DeliveryCounters},
    worker_pool::{DeliveryJob, JobQueue},
};

/// Default window in which a repeated (event, subscription) dispatch is
/// suppressed.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(60);

/// Default capacity of the intake channel.
pub const DEFAULT_INTAKE_CAPACITY: usize = 1024;

/// Dispatcher settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Events buffered between `emit` and fan-out.
    pub intake_capacity: usize,
    /// Idempotency window for (event, subscription) pairs.
    pub dedup_window: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { intake_capacity: DEFAULT_INTAKE_CAPACITY, dedup_window: DEFAULT_DEDUP_WINDOW }
    }
}

/// Sliding window of recently dispatched (event, subscription) pairs.
#[derive(Debug)]
struct DedupWindow {
    window: TimeDelta,
    seen: HashMap<(EventId, SubscriptionId), DateTime<Utc>>,
}

impl DedupWindow {
    fn new(window: Duration) -> Self {
        Self { window: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX), seen: HashMap::new() }
    }

    /// Records the pair and returns true unless it was seen within the window.
    fn admit(&mut self, key: (EventId, SubscriptionId), now: DateTime<Utc>) -> bool {
        let window = self.window;
        self.seen.retain(|_, at| now.signed_duration_since(*at) < window);

        if self.seen.contains_key(&key) {
            return false;
        }
        self.seen.insert(key, now);
        true
    }
}

/// Turns events into pending delivery attempts.
pub struct Dispatcher {
    registry: Arc<dyn SubscriptionRegistry>,
    store: Arc<dyn DeliveryStore>,
    clock: Arc<dyn Clock>,
    jobs: JobQueue,
    counters: Arc<DeliveryCounters>,
    intake: mpsc::Sender<Event>,
    intake_receiver: Mutex<Option<mpsc::Receiver<Event>>>,
    dedup: Mutex<DedupWindow>,
}

impl Dispatcher {
    /// Creates a dispatcher submitting new attempts to `jobs`.
    pub fn new(
        registry: Arc<dyn SubscriptionRegistry>,
        store: Arc<dyn DeliveryStore>,
        clock: Arc<dyn Clock>,
        jobs: JobQueue,
        counters: Arc<DeliveryCounters>,
        config: DispatcherConfig,
    ) -> Self {
        let (intake, receiver) = mpsc::channel(config.intake_capacity.max(1));

        Self {
            registry,
            store,
            clock,
            jobs,
            counters,
            intake,
            intake_receiver: Mutex::new(Some(receiver)),
            dedup: Mutex::new(DedupWindow::new(config.dedup_window)),
        }
    }

    /// Accepts an event for asynchronous dispatch.
    ///
    /// Never blocks and never touches the network. A successful return means
    /// the event is queued, not that anything was delivered.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` when the intake channel is at capacity and
    /// `ShutdownRequested` once fan-out has stopped.
    pub fn emit(&self, event: Event) -> Result<EventId> {
        let event_id = event.id;

        match self.intake.try_send(event) {
            Ok(()) => {
                bump(&self.counters.events_accepted);
                Ok(event_id)
            },
            Err(TrySendError::Full(_)) => {
                bump(&self.counters.events_rejected);
                warn!(event_id = %event_id, "event intake full, event rejected");
                Err(DeliveryError::QueueFull)
            },
            Err(TrySendError::Closed(_)) => {
                bump(&self.counters.events_rejected);
                Err(DeliveryError::ShutdownRequested)
            },
        }
    }

    /// Creates attempt #1 for every matching subscription and submits it.
    ///
    /// The body is rendered once per event; each subscription gets its own
    /// signature. Failures for one subscription are logged and do not affect
    /// the others.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the registry cannot be queried and
    /// `InternalError` if the event cannot be serialized.
    pub async fn dispatch(&self, event: &Event) -> Result<Vec<DeliveryAttempt>> {
        let subscriptions = self.registry.matching(&event.event_type).await?;
        if subscriptions.is_empty() {
            debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                "no matching subscriptions"
            );
            return Ok(Vec::new());
        }

        let body = payload::render(event)?;
        let now = self.clock.now();
        let mut created = Vec::with_capacity(subscriptions.len());

        for subscription in subscriptions {
            let admitted = self
                .dedup
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .admit((event.id, subscription.id), now);
            if !admitted {
                bump(&self.counters.duplicates_suppressed);
                debug!(
                    event_id = %event.id,
                    subscription_id = %subscription.id,
                    "duplicate dispatch suppressed"
                );
                continue;
            }

            let signature = match sign_payload(subscription.secret.expose(), body.as_bytes()) {
                Ok(signature) => signature,
                Err(e) => {
                    error!(
                        subscription_id = %subscription.id,
                        error = %e,
                        "payload signing failed"
                    );
                    continue;
                },
            };

            let attempt = DeliveryAttempt::first(
                subscription.id,
                event.id,
                &event.event_type,
                body.clone(),
                signature,
                now,
            );

            match self.store.insert(attempt.clone()).await {
                Ok(()) => bump(&self.counters.attempts_created),
                Err(CoreError::ConstraintViolation(_)) => {
                    bump(&self.counters.duplicates_suppressed);
                    debug!(
                        event_id = %event.id,
                        subscription_id = %subscription.id,
                        "event already dispatched to subscription"
                    );
                    continue;
                },
                Err(e) => {
                    error!(
                        event_id = %event.id,
                        subscription_id = %subscription.id,
                        error = %e,
                        "failed to store delivery attempt"
                    );
                    continue;
                },
            }

            if self.jobs.send(DeliveryJob::from(&attempt)).await.is_err() {
                warn!(
                    attempt_id = %attempt.id,
                    "worker pool closed, attempt left pending for recovery"
                );
            }

            created.push(attempt);
        }

        debug!(event_id = %event.id, attempts = created.len(), "event dispatched");
        Ok(created)
    }

    /// Drains the intake channel until cancelled.
    ///
    /// Only one fan-out loop may run per dispatcher.
    ///
    /// # Errors
    ///
    /// Returns `InternalError` if the loop was already started.
    pub async fn run(self: Arc<Self>, cancellation_token: CancellationToken) -> Result<()> {
        let mut receiver = self
            .intake_receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| DeliveryError::internal("dispatcher fan-out already started"))?;

        info!("dispatcher fan-out started");

        loop {
            let event = tokio::select! {
                biased;
                () = cancellation_token.cancelled() => break,
                event = receiver.recv() => event,
            };

            let Some(event) = event else { break };

            let span = info_span!("dispatch", event_id = %event.id, event_type = %event.event_type);
            if let Err(e) = self.dispatch(&event).instrument(span).await {
                error!(event_id = %event.id, error = %e, "event dispatch failed");
            }
        }

        // Dropping the receiver makes further emits fail with ShutdownRequested
        receiver.close();
        drop(receiver);

        info!("dispatcher fan-out stopped");
        Ok(())
    }
}
