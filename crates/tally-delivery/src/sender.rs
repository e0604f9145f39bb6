//! Executes one HTTP call per pending attempt.
//!
//! The sender loads the attempt and its subscription, runs pre-flight checks,
//! issues the signed request and records the outcome. Failures are handed to
//! the retry scheduler; the sender never retries by itself.
//!
//! A job submitted twice, for example by pending recovery racing the
//! dispatcher, is sent once: the second `send` for an attempt already in
//! flight on this sender returns without touching the network. Two engines
//! sharing one store are not coordinated this way; the store's
//! compare-and-set only rejects the second outcome.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tally_core::{
    attempt::truncate_snippet, registry::validate_url, AbandonReason, AttemptId, AttemptResult,
    AttemptState, AttemptStatus, Clock, CoreError, DeliveryAttempt, DeliveryStore, Subscription,
    SubscriptionRegistry,
};
use tracing::{debug, error, info};

use crate::{
    client::{DeliveryClient, DeliveryRequest},
    error::{DeliveryError, Result},
    retry::RetryScheduler,
    stats::{bump, DeliveryCounters},
    worker_pool::{DeliveryJob, JobHandler},
};

/// Default request body limit: 10 MiB.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Pre-flight settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderConfig {
    /// Bodies larger than this are never sent.
    pub max_payload_bytes: usize,
    /// Accept plain `http://` targets.
    pub allow_http: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self { max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES, allow_http: false }
    }
}

/// Final state of an attempt after [`Sender::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SendOutcome {
    /// Subscriber answered 2xx.
    Delivered {
        /// Response status
        status_code: u16,
    },
    /// Failed; attempt N+1 becomes due at `next_retry_at`.
    Retrying {
        /// When the retry becomes due
        next_retry_at: DateTime<Utc>,
    },
    /// Failed for good.
    Abandoned {
        /// Why the lineage ended
        reason: AbandonReason,
    },
    /// Attempt was not pending; nothing was sent.
    Skipped {
        /// Status found in the store
        status: AttemptStatus,
    },
    /// Another call is already sending this attempt; nothing was sent.
    AlreadyInFlight,
}

/// Attempt ids with a send in progress.
#[derive(Debug, Default)]
struct InFlight(Mutex<HashSet<AttemptId>>);

impl InFlight {
    /// Marks `id` as in flight until the guard drops. `None` if it already is.
    fn enter(&self, id: AttemptId) -> Option<InFlightGuard<'_>> {
        let mut ids = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        ids.insert(id).then_some(InFlightGuard { in_flight: self, id })
    }
}

struct InFlightGuard<'a> {
    in_flight: &'a InFlight,
    id: AttemptId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.0.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.id);
    }
}

/// Delivers pending attempts.
pub struct Sender {
    store: Arc<dyn DeliveryStore>,
    registry: Arc<dyn SubscriptionRegistry>,
    client: DeliveryClient,
    scheduler: Arc<RetryScheduler>,
    clock: Arc<dyn Clock>,
    counters: Arc<DeliveryCounters>,
    config: SenderConfig,
    in_flight: InFlight,
}

impl Sender {
    /// Creates a sender.
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        registry: Arc<dyn SubscriptionRegistry>,
        client: DeliveryClient,
        scheduler: Arc<RetryScheduler>,
        clock: Arc<dyn Clock>,
        counters: Arc<DeliveryCounters>,
        config: SenderConfig,
    ) -> Self {
        Self {
            store,
            registry,
            client,
            scheduler,
            clock,
            counters,
            config,
            in_flight: InFlight::default(),
        }
    }

    /// Executes a pending attempt.
    ///
    /// Attempts that are no longer pending, or already being sent by another
    /// call, are skipped, which makes re-submitted jobs harmless.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the attempt does not exist or its outcome
    /// cannot be recorded. Subscriber failures are not errors; they are
    /// reported through the returned outcome.
    pub async fn send(&self, attempt_id: AttemptId) -> Result<SendOutcome> {
        let Some(_in_flight) = self.in_flight.enter(attempt_id) else {
            debug!(attempt_id = %attempt_id, "attempt already in flight, skipping");
            return Ok(SendOutcome::AlreadyInFlight);
        };

        let attempt = self
            .store
            .find(attempt_id)
            .await?
            .ok_or_else(|| CoreError::not_found("delivery attempt", attempt_id))?;

        if attempt.status() != AttemptStatus::Pending {
            debug!(
                attempt_id = %attempt.id,
                status = %attempt.status(),
                "attempt not pending, skipping"
            );
            return Ok(SendOutcome::Skipped { status: attempt.status() });
        }

        let subscription = self.registry.find(attempt.subscription_id).await?;

        let (result, error) = match self.preflight(&attempt, subscription.as_ref()) {
            Err(error) => (AttemptResult::new(self.clock.now()), error),
            Ok(subscription) => {
                let attempted_at = self.clock.now();
                let request = build_request(&attempt, subscription);

                match self.client.deliver(request).await {
                    Ok(response) if response.is_success => {
                        let result = AttemptResult::new(attempted_at)
                            .with_response(response.status_code, &response.body);
                        self.store.record_success(attempt.id, result).await?;
                        bump(&self.counters.deliveries_succeeded);

                        info!(
                            attempt_id = %attempt.id,
                            subscription_id = %attempt.subscription_id,
                            attempt_number = attempt.attempt_number,
                            status_code = response.status_code,
                            duration_ms = response.duration.as_millis(),
                            "webhook delivered"
                        );
                        return Ok(SendOutcome::Delivered { status_code: response.status_code });
                    },
                    Ok(response) => {
                        let result = AttemptResult::new(attempted_at)
                            .with_response(response.status_code, &response.body);
                        let error = DeliveryError::application(
                            response.status_code,
                            truncate_snippet(&response.body),
                        );
                        (result, error)
                    },
                    Err(error) => (AttemptResult::new(attempted_at), error),
                }
            },
        };

        let failed = self.store.record_failure(attempt.id, result, error.to_string()).await?;
        bump(&self.counters.deliveries_failed);

        debug!(
            attempt_id = %attempt.id,
            attempt_number = attempt.attempt_number,
            status_code = ?error.status_code(),
            error_category = %error.category(),
            "delivery attempt failed"
        );

        let resolved = self.scheduler.handle_failure(&failed, subscription.as_ref(), &error).await?;

        match resolved.state {
            AttemptState::Retrying { next_retry_at } => Ok(SendOutcome::Retrying { next_retry_at }),
            AttemptState::Abandoned { reason } => Ok(SendOutcome::Abandoned { reason }),
            other => Err(DeliveryError::internal(format!(
                "failed attempt resolved to unexpected state {}",
                other.status()
            ))),
        }
    }

    /// Checks everything that would make the request pointless to send.
    ///
    /// Runs right before the request, after the job waited in the queue, so
    /// a subscription disabled in the meantime receives nothing.
    fn preflight<'a>(
        &self,
        attempt: &DeliveryAttempt,
        subscription: Option<&'a Subscription>,
    ) -> Result<&'a Subscription> {
        let subscription = subscription.ok_or_else(|| {
            DeliveryError::configuration(format!(
                "subscription {} no longer exists",
                attempt.subscription_id
            ))
        })?;

        if !subscription.active {
            return Err(DeliveryError::configuration(format!(
                "subscription {} is disabled",
                subscription.id
            )));
        }

        if attempt.payload.len() > self.config.max_payload_bytes {
            return Err(DeliveryError::configuration(format!(
                "payload of {} bytes exceeds the {} byte limit",
                attempt.payload.len(),
                self.config.max_payload_bytes
            )));
        }

        validate_url(&subscription.url, self.config.allow_http)
            .map_err(|e| DeliveryError::configuration(e.to_string()))?;

        if subscription.secret.is_blank() || attempt.signature.is_empty() {
            return Err(DeliveryError::configuration("signing secret is missing"));
        }

        Ok(subscription)
    }
}

fn build_request(attempt: &DeliveryAttempt, subscription: &Subscription) -> DeliveryRequest {
    DeliveryRequest {
        attempt_id: attempt.id,
        event_id: attempt.event_id,
        attempt_number: attempt.attempt_number,
        url: subscription.url.clone(),
        method: subscription.method,
        headers: vec![
            ("Content-Type", "application/json".to_string()),
            ("X-Webhook-Event", attempt.event_type.clone()),
            ("X-Webhook-ID", subscription.id.to_string()),
            ("X-Webhook-Signature", attempt.signature.clone()),
            ("X-Webhook-Delivery", attempt.id.to_string()),
            ("X-Webhook-Attempt", attempt.attempt_number.to_string()),
        ],
        body: Bytes::from(attempt.payload.clone()),
        timeout: Duration::from_secs(u64::from(subscription.timeout_seconds)),
    }
}

#[async_trait]
impl JobHandler for Sender {
    async fn handle(&self, job: DeliveryJob) {
        match self.send(job.attempt_id).await {
            Ok(outcome) => debug!(attempt_id = %job.attempt_id, ?outcome, "delivery job finished"),
            Err(e) => error!(attempt_id = %job.attempt_id, error = %e, "delivery job failed"),
        }
    }
}
