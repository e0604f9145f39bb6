//! Retry decisions and the periodic retry sweep.
//!
//! A failed attempt either moves to `retrying` with an exact, jitter-free
//! `next_retry_at = attempted_at + base * 2^(n-1)`, or to `abandoned` when
//! the failure is not retryable or the subscription's attempt budget is
//! spent. The sweep turns due retries into attempt N+1 through an atomic
//! claim in the store, so only one claimant ever creates the successor.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tally_core::{
    AbandonReason, Clock, DeliveryAttempt, DeliveryStore, Subscription, SubscriptionRegistry,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    stats::{bump, DeliveryCounters},
    worker_pool::{DeliveryJob, JobQueue},
};

/// Default time between retry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Default maximum number of due retries handled per sweep.
pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 100;

/// Exponent cap; keeps the multiplier inside `u32` and the delay finite.
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// Returns the wait before retrying attempt `attempt_number`.
///
/// `base * 2^(attempt_number - 1)`: with a 60 s base, attempt 1 waits 60 s,
/// attempt 2 waits 120 s, attempt 3 waits 240 s.
pub fn backoff_delay(base_seconds: u32, attempt_number: u32) -> TimeDelta {
    let exponent = attempt_number.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
    let multiplier = 2_i64.pow(exponent);
    TimeDelta::seconds(i64::from(base_seconds) * multiplier)
}

/// Decision for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule the attempt for another try.
    Retry {
        /// When attempt N+1 becomes due
        next_retry_at: DateTime<Utc>,
    },
    /// Stop retrying.
    GiveUp {
        /// Why the lineage ends here
        reason: AbandonReason,
    },
}

/// Decides what happens to a failed attempt.
///
/// A missing subscription is treated like a configuration error: there is
/// nowhere left to deliver to. A disabled one ends the lineage as inactive.
pub fn decide(
    attempt: &DeliveryAttempt,
    subscription: Option<&Subscription>,
    error: &DeliveryError,
    now: DateTime<Utc>,
) -> RetryDecision {
    let Some(subscription) = subscription else {
        return RetryDecision::GiveUp { reason: AbandonReason::NonRetryable };
    };

    if !subscription.active {
        return RetryDecision::GiveUp { reason: AbandonReason::SubscriptionInactive };
    }

    if !error.is_retryable() {
        return RetryDecision::GiveUp { reason: AbandonReason::NonRetryable };
    }

    if attempt.attempt_number >= subscription.max_retries {
        return RetryDecision::GiveUp { reason: AbandonReason::Exhausted };
    }

    let attempted_at = attempt.attempted_at.unwrap_or(now);
    let delay = backoff_delay(subscription.retry_delay_base_seconds, attempt.attempt_number);
    RetryDecision::Retry { next_retry_at: attempted_at + delay }
}

/// Sweep settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Time between sweeps.
    pub sweep_interval: Duration,
    /// Maximum due retries handled per sweep.
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { sweep_interval: DEFAULT_SWEEP_INTERVAL, batch_size: DEFAULT_SWEEP_BATCH_SIZE }
    }
}

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Retrying attempts found due.
    pub due: usize,
    /// Due attempts this sweep turned into a new pending attempt.
    pub claimed: usize,
    /// Due attempts abandoned instead of claimed.
    pub abandoned: usize,
}

/// Owns retry decisions and the periodic sweep.
pub struct RetryScheduler {
    store: Arc<dyn DeliveryStore>,
    registry: Arc<dyn SubscriptionRegistry>,
    clock: Arc<dyn Clock>,
    jobs: JobQueue,
    counters: Arc<DeliveryCounters>,
    config: SchedulerConfig,
}

impl RetryScheduler {
    /// Creates a scheduler that submits claimed retries to `jobs`.
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        registry: Arc<dyn SubscriptionRegistry>,
        clock: Arc<dyn Clock>,
        jobs: JobQueue,
        counters: Arc<DeliveryCounters>,
        config: SchedulerConfig,
    ) -> Self {
        Self { store, registry, clock, jobs, counters, config }
    }

    /// Moves a failed attempt to retrying or abandoned.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the transition cannot be persisted, including
    /// when the attempt is no longer in the failed state.
    pub async fn handle_failure(
        &self,
        attempt: &DeliveryAttempt,
        subscription: Option<&Subscription>,
        error: &DeliveryError,
    ) -> Result<DeliveryAttempt> {
        match decide(attempt, subscription, error, self.clock.now()) {
            RetryDecision::Retry { next_retry_at } => {
                let updated = self.store.schedule_retry(attempt.id, next_retry_at).await?;
                bump(&self.counters.retries_scheduled);

                info!(
                    attempt_id = %attempt.id,
                    subscription_id = %attempt.subscription_id,
                    attempt_number = attempt.attempt_number,
                    next_retry_at = %next_retry_at,
                    error_category = %error.category(),
                    "delivery failed, retry scheduled"
                );
                Ok(updated)
            },
            RetryDecision::GiveUp { reason } => {
                let updated = self.store.abandon(attempt.id, reason).await?;
                bump(&self.counters.attempts_abandoned);

                warn!(
                    attempt_id = %attempt.id,
                    subscription_id = %attempt.subscription_id,
                    attempt_number = attempt.attempt_number,
                    reason = %reason,
                    error = %error,
                    "delivery abandoned"
                );
                Ok(updated)
            },
        }
    }

    /// Runs one pass over due retries.
    ///
    /// Attempts whose subscription is missing or inactive are abandoned, and
    /// so are attempts whose lineage already reached the subscription's
    /// current `max_retries`. The rest are claimed; each won claim yields a
    /// pending attempt N+1 that is submitted to the worker pool. Claims lost
    /// to a concurrent sweeper are skipped.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if due retries cannot be listed. Failures on
    /// individual attempts are logged and do not stop the sweep.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let due = self.store.find_due_retries(now, self.config.batch_size).await?;
        let mut report = SweepReport { due: due.len(), ..SweepReport::default() };

        for attempt in due {
            let subscription = match self.registry.find(attempt.subscription_id).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    warn!(attempt_id = %attempt.id, error = %e, "subscription lookup failed");
                    continue;
                },
            };

            let give_up = match &subscription {
                Some(s) if !s.active => Some(AbandonReason::SubscriptionInactive),
                None => Some(AbandonReason::SubscriptionInactive),
                // max_retries may have been lowered since the retry was scheduled
                Some(s) if attempt.attempt_number >= s.max_retries => {
                    Some(AbandonReason::Exhausted)
                },
                Some(_) => None,
            };

            if let Some(reason) = give_up {
                match self.store.abandon_retry(attempt.id, reason).await {
                    Ok(_) => {
                        report.abandoned += 1;
                        bump(&self.counters.attempts_abandoned);
                        info!(
                            attempt_id = %attempt.id,
                            subscription_id = %attempt.subscription_id,
                            reason = %reason,
                            "retry abandoned"
                        );
                    },
                    Err(e) if e.is_transition_conflict() => {
                        debug!(attempt_id = %attempt.id, "retry already resolved elsewhere");
                    },
                    Err(e) => warn!(attempt_id = %attempt.id, error = %e, "abandon failed"),
                }
                continue;
            }

            match self.store.claim_retry(attempt.id, now).await {
                Ok(Some(next)) => {
                    report.claimed += 1;
                    bump(&self.counters.attempts_created);
                    debug!(
                        attempt_id = %next.id,
                        previous_attempt_id = %attempt.id,
                        attempt_number = next.attempt_number,
                        "retry claimed"
                    );

                    if self.jobs.send(DeliveryJob::from(&next)).await.is_err() {
                        warn!(
                            attempt_id = %next.id,
                            "worker pool closed, attempt left pending for recovery"
                        );
                    }
                },
                Ok(None) => debug!(attempt_id = %attempt.id, "retry claimed by another sweeper"),
                Err(e) => warn!(attempt_id = %attempt.id, error = %e, "retry claim failed"),
            }
        }

        Ok(report)
    }

    /// Sweeps every `sweep_interval` until cancelled.
    pub async fn run(self: Arc<Self>, cancellation_token: CancellationToken) {
        info!(
            sweep_interval_seconds = self.config.sweep_interval.as_secs(),
            batch_size = self.config.batch_size,
            "retry scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                () = cancellation_token.cancelled() => break,
                () = self.clock.sleep(self.config.sweep_interval) => {},
            }

            match self.sweep().await {
                Ok(report) if report.due > 0 => {
                    info!(
                        due = report.due,
                        claimed = report.claimed,
                        abandoned = report.abandoned,
                        "retry sweep completed"
                    );
                },
                Ok(_) => debug!("retry sweep found nothing due"),
                Err(e) => error!(error = %e, "retry sweep failed"),
            }
        }

        info!("retry scheduler stopped");
    }
}
