//! Delivery attempts and their state machine.
//!
//! Every outbound HTTP call is tracked as a `DeliveryAttempt`. Its lifecycle
//! is a tagged enum so that a retry time cannot exist outside the retrying
//! state and terminal attempts cannot be touched again:
//!
//! ```text
//! Pending --record_success--> Success
//! Pending --record_failure--> Failed --schedule_retry--> Retrying { next_retry_at }
//!                                    \--abandon--------> Abandoned { reason }
//! Retrying --abandon_retry--> Abandoned { reason }
//! Retrying --claim_next--> Failed, plus attempt N+1 in Pending
//! ```
//!
//! A claimed attempt settles back to `Failed`: its own call failed and the
//! lineage continues in attempt N+1, so nothing is left waiting on it.
//!
//! Every store implementation applies mutations through these methods, so
//! the in-memory and Postgres stores share one definition of what is legal.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{CoreError, Result},
    models::{AttemptId, EventId, SubscriptionId},
};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Maximum stored size of a subscriber response body, in bytes.
pub const MAX_SNIPPET_BYTES: usize = 1024;

const TRUNCATION_SUFFIX: &str = "... (truncated)";

/// Why an attempt lineage was given up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonReason {
    /// The attempt budget of the subscription was used up.
    Exhausted,
    /// The failure can never succeed on retry, for example an invalid URL.
    NonRetryable,
    /// The subscription was disabled or removed while a retry was pending.
    SubscriptionInactive,
}

impl AbandonReason {
    /// Returns the storage representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::NonRetryable => "non_retryable",
            Self::SubscriptionInactive => "subscription_inactive",
        }
    }
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AbandonReason {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "exhausted" => Ok(Self::Exhausted),
            "non_retryable" => Ok(Self::NonRetryable),
            "subscription_inactive" => Ok(Self::SubscriptionInactive),
            _ => Err(CoreError::invalid_input(format!("invalid abandon reason: {s}"))),
        }
    }
}

/// Lifecycle state of a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptState {
    /// Created, waiting for a worker.
    Pending,

    /// Subscriber answered 2xx. Terminal.
    Success,

    /// Delivery failed. Either the retry scheduler has not decided yet, or
    /// the retry was claimed and the lineage continues in attempt N+1.
    Failed,

    /// Waiting for the scheduler to create the next attempt.
    Retrying {
        /// Earliest time the next attempt may be created.
        next_retry_at: DateTime<Utc>,
    },

    /// Given up. Terminal.
    Abandoned {
        /// Why the lineage stopped.
        reason: AbandonReason,
    },
}

impl AttemptState {
    /// Returns the payload-free discriminant.
    pub const fn status(&self) -> AttemptStatus {
        match self {
            Self::Pending => AttemptStatus::Pending,
            Self::Success => AttemptStatus::Success,
            Self::Failed => AttemptStatus::Failed,
            Self::Retrying { .. } => AttemptStatus::Retrying,
            Self::Abandoned { .. } => AttemptStatus::Abandoned,
        }
    }
}

/// Attempt status without state payload, used for queries and storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// See `AttemptState::Pending`.
    Pending,
    /// See `AttemptState::Success`.
    Success,
    /// See `AttemptState::Failed`.
    Failed,
    /// See `AttemptState::Retrying`.
    Retrying,
    /// See `AttemptState::Abandoned`.
    Abandoned,
}

impl AttemptStatus {
    /// Returns the storage representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Abandoned => "abandoned",
        }
    }

    /// Returns true for states no transition leaves.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Abandoned)
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AttemptStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            "abandoned" => Ok(Self::Abandoned),
            _ => Err(CoreError::invalid_input(format!("invalid attempt status: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for AttemptStatus {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for AttemptStatus {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl sqlx::Encode<'_, PgDb> for AttemptStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Outcome data of one executed HTTP call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptResult {
    /// When the request was issued.
    pub attempted_at: DateTime<Utc>,
    /// Status code, if a response was received.
    pub http_status_code: Option<u16>,
    /// Truncated response body.
    pub response_snippet: Option<String>,
}

impl AttemptResult {
    /// Creates a result with no response, as for transport failures.
    pub fn new(attempted_at: DateTime<Utc>) -> Self {
        Self { attempted_at, http_status_code: None, response_snippet: None }
    }

    /// Records the status code and a truncated copy of the response body.
    #[must_use]
    pub fn with_response(mut self, status_code: u16, body: &[u8]) -> Self {
        self.http_status_code = Some(status_code);
        self.response_snippet = (!body.is_empty()).then(|| truncate_snippet(body));
        self
    }
}

/// Truncates a response body to at most `MAX_SNIPPET_BYTES` of UTF-8.
///
/// Invalid bytes decode to U+FFFD, which is three bytes wide, so the limit
/// is applied to the decoded text and the cut lands on a char boundary.
pub fn truncate_snippet(body: &[u8]) -> String {
    let head = &body[..body.len().min(MAX_SNIPPET_BYTES + 1)];
    let text = String::from_utf8_lossy(head);
    if body.len() <= MAX_SNIPPET_BYTES && text.len() <= MAX_SNIPPET_BYTES {
        return text.into_owned();
    }

    let mut keep = MAX_SNIPPET_BYTES - TRUNCATION_SUFFIX.len();
    while !text.is_char_boundary(keep) {
        keep -= 1;
    }
    format!("{}{TRUNCATION_SUFFIX}", &text[..keep])
}

/// One scheduled or executed HTTP call for one subscription and one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// Unique identifier for this attempt.
    pub id: AttemptId,

    /// Subscription being fulfilled.
    pub subscription_id: SubscriptionId,

    /// Correlation id of the event.
    pub event_id: EventId,

    /// Event type, sent as `X-Webhook-Event`.
    pub event_type: String,

    /// Position in the lineage, starting at 1.
    pub attempt_number: u32,

    /// Current lifecycle state.
    #[serde(flatten)]
    pub state: AttemptState,

    /// Status code of the subscriber response.
    pub http_status_code: Option<u16>,

    /// Truncated response body.
    pub response_snippet: Option<String>,

    /// When the attempt was created.
    pub scheduled_at: DateTime<Utc>,

    /// When the HTTP call was made. `None` while pending.
    pub attempted_at: Option<DateTime<Utc>>,

    /// Failure description.
    pub error_message: Option<String>,

    /// Serialized request body, identical for every attempt of a lineage.
    pub payload: String,

    /// `X-Webhook-Signature` value computed at dispatch time.
    pub signature: String,
}

impl DeliveryAttempt {
    /// Creates attempt #1 of a new lineage.
    pub fn first(
        subscription_id: SubscriptionId,
        event_id: EventId,
        event_type: impl Into<String>,
        payload: String,
        signature: String,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AttemptId::new(),
            subscription_id,
            event_id,
            event_type: event_type.into(),
            attempt_number: 1,
            state: AttemptState::Pending,
            http_status_code: None,
            response_snippet: None,
            scheduled_at,
            attempted_at: None,
            error_message: None,
            payload,
            signature,
        }
    }

    /// Returns the payload-free status.
    pub fn status(&self) -> AttemptStatus {
        self.state.status()
    }

    /// Returns the retry time while retrying.
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            AttemptState::Retrying { next_retry_at } => Some(next_retry_at),
            _ => None,
        }
    }

    /// Returns true once no transition can leave the current state.
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Pending to success.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` unless the attempt is pending.
    pub fn record_success(&mut self, result: AttemptResult) -> Result<()> {
        self.expect_status(AttemptStatus::Pending, "record success for")?;
        self.apply_result(result);
        self.state = AttemptState::Success;
        Ok(())
    }

    /// Pending to failed.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` unless the attempt is pending.
    pub fn record_failure(
        &mut self,
        result: AttemptResult,
        error: impl Into<String>,
    ) -> Result<()> {
        self.expect_status(AttemptStatus::Pending, "record failure for")?;
        self.apply_result(result);
        self.error_message = Some(error.into());
        self.state = AttemptState::Failed;
        Ok(())
    }

    /// Failed to retrying.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` unless the attempt is failed.
    pub fn schedule_retry(&mut self, next_retry_at: DateTime<Utc>) -> Result<()> {
        self.expect_status(AttemptStatus::Failed, "schedule retry for")?;
        self.state = AttemptState::Retrying { next_retry_at };
        Ok(())
    }

    /// Failed to abandoned.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` unless the attempt is failed.
    pub fn abandon(&mut self, reason: AbandonReason) -> Result<()> {
        self.expect_status(AttemptStatus::Failed, "abandon")?;
        self.state = AttemptState::Abandoned { reason };
        Ok(())
    }

    /// Retrying to abandoned, for retries that will never be claimed.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` unless the attempt is retrying.
    pub fn abandon_retry(&mut self, reason: AbandonReason) -> Result<()> {
        self.expect_status(AttemptStatus::Retrying, "abandon retry for")?;
        self.state = AttemptState::Abandoned { reason };
        Ok(())
    }

    /// Claims a due retry: settles this attempt back to failed and returns
    /// attempt N+1 of the lineage in pending.
    ///
    /// The new attempt reuses the payload and signature captured at dispatch,
    /// so a secret rotated in the meantime does not change what subscribers
    /// receive for an event already in flight.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` unless the attempt is retrying
    /// and its retry time is not after `now`. The attempt is left unchanged.
    pub fn claim_next(&mut self, now: DateTime<Utc>) -> Result<Self> {
        let next = match self.state {
            AttemptState::Retrying { next_retry_at } if next_retry_at <= now => Self {
                id: AttemptId::new(),
                subscription_id: self.subscription_id,
                event_id: self.event_id,
                event_type: self.event_type.clone(),
                attempt_number: self.attempt_number + 1,
                state: AttemptState::Pending,
                http_status_code: None,
                response_snippet: None,
                scheduled_at: now,
                attempted_at: None,
                error_message: None,
                payload: self.payload.clone(),
                signature: self.signature.clone(),
            },
            _ => {
                return Err(CoreError::InvalidTransition {
                    from: self.status(),
                    action: "claim retry for",
                })
            },
        };

        self.state = AttemptState::Failed;
        Ok(next)
    }

    fn apply_result(&mut self, result: AttemptResult) {
        self.attempted_at = Some(result.attempted_at);
        self.http_status_code = result.http_status_code;
        self.response_snippet = result.response_snippet;
    }

    fn expect_status(&self, expected: AttemptStatus, action: &'static str) -> Result<()> {
        if self.status() == expected {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition { from: self.status(), action })
        }
    }
}

/// Filter for delivery history queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptQuery {
    /// Only attempts of this subscription.
    pub subscription_id: Option<SubscriptionId>,
    /// Only attempts of this event.
    pub event_id: Option<EventId>,
    /// Only attempts currently in this status.
    pub status: Option<AttemptStatus>,
    /// Inclusive lower bound on `scheduled_at`.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `scheduled_at`.
    pub until: Option<DateTime<Utc>>,
    /// Maximum number of rows, newest first.
    pub limit: usize,
}

impl Default for AttemptQuery {
    fn default() -> Self {
        Self {
            subscription_id: None,
            event_id: None,
            status: None,
            since: None,
            until: None,
            limit: 100,
        }
    }
}

impl AttemptQuery {
    /// Restricts the query to one subscription.
    #[must_use]
    pub fn for_subscription(mut self, id: SubscriptionId) -> Self {
        self.subscription_id = Some(id);
        self
    }

    /// Restricts the query to one event.
    #[must_use]
    pub fn for_event(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    /// Restricts the query to one status.
    #[must_use]
    pub fn with_status(mut self, status: AttemptStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restricts the query to `[since, until)`.
    #[must_use]
    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    /// Caps the number of returned rows.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Returns true if the attempt passes every filter. Ignores `limit`.
    pub fn matches(&self, attempt: &DeliveryAttempt) -> bool {
        self.subscription_id.is_none_or(|id| attempt.subscription_id == id)
            && self.event_id.is_none_or(|id| attempt.event_id == id)
            && self.status.is_none_or(|status| attempt.status() == status)
            && self.since.is_none_or(|since| attempt.scheduled_at >= since)
            && self.until.is_none_or(|until| attempt.scheduled_at < until)
    }
}

/// Per-subscription attempt counts for operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStats {
    /// Attempts waiting for a worker.
    pub pending: u64,
    /// Attempts the subscriber accepted.
    pub success: u64,
    /// Failed attempts that are undecided or superseded by a retry.
    pub failed: u64,
    /// Failed attempts waiting for their retry.
    pub retrying: u64,
    /// Failed attempts that ended their lineage.
    pub abandoned: u64,
}

impl DeliveryStats {
    /// Counts one attempt in the given status.
    pub fn record(&mut self, status: AttemptStatus) {
        match status {
            AttemptStatus::Pending => self.pending += 1,
            AttemptStatus::Success => self.success += 1,
            AttemptStatus::Failed => self.failed += 1,
            AttemptStatus::Retrying => self.retrying += 1,
            AttemptStatus::Abandoned => self.abandoned += 1,
        }
    }

    /// Total number of attempts.
    pub fn total(&self) -> u64 {
        self.pending + self.success + self.failed + self.retrying + self.abandoned
    }

    /// Attempts whose HTTP call did not succeed.
    pub fn failures(&self) -> u64 {
        self.failed + self.retrying + self.abandoned
    }
}
