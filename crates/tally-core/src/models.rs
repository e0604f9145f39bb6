//! Subscriptions, domain events and strongly-typed identifiers.
//!
//! A `Subscription` binds a set of event patterns to a target endpoint and a
//! delivery policy. An `Event` is the immutable value a producer hands to the
//! engine. Both are plain data; validation lives in `registry` and delivery
//! state lives in `attempt`.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Upper bound for `Subscription::max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Upper bound for `Subscription::timeout_seconds`.
pub const MAX_TIMEOUT_SECONDS: u32 = 300;

/// Declares a UUID newtype with display, conversion and Postgres mapping.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id! {
    /// Identifier of a webhook subscription.
    ///
    /// Sent to subscribers in the `X-Webhook-ID` header.
    SubscriptionId
}

uuid_id! {
    /// Correlation identifier of a domain event.
    ///
    /// Producers may supply their own; every attempt created for the event
    /// carries it, and dispatch deduplication is keyed on it.
    EventId
}

uuid_id! {
    /// Identifier of a single delivery attempt.
    AttemptId
}

/// HTTP methods a subscription may deliver with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// HTTP POST method (default).
    #[default]
    Post,
    /// HTTP PUT method.
    Put,
    /// HTTP PATCH method.
    Patch,
}

impl HttpMethod {
    /// Returns the method name as sent on the wire.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            _ => Err(CoreError::invalid_input(format!("unsupported http method: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for HttpMethod {
    fn type_info() -> PgTypeInfo {
        <str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for HttpMethod {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl sqlx::Encode<'_, PgDb> for HttpMethod {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// One entry of a subscription's pattern set.
///
/// Either an exact dot-namespaced event type such as `invoice.paid`, or the
/// wildcard `*` which matches every event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EventPattern {
    /// Matches exactly one event type.
    Exact(String),
    /// Matches every event type.
    Wildcard,
}

impl EventPattern {
    /// Returns true if this pattern selects the given event type.
    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            Self::Wildcard => true,
            Self::Exact(expected) => expected == event_type,
        }
    }
}

impl FromStr for EventPattern {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "*" {
            return Ok(Self::Wildcard);
        }

        let valid = !s.is_empty()
            && s.split('.').all(|segment| {
                !segment.is_empty()
                    && segment
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            });

        if valid {
            Ok(Self::Exact(s.to_string()))
        } else {
            Err(CoreError::invalid_input(format!(
                "event pattern '{s}' must be '*' or dot-separated [a-z0-9_] segments"
            )))
        }
    }
}

impl TryFrom<String> for EventPattern {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<EventPattern> for String {
    fn from(pattern: EventPattern) -> Self {
        pattern.to_string()
    }
}

impl fmt::Display for EventPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wildcard => f.write_str("*"),
            Self::Exact(event_type) => f.write_str(event_type),
        }
    }
}

/// Shared HMAC secret of a subscription.
///
/// Never printed: `Debug` renders a redacted placeholder so secrets cannot
/// leak through tracing fields or panic messages.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct SigningSecret(String);

impl SigningSecret {
    /// Wraps an existing secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Generates a random 256-bit secret, hex encoded with a `whsec_` prefix.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill(&mut bytes);
        Self(format!("whsec_{}", hex::encode(bytes)))
    }

    /// Returns the raw secret for signing.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns true if the secret is empty or only whitespace.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningSecret(***)")
    }
}

/// Webhook subscription: which events go where, and how.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Unique identifier for this subscription.
    pub id: SubscriptionId,

    /// Human-readable display name.
    pub name: String,

    /// Target URL for delivery.
    pub url: String,

    /// Shared secret for payload signatures. Never serialized.
    #[serde(skip_serializing)]
    pub secret: SigningSecret,

    /// Ordered pattern set.
    pub patterns: Vec<EventPattern>,

    /// HTTP method used for delivery.
    pub method: HttpMethod,

    /// Inactive subscriptions receive no new attempts and no further retries.
    pub active: bool,

    /// Total attempts allowed per event, including the first.
    pub max_retries: u32,

    /// Base of the exponential backoff, in seconds.
    pub retry_delay_base_seconds: u32,

    /// Per-request timeout, in seconds.
    pub timeout_seconds: u32,

    /// When this subscription was registered.
    pub created_at: DateTime<Utc>,

    /// When configuration was last modified.
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Returns true if any pattern in the set selects the event type.
    ///
    /// Does not look at the active flag.
    pub fn matches(&self, event_type: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches(event_type))
    }
}

/// Input for registering a subscription.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    /// Display name.
    pub name: String,
    /// Target URL.
    pub url: String,
    /// Shared secret.
    pub secret: SigningSecret,
    /// Raw patterns, parsed during validation.
    pub patterns: Vec<String>,
    /// HTTP method.
    pub method: HttpMethod,
    /// Total attempts allowed per event.
    pub max_retries: u32,
    /// Backoff base in seconds.
    pub retry_delay_base_seconds: u32,
    /// Request timeout in seconds.
    pub timeout_seconds: u32,
}

impl NewSubscription {
    /// Creates a registration request with default delivery policy.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        secret: SigningSecret,
        patterns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            secret,
            patterns: patterns.into_iter().map(Into::into).collect(),
            method: HttpMethod::Post,
            max_retries: 5,
            retry_delay_base_seconds: 60,
            timeout_seconds: 30,
        }
    }
}

/// Partial update of a subscription. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionUpdate {
    /// New display name.
    pub name: Option<String>,
    /// New target URL.
    pub url: Option<String>,
    /// Rotated secret. Attempts already dispatched keep their signature.
    pub secret: Option<SigningSecret>,
    /// Replacement pattern set.
    pub patterns: Option<Vec<String>>,
    /// New HTTP method.
    pub method: Option<HttpMethod>,
    /// New attempt budget.
    pub max_retries: Option<u32>,
    /// New backoff base.
    pub retry_delay_base_seconds: Option<u32>,
    /// New request timeout.
    pub timeout_seconds: Option<u32>,
}

/// User who performed the action that produced an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// User identifier.
    pub id: String,
    /// Login name.
    pub username: String,
    /// Name shown in the UI.
    pub display_name: String,
}

/// Business entity an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity kind, for example `invoice`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Entity identifier.
    pub id: String,
    /// Human-readable entity name.
    pub name: String,
}

/// Immutable domain event handed to the delivery engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Correlation identifier.
    pub id: EventId,
    /// Dot-namespaced event type, for example `invoice.paid`.
    pub event_type: String,
    /// When the action happened.
    pub timestamp: DateTime<Utc>,
    /// Who did it.
    pub actor: Actor,
    /// What it was done to.
    pub entity: Entity,
    /// Verb, for example `paid`.
    pub action: String,
    /// Sentence describing the action for humans.
    pub description: String,
    /// Free-form semantic data.
    pub data: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_pattern_matches_everything() {
        let pattern: EventPattern = "*".parse().unwrap();
        assert_eq!(pattern, EventPattern::Wildcard);
        assert!(pattern.matches("invoice.paid"));
        assert!(pattern.matches("task.completed"));
    }

    #[test]
    fn exact_pattern_matches_only_itself() {
        let pattern: EventPattern = "invoice.paid".parse().unwrap();
        assert!(pattern.matches("invoice.paid"));
        assert!(!pattern.matches("invoice.sent"));
        assert!(!pattern.matches("invoice"));
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        for raw in ["", "invoice.", ".paid", "Invoice.Paid", "invoice paid", "invoice.*"] {
            assert!(raw.parse::<EventPattern>().is_err(), "{raw:?} should be rejected");
        }
    }

    #[test]
    fn secret_debug_is_redacted() {
        let secret = SigningSecret::new("super-secret-value");
        let rendered = format!("{secret:?}");
        assert!(!rendered.contains("super-secret-value"));
        assert_eq!(rendered, "SigningSecret(***)");
    }

    #[test]
    fn generated_secrets_are_unique_and_prefixed() {
        let a = SigningSecret::generate();
        let b = SigningSecret::generate();
        assert_ne!(a, b);
        assert!(a.expose().starts_with("whsec_"));
        assert_eq!(a.expose().len(), "whsec_".len() + 64);
    }

    #[test]
    fn http_method_parses_case_insensitively() {
        assert_eq!("patch".parse::<HttpMethod>().unwrap(), HttpMethod::Patch);
        assert_eq!(HttpMethod::Put.to_string(), "PUT");
        assert!("GET".parse::<HttpMethod>().is_err());
    }

    #[test]
    fn subscription_serialization_omits_secret() {
        let now = Utc::now();
        let subscription = Subscription {
            id: SubscriptionId::new(),
            name: "billing".to_string(),
            url: "https://example.com/hooks".to_string(),
            secret: SigningSecret::new("s3cret"),
            patterns: vec![EventPattern::Wildcard],
            method: HttpMethod::Post,
            active: true,
            max_retries: 3,
            retry_delay_base_seconds: 60,
            timeout_seconds: 30,
            created_at: now,
            updated_at: now,
        };

        let json = serde_json::to_string(&subscription).unwrap();
        assert!(!json.contains("s3cret"));
        assert!(json.contains("\"patterns\":[\"*\"]"));
    }
}
