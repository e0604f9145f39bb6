//! Test data builders for subscriptions and events.
//!
//! Builders start from sensible defaults so a test only spells out the
//! fields it is about.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tally_core::{Actor, Entity, Event, EventId, HttpMethod, NewSubscription, SigningSecret};

/// Secret used by subscriptions built without an explicit one.
pub const DEFAULT_TEST_SECRET: &str = "whsec_test_secret";

/// Builder for subscription registrations.
#[derive(Debug, Clone)]
pub struct SubscriptionBuilder {
    name: String,
    url: String,
    secret: String,
    patterns: Vec<String>,
    method: HttpMethod,
    max_retries: u32,
    retry_delay_base_seconds: u32,
    timeout_seconds: u32,
}

impl SubscriptionBuilder {
    /// Creates a wildcard subscription to `url` with default policy.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            name: "test-subscription".to_string(),
            url: url.into(),
            secret: DEFAULT_TEST_SECRET.to_string(),
            patterns: vec!["*".to_string()],
            method: HttpMethod::Post,
            max_retries: 5,
            retry_delay_base_seconds: 60,
            timeout_seconds: 5,
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the target URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Sets the signing secret.
    #[must_use]
    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    /// Replaces the pattern set.
    #[must_use]
    pub fn patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the HTTP method.
    #[must_use]
    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    /// Sets the attempt budget.
    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the backoff base in seconds.
    #[must_use]
    pub fn retry_delay_base(mut self, seconds: u32) -> Self {
        self.retry_delay_base_seconds = seconds;
        self
    }

    /// Sets the request timeout in seconds.
    #[must_use]
    pub fn timeout(mut self, seconds: u32) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Builds the registration request.
    pub fn build(self) -> NewSubscription {
        let secret = SigningSecret::new(self.secret);
        let mut new = NewSubscription::new(self.name, self.url, secret, self.patterns);
        new.method = self.method;
        new.max_retries = self.max_retries;
        new.retry_delay_base_seconds = self.retry_delay_base_seconds;
        new.timeout_seconds = self.timeout_seconds;
        new
    }
}

/// Builder for domain events.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    event_type: String,
    timestamp: DateTime<Utc>,
    actor: Actor,
    entity: Entity,
    action: String,
    description: String,
    data: Map<String, Value>,
}

impl EventBuilder {
    /// Creates an event of the given type with placeholder actor and entity.
    pub fn new(event_type: impl Into<String>) -> Self {
        let event_type = event_type.into();
        let action = event_type.rsplit('.').next().unwrap_or_default().to_string();

        Self {
            event_type,
            timestamp: Utc::now(),
            actor: Actor {
                id: "user_1".to_string(),
                username: "ada".to_string(),
                display_name: "Ada Lovelace".to_string(),
            },
            entity: Entity {
                kind: "invoice".to_string(),
                id: "inv_1".to_string(),
                name: "Invoice #1".to_string(),
            },
            description: format!("Ada Lovelace {action} Invoice #1"),
            action,
            data: Map::new(),
        }
    }

    /// Sets the event timestamp.
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Sets the actor.
    #[must_use]
    pub fn actor(mut self, id: &str, username: &str, display_name: &str) -> Self {
        self.actor = Actor {
            id: id.to_string(),
            username: username.to_string(),
            display_name: display_name.to_string(),
        };
        self
    }

    /// Sets the entity.
    #[must_use]
    pub fn entity(mut self, kind: &str, id: &str, name: &str) -> Self {
        self.entity = Entity { kind: kind.to_string(), id: id.to_string(), name: name.to_string() };
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Adds one data field.
    #[must_use]
    pub fn data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Adds a string field of `bytes` bytes, for payload size tests.
    #[must_use]
    pub fn padding(self, bytes: usize) -> Self {
        self.data("padding", Value::String("x".repeat(bytes)))
    }

    /// Builds the event with a fresh id.
    pub fn build(self) -> Event {
        Event {
            id: EventId::new(),
            event_type: self.event_type,
            timestamp: self.timestamp,
            actor: self.actor,
            entity: self.entity,
            action: self.action,
            description: self.description,
            data: self.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_builder_applies_overrides() {
        let new = SubscriptionBuilder::new("https://example.com/hook")
            .patterns(["invoice.paid"])
            .max_retries(3)
            .retry_delay_base(10)
            .method(HttpMethod::Put)
            .build();

        assert_eq!(new.patterns, vec!["invoice.paid".to_string()]);
        assert_eq!(new.max_retries, 3);
        assert_eq!(new.retry_delay_base_seconds, 10);
        assert_eq!(new.method, HttpMethod::Put);
        assert_eq!(new.secret.expose(), DEFAULT_TEST_SECRET);
    }

    #[test]
    fn event_builder_derives_action_from_type() {
        let event = EventBuilder::new("invoice.paid").build();
        assert_eq!(event.action, "paid");
        assert_eq!(event.description, "Ada Lovelace paid Invoice #1");
    }

    #[test]
    fn padding_inflates_payload() {
        let event = EventBuilder::new("file.uploaded").padding(2048).build();
        let padding = event.data["padding"].as_str().unwrap();
        assert_eq!(padding.len(), 2048);
    }
}
