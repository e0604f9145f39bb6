//! Subscription registry: which subscriptions want which events.
//!
//! The delivery engine only reads from the registry (`matching`, `find`).
//! Write operations exist for the management surface and share one
//! validation routine across implementations.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{
    error::{CoreError, Result},
    models::{
        EventPattern, NewSubscription, Subscription, SubscriptionId, SubscriptionUpdate,
        MAX_RETRIES_LIMIT, MAX_TIMEOUT_SECONDS,
    },
    time::Clock,
};

/// Registry validation settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Accept plain `http://` targets. Intended for development and tests.
    pub allow_http: bool,
}

/// Source of webhook subscriptions.
#[async_trait]
pub trait SubscriptionRegistry: Send + Sync + 'static {
    /// Returns every active subscription whose pattern set contains the event
    /// type or the wildcard, each at most once, oldest first.
    async fn matching(&self, event_type: &str) -> Result<Vec<Subscription>>;

    /// Looks up a subscription by id, active or not.
    async fn find(&self, id: SubscriptionId) -> Result<Option<Subscription>>;

    /// Lists all subscriptions, oldest first.
    async fn list(&self) -> Result<Vec<Subscription>>;

    /// Validates and stores a new subscription.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if validation fails.
    async fn register(&self, new: NewSubscription) -> Result<Subscription>;

    /// Applies a partial update, validating the result.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for unknown ids and
    /// `CoreError::InvalidInput` if the updated subscription is invalid.
    async fn update(&self, id: SubscriptionId, update: SubscriptionUpdate) -> Result<Subscription>;

    /// Enables or disables a subscription. Delivery history is untouched.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for unknown ids.
    async fn set_active(&self, id: SubscriptionId, active: bool) -> Result<Subscription>;
}

/// Validates a target URL against the scheme policy.
///
/// # Errors
///
/// Returns `CoreError::InvalidInput` for unparseable URLs, URLs without a
/// host, and schemes other than https (or http when allowed).
pub fn validate_url(url: &str, allow_http: bool) -> Result<()> {
    let parsed = url::Url::parse(url)
        .map_err(|e| CoreError::invalid_input(format!("invalid URL format: {e}")))?;

    match parsed.scheme() {
        "https" => {},
        "http" if allow_http => {},
        "http" => return Err(CoreError::invalid_input("webhook URLs must use HTTPS")),
        scheme => {
            return Err(CoreError::invalid_input(format!("unsupported URL scheme: {scheme}")));
        },
    }

    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(CoreError::invalid_input("URL must have a host"));
    }

    Ok(())
}

/// Checks every field of a subscription.
///
/// # Errors
///
/// Returns `CoreError::InvalidInput` describing the first violation found.
pub fn validate_subscription(subscription: &Subscription, config: RegistryConfig) -> Result<()> {
    if subscription.name.trim().is_empty() {
        return Err(CoreError::invalid_input("subscription name must not be empty"));
    }

    validate_url(&subscription.url, config.allow_http)?;

    if subscription.secret.is_blank() {
        return Err(CoreError::invalid_input("subscription secret must not be empty"));
    }

    if subscription.patterns.is_empty() {
        return Err(CoreError::invalid_input("at least one event pattern is required"));
    }

    if !(1..=MAX_RETRIES_LIMIT).contains(&subscription.max_retries) {
        return Err(CoreError::invalid_input(format!(
            "max_retries must be between 1 and {MAX_RETRIES_LIMIT}"
        )));
    }

    if subscription.retry_delay_base_seconds == 0 {
        return Err(CoreError::invalid_input("retry_delay_base_seconds must be positive"));
    }

    if !(1..=MAX_TIMEOUT_SECONDS).contains(&subscription.timeout_seconds) {
        return Err(CoreError::invalid_input(format!(
            "timeout_seconds must be between 1 and {MAX_TIMEOUT_SECONDS}"
        )));
    }

    Ok(())
}

/// Parses raw patterns, dropping duplicates while keeping order.
///
/// # Errors
///
/// Returns `CoreError::InvalidInput` for malformed patterns.
pub fn parse_patterns(raw: &[String]) -> Result<Vec<EventPattern>> {
    let mut patterns: Vec<EventPattern> = Vec::with_capacity(raw.len());
    for pattern in raw {
        let parsed: EventPattern = pattern.parse()?;
        if !patterns.contains(&parsed) {
            patterns.push(parsed);
        }
    }
    Ok(patterns)
}

/// Builds and validates a subscription from a registration request.
///
/// # Errors
///
/// Returns `CoreError::InvalidInput` if validation fails.
pub fn build_subscription(
    new: NewSubscription,
    clock: &dyn Clock,
    config: RegistryConfig,
) -> Result<Subscription> {
    let now = clock.now();
    let subscription = Subscription {
        id: SubscriptionId::new(),
        name: new.name,
        url: new.url,
        secret: new.secret,
        patterns: parse_patterns(&new.patterns)?,
        method: new.method,
        active: true,
        max_retries: new.max_retries,
        retry_delay_base_seconds: new.retry_delay_base_seconds,
        timeout_seconds: new.timeout_seconds,
        created_at: now,
        updated_at: now,
    };

    validate_subscription(&subscription, config)?;
    Ok(subscription)
}

/// Applies a partial update to a copy of `current` and validates it.
///
/// # Errors
///
/// Returns `CoreError::InvalidInput` if the result is invalid.
pub fn apply_update(
    current: &Subscription,
    update: SubscriptionUpdate,
    clock: &dyn Clock,
    config: RegistryConfig,
) -> Result<Subscription> {
    let mut next = current.clone();

    if let Some(name) = update.name {
        next.name = name;
    }
    if let Some(url) = update.url {
        next.url = url;
    }
    if let Some(secret) = update.secret {
        next.secret = secret;
    }
    if let Some(patterns) = update.patterns {
        next.patterns = parse_patterns(&patterns)?;
    }
    if let Some(method) = update.method {
        next.method = method;
    }
    if let Some(max_retries) = update.max_retries {
        next.max_retries = max_retries;
    }
    if let Some(base) = update.retry_delay_base_seconds {
        next.retry_delay_base_seconds = base;
    }
    if let Some(timeout) = update.timeout_seconds {
        next.timeout_seconds = timeout;
    }
    next.updated_at = clock.now();

    validate_subscription(&next, config)?;
    Ok(next)
}

/// Registry held entirely in memory.
///
/// Used by tests and by embedders that load subscriptions from their own
/// configuration.
#[derive(Debug, Clone)]
pub struct InMemorySubscriptionRegistry {
    subscriptions: Arc<RwLock<HashMap<SubscriptionId, Subscription>>>,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
}

impl InMemorySubscriptionRegistry {
    /// Creates an empty registry.
    pub fn new(clock: Arc<dyn Clock>, config: RegistryConfig) -> Self {
        Self { subscriptions: Arc::new(RwLock::new(HashMap::new())), clock, config }
    }

    /// Removes a subscription entirely. Attempts already created keep
    /// referencing its id.
    pub async fn remove(&self, id: SubscriptionId) -> Option<Subscription> {
        self.subscriptions.write().await.remove(&id)
    }

    async fn sorted(&self, filter: impl Fn(&Subscription) -> bool) -> Vec<Subscription> {
        let guard = self.subscriptions.read().await;
        let mut found: Vec<Subscription> = guard.values().filter(|s| filter(s)).cloned().collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        found
    }
}

#[async_trait]
impl SubscriptionRegistry for InMemorySubscriptionRegistry {
    async fn matching(&self, event_type: &str) -> Result<Vec<Subscription>> {
        let found = self.sorted(|s| s.active && s.matches(event_type)).await;
        debug!(event_type, matched = found.len(), "matched subscriptions");
        Ok(found)
    }

    async fn find(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        Ok(self.subscriptions.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Subscription>> {
        Ok(self.sorted(|_| true).await)
    }

    async fn register(&self, new: NewSubscription) -> Result<Subscription> {
        let subscription = build_subscription(new, self.clock.as_ref(), self.config)?;
        self.subscriptions.write().await.insert(subscription.id, subscription.clone());

        info!(
            subscription_id = %subscription.id,
            name = %subscription.name,
            "subscription registered"
        );
        Ok(subscription)
    }

    async fn update(&self, id: SubscriptionId, update: SubscriptionUpdate) -> Result<Subscription> {
        let mut guard = self.subscriptions.write().await;
        let current = guard.get(&id).ok_or_else(|| CoreError::not_found("subscription", id))?;
        let next = apply_update(current, update, self.clock.as_ref(), self.config)?;
        guard.insert(id, next.clone());

        info!(subscription_id = %id, "subscription updated");
        Ok(next)
    }

    async fn set_active(&self, id: SubscriptionId, active: bool) -> Result<Subscription> {
        let mut guard = self.subscriptions.write().await;
        let subscription =
            guard.get_mut(&id).ok_or_else(|| CoreError::not_found("subscription", id))?;
        subscription.active = active;
        subscription.updated_at = self.clock.now();

        info!(subscription_id = %id, active, "subscription active flag changed");
        Ok(subscription.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::SigningSecret, time::TestClock};

    fn registry() -> InMemorySubscriptionRegistry {
        InMemorySubscriptionRegistry::new(Arc::new(TestClock::new()), RegistryConfig::default())
    }

    fn new_subscription(patterns: &[&str]) -> NewSubscription {
        NewSubscription::new(
            "crm sync",
            "https://hooks.example.com/tally",
            SigningSecret::new("secret"),
            patterns.iter().copied(),
        )
    }

    #[test]
    fn https_is_required_unless_http_allowed() {
        assert!(validate_url("https://example.com/hook", false).is_ok());
        assert!(validate_url("http://example.com/hook", false).is_err());
        assert!(validate_url("http://127.0.0.1:8080/hook", true).is_ok());
        assert!(validate_url("ftp://example.com/hook", true).is_err());
        assert!(validate_url("not a url", true).is_err());
    }

    #[tokio::test]
    async fn register_rejects_missing_secret() {
        let registry = registry();
        let mut new = new_subscription(&["invoice.paid"]);
        new.secret = SigningSecret::new("  ");

        let err = registry.register(new).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn register_rejects_retry_budget_above_limit() {
        let registry = registry();
        let mut new = new_subscription(&["*"]);
        new.max_retries = MAX_RETRIES_LIMIT + 1;

        assert!(registry.register(new).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_patterns_collapse() {
        let registry = registry();
        let new = new_subscription(&["invoice.paid", "*", "invoice.paid"]);
        let subscription = registry.register(new).await.unwrap();
        assert_eq!(subscription.patterns.len(), 2);
    }

    #[tokio::test]
    async fn matching_returns_exact_and_wildcard_once_each() {
        let registry = registry();
        let exact = registry.register(new_subscription(&["invoice.paid"])).await.unwrap();
        let wildcard = registry.register(new_subscription(&["*"])).await.unwrap();
        let both = registry.register(new_subscription(&["invoice.paid", "*"])).await.unwrap();
        registry.register(new_subscription(&["invoice.sent"])).await.unwrap();

        let matched = registry.matching("invoice.paid").await.unwrap();
        let mut ids: Vec<_> = matched.iter().map(|s| s.id).collect();
        ids.sort();
        let mut expected = vec![exact.id, wildcard.id, both.id];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn disabled_subscriptions_do_not_match_but_remain() {
        let registry = registry();
        let subscription = registry.register(new_subscription(&["*"])).await.unwrap();

        registry.set_active(subscription.id, false).await.unwrap();

        assert!(registry.matching("task.completed").await.unwrap().is_empty());
        let stored = registry.find(subscription.id).await.unwrap().unwrap();
        assert!(!stored.active);
    }

    #[tokio::test]
    async fn update_validates_the_result() {
        let registry = registry();
        let subscription = registry.register(new_subscription(&["*"])).await.unwrap();

        let bad = SubscriptionUpdate {
            url: Some("http://example.com".to_string()),
            ..Default::default()
        };
        assert!(registry.update(subscription.id, bad).await.is_err());

        let good = SubscriptionUpdate { timeout_seconds: Some(5), ..Default::default() };
        let updated = registry.update(subscription.id, good).await.unwrap();
        assert_eq!(updated.timeout_seconds, 5);
        assert_eq!(updated.url, subscription.url);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let registry = registry();
        let err = registry.set_active(SubscriptionId::new(), true).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
