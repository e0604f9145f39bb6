//! In-memory test environment wiring a delivery engine to a mock subscriber.

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use tally_core::{
    AttemptStatus, Clock, DeliveryAttempt, DeliveryStore, Event, EventId, InMemoryDeliveryStore,
    InMemorySubscriptionRegistry, RegistryConfig, Subscription, SubscriptionId,
    SubscriptionRegistry, TestClock,
};
use tally_delivery::{DeliveryEngine, EngineConfig, EngineStats, SweepReport};
use wiremock::MockServer;

use crate::fixtures::SubscriptionBuilder;

/// How often `wait_for_*` helpers poll.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default budget for `wait_for_*` helpers.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// Builder for configuring a [`TestEnv`].
pub struct TestEnvBuilder {
    worker_count: usize,
    dedup_window: Duration,
    sweep_interval: Duration,
    max_payload_bytes: Option<usize>,
    shutdown_timeout: Duration,
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self {
            worker_count: 1,
            dedup_window: Duration::from_secs(60),
            // Sweeps are driven by hand through `TestEnv::sweep`.
            sweep_interval: Duration::from_secs(86_400),
            max_payload_bytes: None,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl TestEnvBuilder {
    /// Creates a new builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of delivery workers (default: 1).
    #[must_use]
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Sets the dedup window (default: 60s).
    #[must_use]
    pub fn dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    /// Sets the background sweep interval in test-clock time (default: one day).
    #[must_use]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Overrides the payload size limit.
    #[must_use]
    pub fn max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = Some(bytes);
        self
    }

    /// Starts the mock subscriber and builds the environment. The engine is
    /// created but not started.
    ///
    /// # Errors
    ///
    /// Returns error if the delivery engine cannot be constructed.
    pub async fn build(self) -> Result<TestEnv> {
        crate::init_tracing();

        let clock = TestClock::new();
        let registry = Arc::new(InMemorySubscriptionRegistry::new(
            Arc::new(clock.clone()),
            RegistryConfig { allow_http: true },
        ));
        let store = Arc::new(InMemoryDeliveryStore::new());
        let http = MockServer::start().await;

        let mut config = EngineConfig {
            worker_count: self.worker_count,
            dedup_window: self.dedup_window,
            sweep_interval: self.sweep_interval,
            allow_http: true,
            shutdown_timeout: self.shutdown_timeout,
            ..EngineConfig::default()
        };
        if let Some(bytes) = self.max_payload_bytes {
            config.max_payload_bytes = bytes;
        }

        let engine = DeliveryEngine::new(
            registry.clone(),
            store.clone(),
            Arc::new(clock.clone()),
            config,
        )
        .context("failed to create delivery engine")?;

        Ok(TestEnv { clock, registry, store, http, engine: Some(engine) })
    }
}

/// Test environment: test clock, in-memory registry and store, a mock
/// subscriber endpoint and a delivery engine over all of them.
pub struct TestEnv {
    /// Manually driven clock shared by every component.
    pub clock: TestClock,
    /// Subscription registry accepting plain http targets.
    pub registry: Arc<InMemorySubscriptionRegistry>,
    /// Delivery history.
    pub store: Arc<InMemoryDeliveryStore>,
    /// Mock subscriber endpoint.
    pub http: MockServer,
    engine: Option<DeliveryEngine>,
}

impl TestEnv {
    /// Builds an environment with default settings.
    ///
    /// # Errors
    ///
    /// Returns error if the delivery engine cannot be constructed.
    pub async fn new() -> Result<Self> {
        TestEnvBuilder::new().build().await
    }

    /// Returns a builder for customized environments.
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::new()
    }

    /// Subscription builder targeting the mock subscriber.
    pub fn subscription(&self) -> SubscriptionBuilder {
        SubscriptionBuilder::new(self.http.uri())
    }

    /// Registers a subscription.
    ///
    /// # Errors
    ///
    /// Returns error if the registry rejects it.
    pub async fn subscribe(&self, builder: SubscriptionBuilder) -> Result<Subscription> {
        let subscription = self.registry.register(builder.build()).await?;
        // Distinct creation times keep fan-out order deterministic.
        self.clock.advance(Duration::from_millis(1));
        Ok(subscription)
    }

    /// Delivery engine; present until [`TestEnv::shutdown`].
    ///
    /// # Panics
    ///
    /// Panics if the engine has already been shut down.
    pub fn engine(&self) -> &DeliveryEngine {
        self.engine.as_ref().expect("delivery engine already shut down")
    }

    /// Starts workers, fan-out and the sweeper.
    ///
    /// # Errors
    ///
    /// Returns error if the engine was already started.
    pub async fn start(&mut self) -> Result<()> {
        let engine = self.engine.as_mut().context("delivery engine already shut down")?;
        engine.start().await.context("failed to start delivery engine")
    }

    /// Emits an event through the engine.
    ///
    /// # Errors
    ///
    /// Returns error if the engine rejects the event.
    pub fn emit(&self, event: Event) -> Result<EventId> {
        Ok(self.engine().emit(event)?)
    }

    /// Runs one retry sweep at the current test-clock time.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be swept.
    pub async fn sweep(&self) -> Result<SweepReport> {
        Ok(self.engine().scheduler().sweep().await?)
    }

    /// Moves the test clock forward.
    pub fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Engine counters.
    pub fn stats(&self) -> EngineStats {
        self.engine().stats()
    }

    /// All attempts for one subscription and event, by attempt number.
    ///
    /// # Errors
    ///
    /// Returns error if the store query fails.
    pub async fn lineage(
        &self,
        subscription_id: SubscriptionId,
        event_id: EventId,
    ) -> Result<Vec<DeliveryAttempt>> {
        Ok(self.store.find_lineage(subscription_id, event_id).await?)
    }

    /// Waits until attempt `attempt_number` of a lineage reaches `status`.
    ///
    /// # Errors
    ///
    /// Returns error if the attempt does not reach the status within
    /// [`DEFAULT_WAIT`].
    pub async fn wait_for_attempt(
        &self,
        subscription_id: SubscriptionId,
        event_id: EventId,
        attempt_number: u32,
        status: AttemptStatus,
    ) -> Result<DeliveryAttempt> {
        let found = wait_until(DEFAULT_WAIT, || async move {
            let lineage = self.lineage(subscription_id, event_id).await.ok()?;
            lineage
                .into_iter()
                .find(|a| a.attempt_number == attempt_number && a.status() == status)
        })
        .await;

        match found {
            Some(attempt) => Ok(attempt),
            None => {
                let lineage = self.lineage(subscription_id, event_id).await?;
                let seen: Vec<_> =
                    lineage.iter().map(|a| (a.attempt_number, a.status())).collect();
                bail!("attempt {attempt_number} never reached {status:?}; lineage is {seen:?}")
            },
        }
    }

    /// Waits until the mock subscriber has received `count` requests.
    ///
    /// # Errors
    ///
    /// Returns error if fewer requests arrive within [`DEFAULT_WAIT`].
    pub async fn wait_for_requests(&self, count: usize) -> Result<Vec<wiremock::Request>> {
        let found = wait_until(DEFAULT_WAIT, || async move {
            let requests = self.http.received_requests().await?;
            (requests.len() >= count).then_some(requests)
        })
        .await;

        found.with_context(|| format!("mock subscriber never received {count} requests"))
    }

    /// Shuts the engine down gracefully.
    ///
    /// # Errors
    ///
    /// Returns error if shutdown times out or a worker panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(engine) = self.engine.take() {
            engine.shutdown().await.context("failed to shut down delivery engine")?;
        }
        Ok(())
    }

    /// Current test-clock time.
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }
}

/// Polls `check` in real time until it yields a value or `budget` elapses.
pub async fn wait_until<T, F, Fut>(budget: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    tokio::time::timeout(budget, async {
        loop {
            if let Some(value) = check().await {
                return value;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .ok()
}

#[cfg(test)]
mod tests {
    use wiremock::{matchers, Mock, ResponseTemplate};

    use super::*;
    use crate::fixtures::EventBuilder;

    #[tokio::test]
    async fn delivers_through_the_mock_subscriber() {
        let mut env = TestEnv::new().await.unwrap();
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&env.http)
            .await;

        let subscription = env.subscribe(env.subscription()).await.unwrap();
        env.start().await.unwrap();
        let event_id = env.emit(EventBuilder::new("invoice.paid").build()).unwrap();

        let attempt = env
            .wait_for_attempt(subscription.id, event_id, 1, AttemptStatus::Success)
            .await
            .unwrap();
        assert_eq!(attempt.http_status_code, Some(200));

        env.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn wait_until_gives_up_after_budget() {
        let result: Option<()> = wait_until(Duration::from_millis(30), || async { None }).await;
        assert!(result.is_none());
    }
}
