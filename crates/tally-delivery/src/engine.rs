//! Webhook delivery engine wiring every component together.
//!
//! # Architecture
//!
//! ```text
//!  emit ──▶ intake ──▶ Dispatcher ──▶ job queue ──▶ WorkerPool ──▶ Sender ──▶ subscriber
//!                          │                ▲                         │
//!                          ▼                │                         ▼
//!                    DeliveryStore ◀── RetryScheduler ◀──── handle_failure
//! ```
//!
//! The engine owns one cancellation token shared by the fan-out task, the
//! workers and the sweeper. `shutdown` cancels it and waits for everything
//! to finish within `shutdown_timeout`.

use std::{sync::Arc, time::Duration};

use tally_core::{
    AttemptQuery, AttemptStatus, Clock, DeliveryStore, Event, EventId, SubscriptionRegistry,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    client::{ClientConfig, DeliveryClient},
    dispatcher::{Dispatcher, DispatcherConfig, DEFAULT_DEDUP_WINDOW, DEFAULT_INTAKE_CAPACITY},
    error::{DeliveryError, Result},
    retry::{RetryScheduler, SchedulerConfig, DEFAULT_SWEEP_BATCH_SIZE, DEFAULT_SWEEP_INTERVAL},
    sender::{Sender, SenderConfig, DEFAULT_MAX_PAYLOAD_BYTES},
    stats::{DeliveryCounters, EngineStats},
    worker_pool::{job_queue, DeliveryJob, JobQueue, WorkerPool},
};

/// Maximum number of orphaned pending attempts re-queued on start.
const RECOVERY_LIMIT: usize = 10_000;

/// Configuration for the delivery engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// Capacity of the job queue between dispatcher/scheduler and workers.
    pub queue_capacity: usize,

    /// Capacity of the event intake channel.
    pub intake_capacity: usize,

    /// Idempotency window for repeated (event, subscription) dispatches.
    pub dedup_window: Duration,

    /// Time between retry sweeps.
    pub sweep_interval: Duration,

    /// Maximum due retries handled per sweep.
    pub sweep_batch_size: usize,

    /// Request bodies above this size are never sent.
    pub max_payload_bytes: usize,

    /// Accept plain `http://` subscription URLs.
    pub allow_http: bool,

    /// Re-queue attempts left pending by a previous run on start.
    ///
    /// Assumes this engine is the only one working the store. A second
    /// engine recovering the same pending attempts may send them again; the
    /// store's compare-and-set keeps only the first recorded outcome.
    pub recover_pending: bool,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Maximum time to wait for in-flight work on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            queue_capacity: crate::DEFAULT_QUEUE_CAPACITY,
            intake_capacity: DEFAULT_INTAKE_CAPACITY,
            dedup_window: DEFAULT_DEDUP_WINDOW,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            sweep_batch_size: DEFAULT_SWEEP_BATCH_SIZE,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            allow_http: false,
            recover_pending: true,
            client_config: ClientConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Main delivery engine coordinating dispatch, delivery and retries.
pub struct DeliveryEngine {
    config: EngineConfig,
    store: Arc<dyn DeliveryStore>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<RetryScheduler>,
    sender: Arc<Sender>,
    counters: Arc<DeliveryCounters>,
    cancellation_token: CancellationToken,
    jobs: JobQueue,
    job_receiver: Option<mpsc::Receiver<DeliveryJob>>,
    worker_pool: Option<WorkerPool>,
    tasks: Vec<JoinHandle<()>>,
}

impl DeliveryEngine {
    /// Creates a new delivery engine. Nothing runs until [`start`].
    ///
    /// [`start`]: DeliveryEngine::start
    ///
    /// # Errors
    ///
    /// Returns error if the delivery client cannot be initialized.
    pub fn new(
        registry: Arc<dyn SubscriptionRegistry>,
        store: Arc<dyn DeliveryStore>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Result<Self> {
        let client = DeliveryClient::new(&config.client_config)?;
        let counters = Arc::new(DeliveryCounters::new());
        let (jobs, job_receiver) = job_queue(config.queue_capacity);

        let scheduler = Arc::new(RetryScheduler::new(
            store.clone(),
            registry.clone(),
            clock.clone(),
            jobs.clone(),
            counters.clone(),
            SchedulerConfig {
                sweep_interval: config.sweep_interval,
                batch_size: config.sweep_batch_size,
            },
        ));

        let sender = Arc::new(Sender::new(
            store.clone(),
            registry.clone(),
            client,
            scheduler.clone(),
            clock.clone(),
            counters.clone(),
            SenderConfig {
                max_payload_bytes: config.max_payload_bytes,
                allow_http: config.allow_http,
            },
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            store.clone(),
            clock,
            jobs.clone(),
            counters.clone(),
            DispatcherConfig {
                intake_capacity: config.intake_capacity,
                dedup_window: config.dedup_window,
            },
        ));

        Ok(Self {
            config,
            store,
            dispatcher,
            scheduler,
            sender,
            counters,
            cancellation_token: CancellationToken::new(),
            jobs,
            job_receiver: Some(job_receiver),
            worker_pool: None,
            tasks: Vec::new(),
        })
    }

    /// Spawns workers, the fan-out task and the retry sweeper.
    ///
    /// Returns once everything is running. Use `shutdown()` to stop
    /// gracefully.
    ///
    /// # Errors
    ///
    /// Returns `InternalError` if the engine was already started and
    /// `StoreError` if pending-attempt recovery cannot query the store.
    pub async fn start(&mut self) -> Result<()> {
        let receiver = self
            .job_receiver
            .take()
            .ok_or_else(|| DeliveryError::internal("delivery engine already started"))?;

        info!(
            worker_count = self.config.worker_count,
            queue_capacity = self.config.queue_capacity,
            sweep_interval_seconds = self.config.sweep_interval.as_secs(),
            "starting webhook delivery engine"
        );

        let mut worker_pool = WorkerPool::new(
            self.config.worker_count,
            receiver,
            self.sender.clone(),
            self.counters.clone(),
            self.cancellation_token.clone(),
        );
        worker_pool.spawn_workers();
        self.worker_pool = Some(worker_pool);

        if self.config.recover_pending {
            self.recover_pending().await?;
        }

        let dispatcher = self.dispatcher.clone();
        let token = self.cancellation_token.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = dispatcher.run(token).await {
                error!(error = %e, "dispatcher fan-out terminated with error");
            }
        }));

        let scheduler = self.scheduler.clone();
        let token = self.cancellation_token.clone();
        self.tasks.push(tokio::spawn(scheduler.run(token)));

        info!("delivery engine started successfully");
        Ok(())
    }

    /// Re-queues attempts a previous run created but never executed.
    async fn recover_pending(&self) -> Result<()> {
        let query =
            AttemptQuery::default().with_status(AttemptStatus::Pending).limit(RECOVERY_LIMIT);
        let pending = self.store.query(&query).await?;

        if pending.is_empty() {
            return Ok(());
        }

        info!(count = pending.len(), "re-queueing pending delivery attempts");
        // Oldest first so recovered deliveries keep their original order
        for attempt in pending.iter().rev() {
            if self.jobs.send(DeliveryJob::from(attempt)).await.is_err() {
                warn!("job queue closed during recovery");
                break;
            }
        }

        Ok(())
    }

    /// Accepts an event for asynchronous delivery. See [`Dispatcher::emit`].
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` under backpressure and `ShutdownRequested` after
    /// shutdown.
    pub fn emit(&self, event: Event) -> Result<EventId> {
        self.dispatcher.emit(event)
    }

    /// Returns the dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Returns the retry scheduler, for running a sweep on demand.
    pub fn scheduler(&self) -> &Arc<RetryScheduler> {
        &self.scheduler
    }

    /// Returns the sender.
    pub fn sender(&self) -> &Arc<Sender> {
        &self.sender
    }

    /// Returns current engine statistics.
    pub fn stats(&self) -> EngineStats {
        self.counters.snapshot()
    }

    /// Gracefully shuts down the delivery engine.
    ///
    /// Stops intake, lets workers finish in-flight deliveries and joins every
    /// task. Queued jobs that were not started stay pending in the store.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if tasks do not finish within
    /// `shutdown_timeout`, or `WorkerPanic` if a worker panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");
        self.cancellation_token.cancel();

        let timeout = self.config.shutdown_timeout;
        let pool_result = match self.worker_pool.take() {
            Some(worker_pool) => worker_pool.shutdown_graceful(timeout).await,
            None => {
                info!("delivery engine was not started, shutdown completed immediately");
                Ok(())
            },
        };

        let tasks = std::mem::take(&mut self.tasks);
        if tokio::time::timeout(timeout, futures::future::join_all(tasks)).await.is_err() {
            error!(timeout_seconds = timeout.as_secs(), "background tasks did not stop in time");
            return Err(DeliveryError::ShutdownTimeout { timeout });
        }

        pool_result?;
        info!(stats = ?self.counters.snapshot(), "delivery engine stopped");
        Ok(())
    }
}

impl Drop for DeliveryEngine {
    fn drop(&mut self) {
        if !self.tasks.is_empty() && !self.cancellation_token.is_cancelled() {
            warn!("delivery engine dropped without shutdown, cancelling background tasks");
            self.cancellation_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use serde_json::Map;
    use tally_core::{
        Actor, DeliveryAttempt, Entity, InMemoryDeliveryStore, InMemorySubscriptionRegistry,
        NewSubscription, RegistryConfig, SigningSecret, TestClock,
    };
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn test_config() -> EngineConfig {
        EngineConfig {
            worker_count: 2,
            allow_http: true,
            shutdown_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        }
    }

    fn event() -> Event {
        Event {
            id: EventId::new(),
            event_type: "invoice.paid".to_string(),
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            actor: Actor {
                id: "u_1".to_string(),
                username: "ada".to_string(),
                display_name: "Ada".to_string(),
            },
            entity: Entity {
                kind: "invoice".to_string(),
                id: "inv_1".to_string(),
                name: "Invoice 1".to_string(),
            },
            action: "paid".to_string(),
            description: "Ada paid Invoice 1".to_string(),
            data: Map::new(),
        }
    }

    fn parts() -> (TestClock, Arc<InMemorySubscriptionRegistry>, Arc<InMemoryDeliveryStore>) {
        let clock = TestClock::new();
        let registry = Arc::new(InMemorySubscriptionRegistry::new(
            Arc::new(clock.clone()),
            RegistryConfig { allow_http: true },
        ));
        (clock, registry, Arc::new(InMemoryDeliveryStore::new()))
    }

    #[tokio::test]
    async fn engine_delivers_emitted_event() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (clock, registry, store) = parts();
        registry
            .register(NewSubscription::new(
                "all",
                server.uri(),
                SigningSecret::new("whsec_engine"),
                ["*"],
            ))
            .await
            .unwrap();

        let mut engine =
            DeliveryEngine::new(registry, store.clone(), Arc::new(clock), test_config()).unwrap();
        engine.start().await.unwrap();
        engine.emit(event()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.stats().deliveries_succeeded == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let stats = engine.stats();
        assert_eq!(stats.events_accepted, 1);
        assert_eq!(stats.attempts_created, 1);
        assert_eq!(stats.active_workers, 2);

        engine.shutdown().await.unwrap();
        let attempts = store.all().await;
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status(), AttemptStatus::Success);
    }

    #[tokio::test]
    async fn start_recovers_pending_attempts() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let (clock, registry, store) = parts();
        let sub = registry
            .register(NewSubscription::new("all", server.uri(), SigningSecret::new("s"), ["*"]))
            .await
            .unwrap();
        let orphan = DeliveryAttempt::first(
            sub.id,
            EventId::new(),
            "invoice.paid",
            "{}".to_string(),
            "sha256=00".to_string(),
            clock.now(),
        );
        store.insert(orphan.clone()).await.unwrap();

        let mut engine =
            DeliveryEngine::new(registry, store.clone(), Arc::new(clock), test_config()).unwrap();
        engine.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.stats().deliveries_succeeded == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        engine.shutdown().await.unwrap();
        let recovered = store.find(orphan.id).await.unwrap().unwrap();
        assert_eq!(recovered.status(), AttemptStatus::Success);
    }

    #[tokio::test]
    async fn emit_after_shutdown_is_rejected() {
        let (clock, registry, store) = parts();
        let mut engine =
            DeliveryEngine::new(registry, store, Arc::new(clock), test_config()).unwrap();
        engine.start().await.unwrap();

        let dispatcher = engine.dispatcher().clone();
        engine.shutdown().await.unwrap();

        let err = dispatcher.emit(event()).unwrap_err();
        assert!(matches!(err, DeliveryError::ShutdownRequested));
    }

    #[tokio::test]
    async fn engine_cannot_start_twice() {
        let (clock, registry, store) = parts();
        let mut engine =
            DeliveryEngine::new(registry, store, Arc::new(clock), test_config()).unwrap();

        engine.start().await.unwrap();
        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, DeliveryError::InternalError { .. }));

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_without_start_succeeds() {
        let (clock, registry, store) = parts();
        let engine = DeliveryEngine::new(registry, store, Arc::new(clock), test_config()).unwrap();
        engine.shutdown().await.unwrap();
    }
}
