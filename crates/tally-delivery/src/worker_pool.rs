//! Bounded worker pool executing delivery jobs.
//!
//! The dispatcher and the retry scheduler push [`DeliveryJob`]s onto one
//! bounded channel; `worker_count` tasks share its receiver and hand each job
//! to a [`JobHandler`]. At most `worker_count` jobs run at once, so at most
//! that many HTTP calls are in flight.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tally_core::{AttemptId, DeliveryAttempt};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    stats::{DeliveryCounters, GaugeGuard},
};

/// Work item for one pending attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryJob {
    /// Attempt to execute.
    pub attempt_id: AttemptId,
    /// Attempt number, for logging.
    pub attempt_number: u32,
}

impl From<&DeliveryAttempt> for DeliveryJob {
    fn from(attempt: &DeliveryAttempt) -> Self {
        Self { attempt_id: attempt.id, attempt_number: attempt.attempt_number }
    }
}

/// Sending half of the job channel.
pub type JobQueue = mpsc::Sender<DeliveryJob>;

/// Creates the bounded job channel.
pub fn job_queue(capacity: usize) -> (JobQueue, mpsc::Receiver<DeliveryJob>) {
    mpsc::channel(capacity.max(1))
}

/// Executes one job. Implemented by the sender.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Runs the job to completion. Failures are the handler's to record.
    async fn handle(&self, job: DeliveryJob);
}

/// Worker pool that manages delivery worker tasks with supervision.
pub struct WorkerPool {
    worker_count: usize,
    receiver: Arc<Mutex<mpsc::Receiver<DeliveryJob>>>,
    handler: Arc<dyn JobHandler>,
    counters: Arc<DeliveryCounters>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Creates a pool over the receiving half of a job queue.
    pub fn new(
        worker_count: usize,
        receiver: mpsc::Receiver<DeliveryJob>,
        handler: Arc<dyn JobHandler>,
        counters: Arc<DeliveryCounters>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            worker_count: worker_count.max(1),
            receiver: Arc::new(Mutex::new(receiver)),
            handler,
            counters,
            cancellation_token,
            worker_handles: Vec::new(),
        }
    }

    /// Spawns all configured workers.
    ///
    /// Returns immediately after spawning. Workers run until the cancellation
    /// token fires or every sender of the job queue is dropped.
    pub fn spawn_workers(&mut self) {
        info!(worker_count = self.worker_count, "spawning delivery workers");

        for worker_id in 0..self.worker_count {
            let receiver = self.receiver.clone();
            let handler = self.handler.clone();
            let counters = self.counters.clone();
            let token = self.cancellation_token.clone();

            let handle = tokio::spawn(async move {
                let _alive = GaugeGuard::enter(&counters.active_workers);
                debug!(worker_id, "delivery worker starting");

                worker_loop(worker_id, &receiver, handler.as_ref(), &counters, &token).await;

                debug!(worker_id, "delivery worker stopped");
            });

            self.worker_handles.push(handle);
        }
    }

    /// Stops all workers, waiting for in-flight jobs to finish.
    ///
    /// Jobs still queued are left behind; their attempts stay pending in the
    /// store and are picked up again by pending-attempt recovery on the next
    /// start.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers do not finish in time and
    /// `WorkerPanic` if a worker panicked.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();
        let handles = std::mem::take(&mut self.worker_handles);

        match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(results) => {
                let mut first_panic = None;
                for (worker_id, result) in results.into_iter().enumerate() {
                    if let Err(join_error) = result {
                        error!(worker_id, error = %join_error, "worker task panicked");
                        first_panic.get_or_insert(DeliveryError::WorkerPanic {
                            worker_id,
                            error: join_error.to_string(),
                        });
                    }
                }

                match first_panic {
                    Some(err) => Err(err),
                    None => {
                        info!("worker pool shutdown completed");
                        Ok(())
                    },
                }
            },
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Check if any workers are still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active_count = self.worker_handles.iter().filter(|h| !h.is_finished()).count();

        if active_count > 0 && !self.cancellation_token.is_cancelled() {
            warn!(
                active_workers = active_count,
                "worker pool dropped without shutdown_graceful, cancelling workers"
            );
            self.cancellation_token.cancel();
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: &Mutex<mpsc::Receiver<DeliveryJob>>,
    handler: &dyn JobHandler,
    counters: &DeliveryCounters,
    token: &CancellationToken,
) {
    loop {
        let job = {
            let mut guard = receiver.lock().await;
            tokio::select! {
                biased;
                () = token.cancelled() => None,
                job = guard.recv() => job,
            }
        };

        let Some(job) = job else { break };

        debug!(
            worker_id,
            attempt_id = %job.attempt_id,
            attempt_number = job.attempt_number,
            "processing delivery job"
        );

        let _in_flight = GaugeGuard::enter(&counters.in_flight);
        handler.handle(job).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Notify;

    use super::*;

    #[derive(Default)]
    struct CountingHandler {
        handled: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
        done: Notify,
        delay: Duration,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: DeliveryJob) {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.handled.fetch_add(1, Ordering::SeqCst);
            self.done.notify_one();
        }
    }

    fn job() -> DeliveryJob {
        DeliveryJob { attempt_id: AttemptId::new(), attempt_number: 1 }
    }

    #[tokio::test]
    async fn workers_process_queued_jobs() {
        let handler = Arc::new(CountingHandler::default());
        let (queue, receiver) = job_queue(16);
        let counters = Arc::new(DeliveryCounters::new());
        let mut pool =
            WorkerPool::new(2, receiver, handler.clone(), counters, CancellationToken::new());
        pool.spawn_workers();

        for _ in 0..5 {
            queue.send(job()).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.handled.load(Ordering::SeqCst) < 5 {
                handler.done.notified().await;
            }
        })
        .await
        .unwrap();

        pool.shutdown_graceful(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_worker_count() {
        let handler =
            Arc::new(CountingHandler { delay: Duration::from_millis(50), ..Default::default() });
        let (queue, receiver) = job_queue(32);
        let counters = Arc::new(DeliveryCounters::new());
        let mut pool =
            WorkerPool::new(3, receiver, handler.clone(), counters, CancellationToken::new());
        pool.spawn_workers();

        for _ in 0..12 {
            queue.send(job()).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.handled.load(Ordering::SeqCst) < 12 {
                handler.done.notified().await;
            }
        })
        .await
        .unwrap();

        assert!(handler.max_running.load(Ordering::SeqCst) <= 3);
        pool.shutdown_graceful(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_job() {
        let handler =
            Arc::new(CountingHandler { delay: Duration::from_millis(200), ..Default::default() });
        let (queue, receiver) = job_queue(4);
        let counters = Arc::new(DeliveryCounters::new());
        let mut pool = WorkerPool::new(
            1,
            receiver,
            handler.clone(),
            counters.clone(),
            CancellationToken::new(),
        );
        pool.spawn_workers();

        queue.send(job()).await.unwrap();
        while handler.running.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        pool.shutdown_graceful(Duration::from_secs(2)).await.unwrap();

        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
        assert_eq!(counters.snapshot().in_flight, 0);
        assert_eq!(counters.snapshot().active_workers, 0);
    }

    #[tokio::test]
    async fn shutdown_times_out_on_stuck_job() {
        let handler =
            Arc::new(CountingHandler { delay: Duration::from_secs(10), ..Default::default() });
        let (queue, receiver) = job_queue(4);
        let mut pool = WorkerPool::new(
            1,
            receiver,
            handler.clone(),
            Arc::new(DeliveryCounters::new()),
            CancellationToken::new(),
        );
        pool.spawn_workers();

        queue.send(job()).await.unwrap();
        while handler.running.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let err = pool.shutdown_graceful(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::ShutdownTimeout { .. }));
    }
}
