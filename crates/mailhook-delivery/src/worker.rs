//! Queue-facing worker pool.
//!
//! A fixed number of tasks pull jobs from the queue and run them through the
//! handler. Jobs are independent: no ordering across jobs, strictly
//! sequential within one. Cancellation stops workers from taking new jobs
//! but never interrupts a delivery in flight.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use mailhook_core::Job;
use serde::{Deserialize, Serialize};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    handler::{HandleOutcome, NotificationJobHandler},
};

/// The notification queue the worker consumes.
///
/// Persistence, retry scheduling and backoff all belong to the queue; the
/// worker only reports how each attempt went.
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// Waits for the next job; `None` once the queue is closed.
    async fn next_job(&self) -> Option<Job>;

    /// Marks the job done.
    async fn complete(&self, job: &Job);

    /// Marks the attempt failed so the queue can schedule a retry.
    async fn fail(&self, job: &Job, reason: &str);
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of jobs processed concurrently.
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

/// Counters for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Worker tasks currently running.
    pub active_workers: usize,
    /// Jobs currently being handled.
    pub in_flight: usize,
    /// Jobs the handler finished without error, drops included.
    pub completed: u64,
    /// Jobs skipped by resolution.
    pub dropped: u64,
    /// Jobs reported failed to the queue.
    pub failed: u64,
}

/// Pool of workers draining one queue.
pub struct NotifyWorker {
    handler: Arc<NotificationJobHandler>,
    queue: Arc<dyn JobQueue>,
    config: WorkerConfig,
    stats: Arc<RwLock<WorkerStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
}

impl NotifyWorker {
    /// Creates a pool; call `spawn_workers` to start it.
    pub fn new(
        handler: Arc<NotificationJobHandler>,
        queue: Arc<dyn JobQueue>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            handler,
            queue,
            config,
            stats: Arc::new(RwLock::new(WorkerStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_handles: Vec::new(),
        }
    }

    /// Token that stops the pool when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Snapshot of the pool counters.
    pub async fn stats(&self) -> WorkerStats {
        self.stats.read().await.clone()
    }

    /// Spawns the configured number of workers. Returns immediately.
    pub async fn spawn_workers(&mut self) {
        let worker_count = self.config.concurrency.max(1);
        info!(worker_count, "spawning notification workers");

        self.stats.write().await.active_workers = worker_count;

        for worker_id in 0..worker_count {
            let handler = self.handler.clone();
            let queue = self.queue.clone();
            let stats = self.stats.clone();
            let token = self.cancellation_token.clone();

            let handle = tokio::spawn(async move {
                debug!(worker_id, "notification worker starting");
                run_worker(&handler, queue.as_ref(), &stats, &token).await;
                stats.write().await.active_workers -= 1;
                debug!(worker_id, "notification worker stopped");
            });

            self.worker_handles.push(handle);
        }
    }

    /// Waits for every worker to stop on its own, i.e. after the queue
    /// closes.
    ///
    /// # Errors
    ///
    /// Returns `WorkerPanic` for the first worker that panicked.
    pub async fn join(mut self) -> Result<()> {
        join_all(std::mem::take(&mut self.worker_handles)).await
    }

    /// Stops taking new jobs and waits for in-flight jobs to finish.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` when workers are still busy after
    /// `timeout`, or `WorkerPanic` when one of them panicked.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();
        let handles = std::mem::take(&mut self.worker_handles);

        match tokio::time::timeout(timeout, join_all(handles)).await {
            Ok(result) => {
                info!("worker pool shutdown completed");
                result
            },
            Err(_elapsed) => {
                error!(timeout_seconds = timeout.as_secs(), "worker shutdown timed out");
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for NotifyWorker {
    fn drop(&mut self) {
        if !self.worker_handles.is_empty() {
            self.cancellation_token.cancel();
        }
    }
}

async fn join_all(handles: Vec<JoinHandle<()>>) -> Result<()> {
    let mut first_error = None;
    for (worker_id, handle) in handles.into_iter().enumerate() {
        if let Err(join_error) = handle.await {
            error!(worker_id, error = %join_error, "notification worker panicked");
            first_error.get_or_insert(DeliveryError::WorkerPanic {
                worker_id,
                error: join_error.to_string(),
            });
        }
    }
    first_error.map_or(Ok(()), Err)
}

async fn run_worker(
    handler: &NotificationJobHandler,
    queue: &dyn JobQueue,
    stats: &RwLock<WorkerStats>,
    token: &CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            () = token.cancelled() => break,
            job = queue.next_job() => match job {
                Some(job) => job,
                None => break,
            },
        };

        process_job(handler, queue, stats, &job).await;
    }
}

/// Runs one job through the handler and reports the result to the queue.
///
/// Counters and lifecycle hooks are updated before the queue hears about
/// the job, so anyone watching the queue sees them settled.
async fn process_job(
    handler: &NotificationJobHandler,
    queue: &dyn JobQueue,
    stats: &RwLock<WorkerStats>,
    job: &Job,
) {
    stats.write().await.in_flight += 1;

    let result = handler.handle(job).await;

    {
        let mut stats = stats.write().await;
        stats.in_flight -= 1;
        match &result {
            Ok(HandleOutcome::Dropped(_)) => {
                stats.completed += 1;
                stats.dropped += 1;
            },
            Ok(HandleOutcome::Delivered(_)) => stats.completed += 1,
            Err(_) => stats.failed += 1,
        }
    }

    match result {
        Ok(_) => {
            handler.on_completed(job);
            queue.complete(job).await;
        },
        Err(error) => {
            let reason = error.to_string();
            if !error.is_retryable() {
                warn!(job_id = %job.id, error = %error, "failure is unlikely to clear on retry");
            }
            handler.on_failed(job, &reason);
            queue.fail(job, &reason).await;
        },
    }
}

pub mod mock {
    //! In-memory queue for tests.

    use std::{sync::Mutex, time::Duration};

    use async_trait::async_trait;
    use mailhook_core::{Job, JobId};
    use tokio::sync::{mpsc, Mutex as AsyncMutex};

    use super::JobQueue;

    /// Unbounded FIFO queue that records how each job ended.
    #[derive(Debug)]
    pub struct InMemoryQueue {
        sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
        receiver: AsyncMutex<mpsc::UnboundedReceiver<Job>>,
        completed: Mutex<Vec<JobId>>,
        failed: Mutex<Vec<(JobId, String)>>,
    }

    impl Default for InMemoryQueue {
        fn default() -> Self {
            Self::new()
        }
    }

    impl InMemoryQueue {
        /// Creates an open, empty queue.
        pub fn new() -> Self {
            let (sender, receiver) = mpsc::unbounded_channel();
            Self {
                sender: Mutex::new(Some(sender)),
                receiver: AsyncMutex::new(receiver),
                completed: Mutex::new(Vec::new()),
                failed: Mutex::new(Vec::new()),
            }
        }

        /// Enqueues a job; `false` once the queue is closed.
        pub fn push(&self, job: Job) -> bool {
            self.sender
                .lock()
                .ok()
                .and_then(|guard| guard.as_ref().map(|sender| sender.send(job).is_ok()))
                .unwrap_or(false)
        }

        /// Stops accepting jobs; workers exit once the backlog drains.
        pub fn close(&self) {
            if let Ok(mut guard) = self.sender.lock() {
                guard.take();
            }
        }

        /// Ids of completed jobs, in completion order.
        pub fn completed(&self) -> Vec<JobId> {
            self.completed.lock().map(|guard| guard.clone()).unwrap_or_default()
        }

        /// Ids and reasons of failed jobs, in failure order.
        pub fn failed(&self) -> Vec<(JobId, String)> {
            self.failed.lock().map(|guard| guard.clone()).unwrap_or_default()
        }

        /// Polls until `count` jobs have settled or `timeout` elapses.
        pub async fn wait_for_settled(&self, count: usize, timeout: Duration) -> bool {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if self.completed().len() + self.failed().len() >= count {
                    return true;
                }
                if tokio::time::Instant::now() >= deadline {
                    return false;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    #[async_trait]
    impl JobQueue for InMemoryQueue {
        async fn next_job(&self) -> Option<Job> {
            self.receiver.lock().await.recv().await
        }

        async fn complete(&self, job: &Job) {
            if let Ok(mut guard) = self.completed.lock() {
                guard.push(job.id.clone());
            }
        }

        async fn fail(&self, job: &Job, reason: &str) {
            if let Ok(mut guard) = self.failed.lock() {
                guard.push((job.id.clone(), reason.to_string()));
            }
        }
    }
}
