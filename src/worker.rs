//! Concurrent queue consumer
//!
//! [`WorkerPool`] pops jobs off a [`JobQueue`], checks their class and hands
//! them to the [`Dispatcher`] under a concurrency limit. Failed jobs are
//! reported back to the queue.

use crate::{Dispatcher, JobError, JobQueue, QueuedJob};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Pause after a failed queue read before polling again.
const QUEUE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Pulls jobs off the queue and runs at most `max_concurrent` at once.
///
/// An unrecoverable job error stops the pool: it broadcasts shutdown, stops
/// taking new jobs, waits for the in-flight ones and returns the error.
pub struct WorkerPool {
    dispatcher: Arc<Dispatcher>,
    queue: Arc<dyn JobQueue>,
    job_class: String,
    max_concurrent: usize,
    limiter: Arc<Semaphore>,
    is_running: Arc<AtomicBool>,
    processed_count: Arc<AtomicUsize>,
    error_count: Arc<AtomicUsize>,
    fatal: Arc<Mutex<Option<JobError>>>,
}

impl WorkerPool {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        queue: Arc<dyn JobQueue>,
        job_class: impl Into<String>,
        max_concurrent: usize,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            dispatcher,
            queue,
            job_class: job_class.into(),
            max_concurrent,
            limiter: Arc::new(Semaphore::new(max_concurrent)),
            is_running: Arc::new(AtomicBool::new(false)),
            processed_count: Arc::new(AtomicUsize::new(0)),
            error_count: Arc::new(AtomicUsize::new(0)),
            fatal: Arc::new(Mutex::new(None)),
        }
    }

    /// Runs until `shutdown` fires or a job fails unrecoverably.
    pub async fn run(&self, shutdown: broadcast::Sender<()>) -> Result<(), JobError> {
        info!(
            "Starting worker pool for class {} with {} slots",
            self.job_class, self.max_concurrent
        );
        self.is_running.store(true, Ordering::Relaxed);
        let mut stop = shutdown.subscribe();

        loop {
            let permit = tokio::select! {
                biased;
                _ = stop.recv() => break,
                permit = self.limiter.clone().acquire_owned() => permit?,
            };

            let next = tokio::select! {
                biased;
                _ = stop.recv() => break,
                next = self.queue.next_job() => next,
            };

            let job = match next {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    error!("Failed to read from the queue: {}", e);
                    tokio::select! {
                        _ = sleep(QUEUE_RETRY_DELAY) => continue,
                        _ = stop.recv() => break,
                    }
                }
            };

            let worker = self.clone_handles();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = worker.process(job).await {
                    if e.is_fatal() {
                        error!("Unrecoverable error, stopping the worker pool: {}", e);
                        worker
                            .fatal
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .get_or_insert(e);
                        let _ = shutdown.send(());
                    }
                }
            });
        }

        info!("Worker pool draining in-flight jobs...");
        let _all = self.limiter.acquire_many(self.max_concurrent as u32).await?;
        self.is_running.store(false, Ordering::Relaxed);
        info!(
            "Worker pool stopped. Processed: {}, Errors: {}",
            self.processed_count(),
            self.error_count()
        );

        match self
            .fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn process(&self, job: QueuedJob) -> Result<(), JobError> {
        let result = if job.class == self.job_class {
            self.dispatcher.dispatch(&job.args).await.map(|receipt| {
                debug!("Job {} delivered", receipt.job_id);
            })
        } else {
            Err(JobError::Payload(format!(
                "unexpected job class '{}', expected '{}'",
                job.class, self.job_class
            )))
        };

        match &result {
            Ok(()) => {
                self.processed_count.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                if let Err(report) = self.queue.report_failure(&job, e).await {
                    warn!("Failed to report a job failure: {}", report);
                }
            }
        }
        result
    }

    fn clone_handles(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            queue: self.queue.clone(),
            job_class: self.job_class.clone(),
            max_concurrent: self.max_concurrent,
            limiter: self.limiter.clone(),
            is_running: self.is_running.clone(),
            processed_count: self.processed_count.clone(),
            error_count: self.error_count.clone(),
            fatal: self.fatal.clone(),
        }
    }

    pub fn get_stats(&self) -> WorkerStats {
        WorkerStats {
            is_running: self.is_running(),
            in_flight: self.max_concurrent - self.limiter.available_permits(),
            processed_count: self.processed_count(),
            error_count: self.error_count(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    pub fn processed_count(&self) -> usize {
        self.processed_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> usize {
        self.error_count.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub is_running: bool,
    pub in_flight: usize,
    pub processed_count: usize,
    pub error_count: usize,
}
