//! Runs one job end to end
//!
//! A job gets a single deadline of `delay + render timeout + callback timeout`.
//! Inside it, rendering is bounded by `delay + render timeout` and delivery by
//! its own callback window.

use crate::{
    random_key, take_screenshot, CallbackType, CaptureRequest, Config, ContentServer, EnginePool,
    ErrorSeverity, ImageResult, JobDescriptor, JobError, JobPhase, Metrics, ObjectStore, ProtocolStep,
    SessionConnector, StepContext,
};
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Per-job limits and delivery targets.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub render_timeout: Duration,
    pub callback_timeout: Duration,
    /// Where the engine reaches the content server
    pub content_base_url: String,
    pub bucket: String,
    /// Public prefix of stored objects, reported to s3 callbacks
    pub base_path: String,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            render_timeout: config.screenshot_timeout,
            callback_timeout: config.callback_timeout,
            content_base_url: config.content_base_url(),
            bucket: config.storage.bucket.clone(),
            base_path: config.storage.base_path.clone(),
        }
    }
}

/// What a successful job delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub job_id: String,
    pub callback_type: CallbackType,
    /// HTTP status returned by the callback endpoint
    pub status: u16,
    /// Public URL of the uploaded object, for s3 callbacks
    pub object_url: Option<String>,
}

pub struct Dispatcher {
    pool: Arc<EnginePool>,
    connector: Arc<dyn SessionConnector>,
    content: Arc<ContentServer>,
    store: Arc<dyn ObjectStore>,
    http: reqwest::Client,
    settings: DispatchSettings,
    metrics: Metrics,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<EnginePool>,
        connector: Arc<dyn SessionConnector>,
        content: Arc<ContentServer>,
        store: Arc<dyn ObjectStore>,
        http: reqwest::Client,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            pool,
            connector,
            content,
            store,
            http,
            settings,
            metrics: Metrics::new(),
        }
    }

    pub fn pool(&self) -> &Arc<EnginePool> {
        &self.pool
    }

    /// Decodes a positional payload and runs it.
    pub async fn dispatch(&self, args: &[Value]) -> Result<DeliveryReceipt, JobError> {
        let job = JobDescriptor::from_args(args)?;
        self.run(&job).await
    }

    pub async fn run(&self, job: &JobDescriptor) -> Result<DeliveryReceipt, JobError> {
        let job_id = random_key();
        let started = Instant::now();
        let budget = job.delay() + self.settings.render_timeout + self.settings.callback_timeout;
        let deadline = started + budget;

        self.metrics.job_started();
        let result = match timeout_at(deadline, self.run_until(&job_id, job, deadline)).await {
            Ok(result) => result,
            Err(_) => Err(JobError::Timeout {
                phase: JobPhase::Job,
                after: budget,
            }),
        };
        self.metrics.job_finished();
        self.metrics
            .record_job(started.elapsed(), result.as_ref().err().map(JobError::kind));

        if let Err(e) = &result {
            match e.severity() {
                ErrorSeverity::Low => info!(job_id = %job_id, kind = e.kind(), "Job rejected: {}", e),
                ErrorSeverity::Medium => warn!(job_id = %job_id, kind = e.kind(), "Job failed: {}", e),
                ErrorSeverity::High | ErrorSeverity::Critical => {
                    error!(job_id = %job_id, kind = e.kind(), "Job failed: {}", e)
                }
            }
        }
        result
    }

    async fn run_until(
        &self,
        job_id: &str,
        job: &JobDescriptor,
        deadline: Instant,
    ) -> Result<DeliveryReceipt, JobError> {
        // Held until the job ends, whatever the outcome.
        let registration = job
            .has_inline_html()
            .then(|| self.content.register(job.html.clone()));
        let target = match &registration {
            Some(registration) => registration.url(&self.settings.content_base_url),
            None => job.url.clone(),
        };
        info!(job_id = %job_id, target = %target, "Started processing");

        let image = self
            .render(job_id, job.capture_request(target), deadline)
            .await?;
        self.deliver(job_id, job, image, deadline).await
    }

    async fn render(
        &self,
        job_id: &str,
        request: CaptureRequest,
        job_deadline: Instant,
    ) -> Result<ImageResult, JobError> {
        let render_budget = request.delay + self.settings.render_timeout;

        let request = &request;
        let image = self
            .pool
            .execute(|| async move {
                debug!(job_id = %job_id, "Acquired the engine");
                // Starts after any restart so the warm-up does not count.
                let started = Instant::now();
                let render_deadline = (started + render_budget).min(job_deadline);
                let result = match timeout_at(render_deadline, self.capture(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(JobError::Timeout {
                        phase: JobPhase::Render,
                        after: render_budget,
                    }),
                };
                if result.is_ok() {
                    self.metrics.record_render(started.elapsed());
                    info!(
                        job_id = %job_id,
                        elapsed = ?started.elapsed(),
                        "Screenshot of {} taken",
                        request.url
                    );
                }
                result
            })
            .await??;

        Ok(image)
    }

    async fn capture(&self, request: &CaptureRequest) -> Result<ImageResult, JobError> {
        let mut session = self
            .connector
            .open()
            .await
            .step(ProtocolStep::OpenSession)?;
        let result = take_screenshot(session.as_mut(), request).await;
        session.close().await;
        result
    }

    async fn deliver(
        &self,
        job_id: &str,
        job: &JobDescriptor,
        image: ImageResult,
        job_deadline: Instant,
    ) -> Result<DeliveryReceipt, JobError> {
        let window = self.settings.callback_timeout;
        let deadline = (Instant::now() + window).min(job_deadline);
        let started = Instant::now();

        let receipt = match timeout_at(deadline, self.post_callback(job_id, job, image)).await {
            Ok(receipt) => receipt?,
            Err(_) => {
                return Err(JobError::Timeout {
                    phase: JobPhase::Delivery,
                    after: window,
                })
            }
        };
        self.metrics.record_delivery(started.elapsed());

        if (200..300).contains(&receipt.status) {
            info!(
                job_id = %job_id,
                "Callback {} - {} done, code was {}",
                receipt.callback_type,
                job.callback,
                receipt.status
            );
        } else {
            warn!(
                job_id = %job_id,
                "Callback {} - {} answered with code {}",
                receipt.callback_type,
                job.callback,
                receipt.status
            );
        }
        Ok(receipt)
    }

    async fn post_callback(
        &self,
        job_id: &str,
        job: &JobDescriptor,
        image: ImageResult,
    ) -> Result<DeliveryReceipt, JobError> {
        let content_type = image.content_type();
        let (request, object_url) = match job.callback_type {
            CallbackType::S3 => {
                let key = format!("{}.{}", job_id, image.format.extension());
                info!(job_id = %job_id, "Starting upload to object storage at {}", key);

                self.store
                    .put(&self.settings.bucket, &key, image.bytes, content_type)
                    .await
                    .map_err(|e| JobError::Delivery(format!("unable to upload the image: {e}")))?;

                let object_url = format!("{}/{}", self.settings.base_path.trim_end_matches('/'), key);
                let request = self
                    .http
                    .post(&job.callback)
                    .header(CONTENT_TYPE, "text/plain")
                    .body(object_url.clone());
                (request, Some(object_url))
            }
            CallbackType::Blob => {
                let request = self
                    .http
                    .post(&job.callback)
                    .header(CONTENT_TYPE, content_type)
                    .body(image.bytes);
                (request, None)
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| JobError::Delivery(format!("unable to post the callback: {e}")))?;

        Ok(DeliveryReceipt {
            job_id: job_id.to_string(),
            callback_type: job.callback_type,
            status: response.status().as_u16(),
            object_url,
        })
    }
}
