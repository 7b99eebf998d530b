//! Resque-compatible work queue
//!
//! Jobs are JSON objects `{"class": ..., "args": [...]}` pushed onto the
//! Redis list `<namespace>queue:<queue>`. Failed jobs are recorded on
//! `<namespace>failed` in the shape Resque's failure backend expects, so the
//! broker's own tooling can inspect and retry them.

use crate::{JobError, QueueConfig, QueueError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use tracing::{debug, info};

/// One job as it travels through the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub class: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl QueuedJob {
    pub fn new(class: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            class: class.into(),
            args,
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Waits up to one poll interval for the next job.
    async fn next_job(&self) -> Result<Option<QueuedJob>, QueueError>;

    async fn push(&self, job: &QueuedJob) -> Result<(), QueueError>;

    async fn report_failure(&self, job: &QueuedJob, error: &JobError) -> Result<(), QueueError>;
}

/// Builds the Resque failure record for `job`.
pub fn failure_record(
    job: &QueuedJob,
    error: &JobError,
    worker: &str,
    queue: &str,
    failed_at: DateTime<Utc>,
) -> Value {
    json!({
        "failed_at": failed_at.to_rfc3339(),
        "payload": job,
        "exception": format!("JobError::{}", error.kind()),
        "error": error.to_string(),
        "backtrace": [],
        "worker": worker,
        "queue": queue,
    })
}

#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    queue_key: String,
    failed_key: String,
    queue: String,
    poll_timeout: f64,
    worker_id: String,
}

impl fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisQueue")
            .field("connection", &"ConnectionManager")
            .field("queue_key", &self.queue_key)
            .finish()
    }
}

impl RedisQueue {
    pub async fn connect(config: &QueueConfig) -> Result<Self, QueueError> {
        info!("Connecting to Redis at {}", config.redis_url);

        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| QueueError::Connection(format!("invalid Redis URL: {e}")))?;
        let conn = ConnectionManager::new(client).await?;

        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Ok(Self {
            conn,
            queue_key: config.queue_key(),
            failed_key: config.failed_key(),
            queue: config.queue.clone(),
            poll_timeout: config.poll_interval.as_secs_f64().max(0.1),
            worker_id: format!("{}:{}:{}", host, std::process::id(), config.queue),
        })
    }

    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn next_job(&self) -> Result<Option<QueuedJob>, QueueError> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> =
            conn.blpop(&self.queue_key, self.poll_timeout).await?;

        match popped {
            Some((_, raw)) => {
                debug!("Popped job from {}", self.queue_key);
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn push(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let raw = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(&self.queue_key, raw).await?;
        Ok(())
    }

    async fn report_failure(&self, job: &QueuedJob, error: &JobError) -> Result<(), QueueError> {
        let record = failure_record(job, error, &self.worker_id, &self.queue, Utc::now());
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(&self.failed_key, record.to_string())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_job_wire_format() {
        let job: QueuedJob =
            serde_json::from_str(r#"{"class":"Screenshot","args":["", "http://a.test", 800]}"#)
                .unwrap();
        assert_eq!(job.class, "Screenshot");
        assert_eq!(job.args.len(), 3);

        let raw = serde_json::to_value(QueuedJob::new("Screenshot", vec![json!(1)])).unwrap();
        assert_eq!(raw, json!({"class": "Screenshot", "args": [1]}));
    }

    #[test]
    fn test_missing_args_default_to_empty() {
        let job: QueuedJob = serde_json::from_str(r#"{"class":"Screenshot"}"#).unwrap();
        assert!(job.args.is_empty());
    }

    #[test]
    fn test_failure_record_shape() {
        let job = QueuedJob::new("Screenshot", vec![json!("")]);
        let error = JobError::Delivery("connection reset".to_string());
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let record = failure_record(&job, &error, "host:42:screenshots", "screenshots", at);
        assert_eq!(record["failed_at"], "2024-05-01T12:00:00+00:00");
        assert_eq!(record["payload"]["class"], "Screenshot");
        assert_eq!(record["exception"], "JobError::delivery");
        assert_eq!(record["error"], "Delivery failed: connection reset");
        assert_eq!(record["queue"], "screenshots");
    }
}
