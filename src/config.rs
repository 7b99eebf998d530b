//! Configuration management with serde serialization/deserialization
//!
//! This module provides the configuration structures for the worker, the
//! browser engine it recycles, the work queue, object storage and the edge
//! gateway. Defaults match a single-host deployment with the engine listening
//! on the standard remote debugging port.

use crate::{Credentials, JobError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure for the screenshot worker
///
/// # Examples
///
/// ```rust
/// use screenshot_worker::Config;
///
/// let config = Config {
///     max_concurrent_jobs: 4,
///     ..Default::default()
/// };
/// assert!(screenshot_worker::validate_config(&config).is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// The pooled browser engine process
    pub engine: EngineConfig,

    /// Listen address of the ephemeral content server (default: 127.0.0.1:8001)
    ///
    /// The engine fetches inline HTML from here, so it must be reachable from
    /// the engine process.
    pub content_bind: String,

    /// Render budget per job, excluding the job's own delay (default: 5 seconds)
    pub screenshot_timeout: Duration,

    /// Delivery budget per job (default: 5 seconds)
    pub callback_timeout: Duration,

    /// Maximum number of jobs rendered in parallel (default: 25)
    pub max_concurrent_jobs: usize,

    pub queue: QueueConfig,

    pub storage: StorageConfig,

    pub gateway: GatewayConfig,

    /// Prometheus scrape address, disabled when unset
    pub metrics_bind: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            content_bind: "127.0.0.1:8001".to_string(),
            screenshot_timeout: Duration::from_secs(5),
            callback_timeout: Duration::from_secs(5),
            max_concurrent_jobs: 25,
            queue: QueueConfig::default(),
            storage: StorageConfig::default(),
            gateway: GatewayConfig::default(),
            metrics_bind: None,
        }
    }
}

impl Config {
    /// Base URL the engine uses to fetch inline HTML by key.
    pub fn content_base_url(&self) -> String {
        format!("http://{}", self.content_bind)
    }
}

/// Browser engine process settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Executable name or path, resolved against PATH (default: google-chrome)
    pub chrome_path: String,

    /// Command-line flags passed on every (re)start
    pub chrome_flags: Vec<String>,

    /// Jobs served before the process is recycled (default: 1000)
    ///
    /// Long-running engines leak memory; recycling bounds the growth.
    pub uses_per_instance: i64,

    /// Wait after spawning before the engine is considered reachable (default: 3 seconds)
    pub start_delay: Duration,

    /// Remote debugging discovery endpoint (default: http://127.0.0.1:9222)
    pub debugging_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chrome_path: "google-chrome".to_string(),
            chrome_flags: default_chrome_flags(),
            uses_per_instance: 1000,
            start_delay: Duration::from_secs(3),
            debugging_url: "http://127.0.0.1:9222".to_string(),
        }
    }
}

/// Resque-compatible work queue settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    pub redis_url: String,
    pub namespace: String,
    pub queue: String,
    /// Job class accepted from the queue
    pub job_class: String,
    /// How long a single pop blocks before checking for shutdown
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://redis:6379/".to_string(),
            namespace: "resque:".to_string(),
            queue: "screenshots".to_string(),
            job_class: "Screenshot".to_string(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl QueueConfig {
    pub fn queue_key(&self) -> String {
        format!("{}queue:{}", self.namespace, self.queue)
    }

    pub fn failed_key(&self) -> String {
        format!("{}failed", self.namespace)
    }
}

/// S3-compatible object storage settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Endpoint URL, or `host:port` with the scheme picked by `use_ssl`
    pub endpoint: String,
    pub use_ssl: bool,
    pub bucket: String,
    pub region: String,
    /// Public prefix of uploaded objects, reported to callbacks
    pub base_path: String,
    /// Requests are signed when both keys are set, anonymous otherwise
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localstack:8000".to_string(),
            use_ssl: false,
            bucket: "screenshots-demo".to_string(),
            region: "eu-west-1".to_string(),
            base_path: "https://s3-eu-west-1.amazonaws.com/screenshots-demo".to_string(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
        }
    }
}

impl StorageConfig {
    pub fn endpoint_url(&self) -> String {
        if self.endpoint.contains("://") {
            self.endpoint.clone()
        } else if self.use_ssl {
            format!("https://{}", self.endpoint)
        } else {
            format!("http://{}", self.endpoint)
        }
    }

    pub fn credentials(&self) -> Option<Credentials> {
        if self.access_key_id.is_empty() || self.secret_access_key.is_empty() {
            return None;
        }
        Some(Credentials {
            access_key_id: self.access_key_id.clone(),
            secret_access_key: self.secret_access_key.clone(),
        })
    }
}

/// Edge gateway settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind: String,
    /// Externally reachable URL of the gateway's callback endpoint
    pub callback_base: String,
    /// How long a caller waits for its callback
    pub request_timeout: Duration,
    /// Age after which an unanswered pending callback is swept
    pub pending_ttl: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:7000".to_string(),
            callback_base: "http://127.0.0.1:7000/callback".to_string(),
            request_timeout: Duration::from_secs(30),
            pending_ttl: Duration::from_secs(60),
        }
    }
}

/// Flags the engine is started with unless the configuration overrides them
pub fn default_chrome_flags() -> Vec<String> {
    vec![
        "--headless".to_string(),
        "--disable-gpu".to_string(),
        "--remote-debugging-port=9222".to_string(),
        "--no-sandbox".to_string(),
        "--hide-scrollbars".to_string(),
    ]
}

pub fn validate_config(config: &Config) -> Result<(), JobError> {
    if config.engine.uses_per_instance <= 0 {
        return Err(JobError::Configuration(
            "Uses per engine instance must be greater than 0".to_string(),
        ));
    }

    if config.engine.chrome_path.trim().is_empty() {
        return Err(JobError::Configuration(
            "Engine path must not be empty".to_string(),
        ));
    }

    if config.max_concurrent_jobs == 0 {
        return Err(JobError::Configuration(
            "Max concurrent jobs must be greater than 0".to_string(),
        ));
    }

    if config.screenshot_timeout.is_zero() || config.callback_timeout.is_zero() {
        return Err(JobError::Configuration(
            "Screenshot and callback timeouts must be greater than 0".to_string(),
        ));
    }

    if config.storage.access_key_id.is_empty() != config.storage.secret_access_key.is_empty() {
        return Err(JobError::Configuration(
            "Storage access key id and secret must be set together".to_string(),
        ));
    }

    let storage_endpoint = config.storage.endpoint_url();
    for (name, value) in [
        ("engine debugging URL", &config.engine.debugging_url),
        ("storage endpoint", &storage_endpoint),
        ("gateway callback base", &config.gateway.callback_base),
        ("queue redis URL", &config.queue.redis_url),
    ] {
        url::Url::parse(value)
            .map_err(|e| JobError::Configuration(format!("Invalid {name} '{value}': {e}")))?;
    }

    Ok(())
}
