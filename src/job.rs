//! Job descriptors and their positional wire form
//!
//! Brokers deliver a job as a JSON array of eleven positional values:
//! `[html, url, width, height, scaling, delay_ms, full_page, format, quality,
//! callback, callback_type]`. Decoding is strict; a value of the wrong type
//! fails the job instead of being coerced.

use crate::{CaptureRequest, JobError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;

/// How a finished image reaches the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallbackType {
    /// Upload to object storage and POST the object URL
    #[default]
    S3,
    /// POST the raw image bytes
    Blob,
}

impl CallbackType {
    /// An empty value selects [`CallbackType::S3`].
    pub fn parse(value: &str) -> Result<Self, JobError> {
        match value {
            "" | "s3" => Ok(CallbackType::S3),
            "blob" => Ok(CallbackType::Blob),
            other => Err(JobError::Configuration(format!(
                "invalid callback type '{other}', expected blob or s3"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackType::S3 => "s3",
            CallbackType::Blob => "blob",
        }
    }
}

impl fmt::Display for CallbackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct JobPayload(
    String,
    String,
    i64,
    i64,
    f64,
    i64,
    bool,
    String,
    i64,
    String,
    String,
);

/// One page-rendering request plus its delivery instructions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobDescriptor {
    /// Inline document; takes precedence over `url` when non-empty
    pub html: String,
    pub url: String,
    pub width: i64,
    pub height: i64,
    pub scaling: f64,
    pub delay_ms: i64,
    pub full_page: bool,
    pub format: String,
    pub quality: i64,
    pub callback: String,
    #[serde(skip)]
    pub callback_type: CallbackType,
}

impl JobDescriptor {
    /// Decodes the positional argument list of a queued job.
    pub fn from_args(args: &[Value]) -> Result<Self, JobError> {
        let JobPayload(
            html,
            url,
            width,
            height,
            scaling,
            delay_ms,
            full_page,
            format,
            quality,
            callback,
            callback_type,
        ) = serde_json::from_value(Value::Array(args.to_vec()))
            .map_err(|e| JobError::Payload(e.to_string()))?;

        Ok(Self {
            html,
            url,
            width,
            height,
            scaling,
            delay_ms,
            full_page,
            format,
            quality,
            callback,
            callback_type: CallbackType::parse(&callback_type)?,
        })
    }

    /// Positional wire form, the inverse of [`JobDescriptor::from_args`].
    pub fn to_args(&self) -> Vec<Value> {
        vec![
            json!(self.html),
            json!(self.url),
            json!(self.width),
            json!(self.height),
            json!(self.scaling),
            json!(self.delay_ms),
            json!(self.full_page),
            json!(self.format),
            json!(self.quality),
            json!(self.callback),
            json!(self.callback_type.as_str()),
        ]
    }

    pub fn has_inline_html(&self) -> bool {
        !self.html.is_empty()
    }

    /// Negative delays count as none.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.max(0) as u64)
    }

    pub fn capture_request(&self, target_url: impl Into<String>) -> CaptureRequest {
        CaptureRequest {
            url: target_url.into(),
            width: self.width,
            height: self.height,
            scale: self.scaling,
            delay: self.delay(),
            full_page: self.full_page,
            format: self.format.clone(),
            quality: self.quality,
        }
    }
}
