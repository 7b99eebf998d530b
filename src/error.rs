use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

/// Terminal result of a single job.
///
/// Every failure a job can hit is folded into one of these variants before it
/// is reported back to the broker. None of them carry partial image data.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid job payload: {0}")]
    Payload(String),

    #[error("Protocol step failed ({step}): {message}")]
    Protocol { step: ProtocolStep, message: String },

    #[error("{phase} deadline exceeded after {after:?}")]
    Timeout { phase: JobPhase, after: Duration },

    #[error("Image processing failed: {0}")]
    Image(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Browser engine is unrecoverable: {0}")]
    Unrecoverable(String),

    #[error("Semaphore acquire error: {0}")]
    SemaphoreError(String),
}

impl JobError {
    /// Only a failed engine restart stops the service; everything else fails one job.
    pub fn is_fatal(&self) -> bool {
        matches!(self, JobError::Unrecoverable(_))
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            JobError::Payload(_) => ErrorSeverity::Low,
            JobError::Configuration(_) => ErrorSeverity::High,
            JobError::Unrecoverable(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Medium,
        }
    }

    /// Short label used for metrics and failure reports.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Configuration(_) => "configuration",
            JobError::Payload(_) => "payload",
            JobError::Protocol { .. } => "protocol",
            JobError::Timeout { .. } => "timeout",
            JobError::Image(_) => "image",
            JobError::Delivery(_) => "delivery",
            JobError::Unrecoverable(_) => "unrecoverable",
            JobError::SemaphoreError(_) => "semaphore",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// The phase whose deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Render,
    Delivery,
    Job,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobPhase::Render => "render",
            JobPhase::Delivery => "delivery",
            JobPhase::Job => "job",
        };
        f.write_str(name)
    }
}

/// Every command or event wait issued against a protocol session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStep {
    OpenSession,
    SubscribeContentLoaded,
    EnablePage,
    EnableDom,
    SetViewport,
    SetVisibleSize,
    Navigate,
    WaitContentLoaded,
    GetDocument,
    QueryBody,
    GetBoxModel,
    ResizeViewport,
    ResizeVisibleSize,
    CaptureScreenshot,
}

impl fmt::Display for ProtocolStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolStep::OpenSession => "open a protocol session",
            ProtocolStep::SubscribeContentLoaded => "subscribe to DOMContentEventFired",
            ProtocolStep::EnablePage => "enable page events",
            ProtocolStep::EnableDom => "enable DOM events",
            ProtocolStep::SetViewport => "set the initial viewport size",
            ProtocolStep::SetVisibleSize => "set the initial visible size",
            ProtocolStep::Navigate => "navigate to the page",
            ProtocolStep::WaitContentLoaded => "wait for the content to load",
            ProtocolStep::GetDocument => "get the DOM document",
            ProtocolStep::QueryBody => "find the body element",
            ProtocolStep::GetBoxModel => "get the body box model",
            ProtocolStep::ResizeViewport => "set the final viewport size",
            ProtocolStep::ResizeVisibleSize => "set the final visible size",
            ProtocolStep::CaptureScreenshot => "capture the screenshot",
        };
        f.write_str(name)
    }
}

/// Failure reported by the automation channel.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct SessionError(pub String);

impl SessionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<chromiumoxide::error::CdpError> for SessionError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        SessionError(err.to_string())
    }
}

/// Tags a session failure with the step that produced it.
pub trait StepContext<T> {
    fn step(self, step: ProtocolStep) -> Result<T, JobError>;
}

impl<T> StepContext<T> for Result<T, SessionError> {
    fn step(self, step: ProtocolStep) -> Result<T, JobError> {
        self.map_err(|err| JobError::Protocol {
            step,
            message: err.0,
        })
    }
}

#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("initial use counter must be greater than 0, got {0}")]
    InvalidUseCount(i64),

    #[error("unable to start up the engine process: {0}")]
    Launch(String),

    #[error("unable to kill the old engine process: {0}")]
    Terminate(String),

    #[error("engine restart failed: {0}")]
    RestartFailed(String),
}

impl From<PoolError> for JobError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::InvalidUseCount(_) => JobError::Configuration(err.to_string()),
            _ => JobError::Unrecoverable(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("object storage request failed: {0}")]
    Transport(String),

    #[error("object storage rejected the request with status {status}: {message}")]
    Rejected { status: u16, message: String },
}

#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command failed: {0}")]
    Command(String),

    #[error("malformed queue message: {0}")]
    Malformed(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            QueueError::Connection(err.to_string())
        } else {
            QueueError::Command(err.to_string())
        }
    }
}

impl From<AcquireError> for JobError {
    fn from(err: AcquireError) -> Self {
        JobError::SemaphoreError(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Malformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_context_names_the_failing_step() {
        let result: Result<(), SessionError> = Err(SessionError::new("socket closed"));
        let err = result.step(ProtocolStep::Navigate).unwrap_err();

        assert_eq!(
            err.to_string(),
            "Protocol step failed (navigate to the page): socket closed"
        );
        assert_eq!(err.kind(), "protocol");
    }

    #[test]
    fn restart_failures_become_unrecoverable() {
        let err: JobError = PoolError::RestartFailed("exec format error".into()).into();
        assert!(err.is_fatal());
        assert_eq!(err.severity(), ErrorSeverity::Critical);

        let err: JobError = PoolError::InvalidUseCount(0).into();
        assert!(!err.is_fatal());
        assert!(matches!(err, JobError::Configuration(_)));
    }

    #[test]
    fn severity_ranks_bad_input_below_engine_failures() {
        assert_eq!(JobError::Payload("short".into()).severity(), ErrorSeverity::Low);
        let timeout = JobError::Timeout {
            phase: JobPhase::Render,
            after: Duration::from_secs(5),
        };
        assert_eq!(timeout.severity(), ErrorSeverity::Medium);
        assert_eq!(
            JobError::Configuration("bad callback type".into()).severity(),
            ErrorSeverity::High
        );
    }
}
