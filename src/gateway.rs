//! Edge HTTP surface for synchronous callers
//!
//! `POST /screenshot` enqueues a job whose callback points back at this
//! gateway and holds the request open until `POST /callback?key=...` delivers
//! the result.

use crate::{
    CallbackRegistry, CallbackResult, CallbackType, GatewayConfig, JobDescriptor, JobQueue,
    QueuedJob,
};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use url::Url;

/// Body of `POST /screenshot`: a job without its callback URL.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScreenshotRequest {
    pub html: String,
    pub url: String,
    pub width: i64,
    pub height: i64,
    pub scaling: f64,
    /// Milliseconds to wait after the content loaded
    pub delay: i64,
    pub full_page: bool,
    pub format: String,
    pub quality: i64,
    pub callback_type: String,
}

impl Default for ScreenshotRequest {
    fn default() -> Self {
        Self {
            html: String::new(),
            url: String::new(),
            width: 1280,
            height: 800,
            scaling: 1.0,
            delay: 0,
            full_page: false,
            format: String::new(),
            quality: 0,
            callback_type: String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub key: String,
}

pub struct GatewayState {
    pub queue: Arc<dyn JobQueue>,
    pub registry: Arc<CallbackRegistry>,
    pub callback_base: Url,
    pub job_class: String,
    pub request_timeout: Duration,
}

impl GatewayState {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        registry: Arc<CallbackRegistry>,
        config: &GatewayConfig,
        job_class: impl Into<String>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            queue,
            registry,
            callback_base: Url::parse(&config.callback_base)?,
            job_class: job_class.into(),
            request_timeout: config.request_timeout,
        })
    }

    fn callback_url(&self, key: &str) -> String {
        let mut url = self.callback_base.clone();
        url.query_pairs_mut().append_pair("key", key);
        url.into()
    }
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/screenshot", post(screenshot_handler))
        .route("/callback", post(callback_handler))
        .with_state(state)
}

/// Serves the gateway on `listener` until `shutdown` resolves.
pub async fn serve(
    state: Arc<GatewayState>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    info!("Gateway listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn screenshot_handler(
    State(state): State<Arc<GatewayState>>,
    Json(request): Json<ScreenshotRequest>,
) -> Response {
    let callback_type = match CallbackType::parse(&request.callback_type) {
        Ok(callback_type) => callback_type,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let pending = state.registry.register();
    let job = JobDescriptor {
        html: request.html,
        url: request.url,
        width: request.width,
        height: request.height,
        scaling: request.scaling,
        delay_ms: request.delay,
        full_page: request.full_page,
        format: request.format,
        quality: request.quality,
        callback: state.callback_url(pending.key()),
        callback_type,
    };

    if let Err(e) = state
        .queue
        .push(&QueuedJob::new(state.job_class.clone(), job.to_args()))
        .await
    {
        error!("Failed to enqueue screenshot job: {}", e);
        return (StatusCode::SERVICE_UNAVAILABLE, "unable to enqueue the job").into_response();
    }
    debug!("Enqueued job for callback {}", pending.key());

    match pending.wait(state.request_timeout).await {
        Some(result) => {
            let content_type = result
                .content_type
                .unwrap_or_else(|| "application/octet-stream".to_string());
            ([(header::CONTENT_TYPE, content_type)], result.body).into_response()
        }
        None => {
            warn!("No callback within {:?}", state.request_timeout);
            (StatusCode::GATEWAY_TIMEOUT, "timed out waiting for the screenshot").into_response()
        }
    }
}

async fn callback_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<CallbackQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let result = CallbackResult {
        content_type,
        body: body.to_vec(),
    };
    if state.registry.resolve(&query.key, result) {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::NOT_FOUND, "Key not found").into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_until, MemoryQueue};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn state(queue: Arc<MemoryQueue>, timeout: Duration) -> Arc<GatewayState> {
        let config = GatewayConfig {
            callback_base: "http://gateway.test:7000/callback".to_string(),
            request_timeout: timeout,
            ..Default::default()
        };
        Arc::new(
            GatewayState::new(queue, Arc::new(CallbackRegistry::new()), &config, "Screenshot")
                .unwrap(),
        )
    }

    fn screenshot_request(body: &str) -> Request<Body> {
        Request::post("/screenshot")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_request_waits_for_its_callback() {
        let queue = Arc::new(MemoryQueue::default());
        let state = state(queue.clone(), Duration::from_secs(5));
        let app = router(state.clone());

        let caller = tokio::spawn(app.clone().oneshot(screenshot_request(
            r#"{"url": "http://example.test", "width": 640, "height": 480, "callback_type": "blob"}"#,
        )));

        wait_until(|| queue.pending().len() == 1).await;
        let job = queue.pending().remove(0);
        assert_eq!(job.class, "Screenshot");
        let descriptor = JobDescriptor::from_args(&job.args).unwrap();
        assert_eq!(descriptor.url, "http://example.test");
        assert_eq!(descriptor.callback_type, CallbackType::Blob);

        let callback = Url::parse(&descriptor.callback).unwrap();
        assert_eq!(callback.path(), "/callback");
        let key = callback
            .query_pairs()
            .find(|(name, _)| name == "key")
            .map(|(_, value)| value.into_owned())
            .unwrap();

        let delivered = app
            .oneshot(
                Request::post(format!("/callback?key={key}"))
                    .header(header::CONTENT_TYPE, "image/png")
                    .body(Body::from(vec![1u8, 2, 3]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(delivered.status(), StatusCode::OK);

        let response = caller.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), &[1, 2, 3]);
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_callback_key_is_not_found() {
        let app = router(state(Arc::new(MemoryQueue::default()), Duration::from_secs(5)));
        let response = app
            .oneshot(
                Request::post("/callback?key=nope")
                    .body(Body::from("https://objects.test/x.png"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_callback_times_out() {
        let queue = Arc::new(MemoryQueue::default());
        let state = state(queue.clone(), Duration::from_secs(30));

        let response = router(state.clone())
            .oneshot(screenshot_request(r#"{"url": "http://example.test"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(state.registry.is_empty());
        assert_eq!(queue.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_callback_type_is_rejected_up_front() {
        let queue = Arc::new(MemoryQueue::default());
        let response = router(state(queue.clone(), Duration::from_secs(5)))
            .oneshot(screenshot_request(r#"{"url": "http://example.test", "callback_type": "ftp"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(queue.pending().is_empty());
    }
}
