//! Ephemeral HTTP server for inline HTML
//!
//! Jobs that carry a document instead of a URL register it here under a
//! random key; the engine then loads `http://<content_bind>/<key>`. Entries
//! live exactly as long as the job holds its [`ContentRegistration`].

use crate::random_key;
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct ContentServer {
    pages: DashMap<String, String>,
}

impl ContentServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `html` under a fresh key until the registration is dropped.
    pub fn register(self: &Arc<Self>, html: impl Into<String>) -> ContentRegistration {
        let key = random_key();
        self.pages.insert(key.clone(), html.into());
        debug!("Registered inline content {}", key);
        ContentRegistration {
            server: Arc::clone(self),
            key,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.pages.get(key).map(|page| page.value().clone())
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Read-only router answering `GET /<key>`.
    pub fn router(self: &Arc<Self>) -> Router {
        let server = Arc::clone(self);
        Router::new().fallback(move |uri: Uri| {
            let server = server.clone();
            async move { server.lookup(uri.path()) }
        })
    }

    fn lookup(&self, path: &str) -> Response {
        if path.len() < 2 {
            return (StatusCode::BAD_REQUEST, "uri too short").into_response();
        }

        match self.get(&path[1..]) {
            Some(html) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                html,
            )
                .into_response(),
            None => (StatusCode::NOT_FOUND, "key not found").into_response(),
        }
    }

    /// Serves the router on `listener` until `shutdown` resolves.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        info!("Content server listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
    }
}

/// Keeps one inline document reachable; dropping it unregisters the key.
#[derive(Debug)]
pub struct ContentRegistration {
    server: Arc<ContentServer>,
    key: String,
}

impl ContentRegistration {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Address the engine fetches this document from.
    pub fn url(&self, base_url: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), self.key)
    }
}

impl Drop for ContentRegistration {
    fn drop(&mut self) {
        self.server.pages.remove(&self.key);
        debug!("Unregistered inline content {}", self.key);
    }
}
