//! Correlation of outgoing jobs with their incoming callbacks
//!
//! The gateway registers a pending completion per request and blocks on it;
//! the callback endpoint resolves it by key. An entry is removed exactly once:
//! by the callback that resolves it, by its own waiter giving up, or by the
//! expiry sweep.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// What a callback delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackResult {
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug)]
struct PendingCompletion {
    created_at: Instant,
    tx: oneshot::Sender<CallbackResult>,
}

#[derive(Debug, Default)]
pub struct CallbackRegistry {
    pending: DashMap<String, PendingCompletion>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a pending completion under a fresh key.
    pub fn register(self: &Arc<Self>) -> PendingCallback {
        let key = crate::random_key();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            key.clone(),
            PendingCompletion {
                created_at: Instant::now(),
                tx,
            },
        );
        self.record_len();

        PendingCallback {
            registry: Arc::clone(self),
            key,
            rx: Some(rx),
        }
    }

    /// Hands `result` to the waiter registered under `key`.
    ///
    /// Returns false for unknown keys, including keys already resolved or
    /// expired.
    pub fn resolve(&self, key: &str, result: CallbackResult) -> bool {
        let Some((_, pending)) = self.pending.remove(key) else {
            return false;
        };
        self.record_len();
        // The waiter may have given up between the removal and the send.
        pending.tx.send(result).is_ok()
    }

    /// Drops every entry older than `ttl`, returning how many were removed.
    pub fn purge_expired(&self, ttl: Duration) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, pending| pending.created_at.elapsed() < ttl);
        let removed = before.saturating_sub(self.pending.len());
        if removed > 0 {
            self.record_len();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    /// Periodically purges entries older than `ttl` until shutdown.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        ttl: Duration,
        every: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.purge_expired(ttl);
                        if removed > 0 {
                            info!("Swept {} expired pending callbacks", removed);
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            debug!("Callback sweeper stopped");
        })
    }

    fn record_len(&self) {
        metrics::gauge!("screenshot_pending_callbacks").set(self.pending.len() as f64);
    }
}

/// A registered request waiting for its callback.
///
/// Dropping it, or timing out in [`PendingCallback::wait`], removes the entry.
#[derive(Debug)]
pub struct PendingCallback {
    registry: Arc<CallbackRegistry>,
    key: String,
    rx: Option<oneshot::Receiver<CallbackResult>>,
}

impl PendingCallback {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Waits up to `limit` for the callback. `None` means it never arrived
    /// or the entry expired first.
    pub async fn wait(mut self, limit: Duration) -> Option<CallbackResult> {
        let rx = self.rx.take()?;
        match timeout(limit, rx).await {
            Ok(Ok(result)) => Some(result),
            Ok(Err(_)) => None,
            Err(_) => {
                debug!("Gave up waiting for callback {}", self.key);
                None
            }
        }
    }
}

impl Drop for PendingCallback {
    fn drop(&mut self) {
        if self.registry.pending.remove(&self.key).is_some() {
            self.registry.record_len();
        }
    }
}
