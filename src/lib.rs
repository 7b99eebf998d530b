//! # Screenshot Worker
//!
//! A queue-driven screenshot service. Workers pull jobs off a Redis list,
//! render them in one shared headless Chrome instance over the DevTools
//! protocol and deliver the image either as an object-storage upload or as
//! a raw HTTP POST to the job's callback URL.
//!
//! ## Pipeline
//!
//! 1. A job arrives as an 11-element positional array (see [`JobDescriptor`]).
//! 2. Inline HTML is published on the local [`ContentServer`] under a random
//!    key so the engine can navigate to it.
//! 3. The [`EnginePool`] hands out the shared engine and recycles it after a
//!    fixed number of uses.
//! 4. [`take_screenshot`] drives one protocol session through viewport setup,
//!    navigation, optional full-page measurement and capture, then
//!    [`rescale`] applies the output scale factor.
//! 5. The [`Dispatcher`] delivers the image and reports the outcome.
//!
//! Every job runs under a hard deadline of
//! `delay + screenshot_timeout + callback_timeout`. Within it, rendering is
//! bounded by `delay + screenshot_timeout` counted from when the engine is
//! ready, and delivery by `callback_timeout`.
//!
//! ## Synchronous front end
//!
//! The `gateway` command accepts `POST /screenshot`, enqueues a job whose
//! callback points back at itself and answers once `POST /callback?key=...`
//! arrives (see [`GatewayState`]).
//!
//! ## CLI Usage
//!
//! ```bash
//! screenshot-worker --config worker.json worker
//! screenshot-worker --config worker.json gateway
//! screenshot-worker render --url https://example.com --output shot.png --full-page
//! screenshot-worker validate --config worker.json
//! ```

/// Configuration and settings for the worker
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Shared browser engine process with use-count recycling
pub mod engine_pool;

/// DevTools protocol sessions against the running engine
pub mod session;

/// Capture procedure and image rescaling
pub mod screenshot;

/// Positional job payloads
pub mod job;

/// Per-job orchestration: render under deadline, then deliver
pub mod dispatcher;

/// Ephemeral HTTP server for inline HTML
pub mod content_server;

/// Pending-callback registry for the gateway
pub mod callbacks;

/// S3-compatible object storage
pub mod storage;

/// Request signing for object storage
pub mod signing;

/// Redis work queue
pub mod queue;

/// Concurrent queue consumer
pub mod worker;

/// Synchronous HTTP front end
pub mod gateway;

/// Command-line interface implementation
pub mod cli;

/// Prometheus metrics
pub mod metrics;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod testing;


pub use callbacks::*;
pub use cli::*;
pub use config::*;
pub use content_server::*;
pub use dispatcher::*;
pub use engine_pool::*;
pub use error::*;
pub use gateway::{CallbackQuery, GatewayState, ScreenshotRequest};
pub use job::*;
pub use self::metrics::*;
pub use queue::*;
pub use screenshot::*;
pub use session::*;
pub use signing::{Credentials, SignedHeaders, Signer};
pub use storage::*;
pub use utils::*;
pub use worker::*;
