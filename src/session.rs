//! Remote automation sessions against the pooled engine
//!
//! A [`ProtocolSession`] is a control channel bound to exactly one automation
//! target. The orchestrator only talks to this trait; [`CdpSession`] implements
//! it over the Chrome DevTools Protocol.

use crate::{ImageFormat, SessionError};
use async_trait::async_trait;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::dom::{
    self, GetBoxModelParams, GetDocumentParams, NodeId, QuerySelectorParams,
};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{
    self, CaptureScreenshotFormat, CaptureScreenshotParams, EventDomContentEventFired,
    NavigateParams,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::page::Page;
use chromiumoxide::types::MethodId;
use chromiumoxide::{Command, Method};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Stream that yields once per "DOM content loaded" event.
pub type ContentLoaded = BoxStream<'static, ()>;

/// `Emulation.setVisibleSize`, deprecated upstream and therefore missing from
/// the generated protocol bindings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetVisibleSizeParams {
    pub width: i64,
    pub height: i64,
}

impl SetVisibleSizeParams {
    pub const IDENTIFIER: &'static str = "Emulation.setVisibleSize";

    pub fn new(width: i64, height: i64) -> Self {
        Self { width, height }
    }
}

impl Method for SetVisibleSizeParams {
    fn identifier(&self) -> MethodId {
        Self::IDENTIFIER.into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct SetVisibleSizeReturns {}

impl Command for SetVisibleSizeParams {
    type Response = SetVisibleSizeReturns;
}

/// One automation target and its message channel.
///
/// Calls are issued strictly one after another; each suspends until the
/// engine replies.
#[async_trait]
pub trait ProtocolSession: Send {
    async fn subscribe_content_loaded(&mut self) -> Result<ContentLoaded, SessionError>;

    async fn enable_page(&mut self) -> Result<(), SessionError>;

    async fn enable_dom(&mut self) -> Result<(), SessionError>;

    /// A scale factor of 0 lets the engine pick the device scale.
    async fn set_device_metrics(
        &mut self,
        width: i64,
        height: i64,
        device_scale_factor: f64,
    ) -> Result<(), SessionError>;

    async fn set_visible_size(&mut self, width: i64, height: i64) -> Result<(), SessionError>;

    async fn navigate(&mut self, url: &str) -> Result<(), SessionError>;

    /// Node id of the document root.
    async fn document_root(&mut self) -> Result<i64, SessionError>;

    async fn query_selector(&mut self, node_id: i64, selector: &str) -> Result<i64, SessionError>;

    /// Height of the node's border box in CSS pixels.
    async fn box_model_height(&mut self, node_id: i64) -> Result<i64, SessionError>;

    async fn capture_screenshot(
        &mut self,
        format: ImageFormat,
        quality: Option<i64>,
    ) -> Result<Vec<u8>, SessionError>;

    /// Releases the target. Errors are logged, never surfaced.
    async fn close(self: Box<Self>);
}

/// Opens fresh sessions against the running engine.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn ProtocolSession>, SessionError>;
}

/// Connects through the engine's remote debugging discovery endpoint.
#[derive(Debug, Clone)]
pub struct CdpConnector {
    debugging_url: String,
}

impl CdpConnector {
    pub fn new(debugging_url: impl Into<String>) -> Self {
        Self {
            debugging_url: debugging_url.into(),
        }
    }
}

#[async_trait]
impl SessionConnector for CdpConnector {
    async fn open(&self) -> Result<Box<dyn ProtocolSession>, SessionError> {
        let (browser, mut handler) = Browser::connect(&self.debugging_url).await?;

        // The handler drives all protocol traffic and must be polled for the
        // lifetime of the connection.
        let handler_task = tokio::spawn(async move {
            loop {
                match handler.next().await {
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("Protocol handler error: {}", e);
                        return Err(e);
                    }
                    None => break,
                }
            }
            Ok(())
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                handler_task.abort();
                return Err(e.into());
            }
        };
        debug!("Acquired target {:?}", page.target_id());

        Ok(Box::new(CdpSession {
            _browser: browser,
            handler: Some(handler_task),
            page,
            closed: false,
        }))
    }
}

/// A DevTools target opened by [`CdpConnector`].
///
/// A session dropped without [`ProtocolSession::close`], for instance when a
/// deadline fires mid-render, closes its target in the background.
pub struct CdpSession {
    // Dropping a connected browser leaves the engine process running.
    _browser: Browser,
    handler: Option<JoinHandle<Result<(), CdpError>>>,
    page: Page,
    closed: bool,
}

impl Drop for CdpSession {
    fn drop(&mut self) {
        let Some(handler) = self.handler.take() else {
            return;
        };
        if self.closed {
            handler.abort();
            return;
        }

        let page = self.page.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = page.close().await {
                        debug!("Failed to close an abandoned target: {}", e);
                    }
                    handler.abort();
                });
            }
            Err(_) => handler.abort(),
        }
    }
}

#[async_trait]
impl ProtocolSession for CdpSession {
    async fn subscribe_content_loaded(&mut self) -> Result<ContentLoaded, SessionError> {
        let events = self
            .page
            .event_listener::<EventDomContentEventFired>()
            .await?;
        Ok(events.map(|_| ()).boxed())
    }

    async fn enable_page(&mut self) -> Result<(), SessionError> {
        self.page.execute(page::EnableParams::default()).await?;
        Ok(())
    }

    async fn enable_dom(&mut self) -> Result<(), SessionError> {
        self.page.execute(dom::EnableParams::default()).await?;
        Ok(())
    }

    async fn set_device_metrics(
        &mut self,
        width: i64,
        height: i64,
        device_scale_factor: f64,
    ) -> Result<(), SessionError> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(width)
            .height(height)
            .device_scale_factor(device_scale_factor)
            .mobile(false)
            .build()
            .map_err(SessionError::new)?;
        self.page.execute(params).await?;
        Ok(())
    }

    async fn set_visible_size(&mut self, width: i64, height: i64) -> Result<(), SessionError> {
        self.page
            .execute(SetVisibleSizeParams::new(width, height))
            .await?;
        Ok(())
    }

    async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
        let reply = self.page.execute(NavigateParams::new(url)).await?;
        // Error pages still fire DOMContentEventFired and get captured.
        if let Some(error_text) = &reply.result.error_text {
            warn!("Navigation to {} reported: {}", url, error_text);
        }
        Ok(())
    }

    async fn document_root(&mut self) -> Result<i64, SessionError> {
        let reply = self.page.execute(GetDocumentParams::default()).await?;
        Ok(*reply.result.root.node_id.inner())
    }

    async fn query_selector(&mut self, node_id: i64, selector: &str) -> Result<i64, SessionError> {
        let reply = self
            .page
            .execute(QuerySelectorParams::new(NodeId::new(node_id), selector))
            .await?;
        Ok(*reply.result.node_id.inner())
    }

    async fn box_model_height(&mut self, node_id: i64) -> Result<i64, SessionError> {
        let params = GetBoxModelParams::builder()
            .node_id(NodeId::new(node_id))
            .build();
        let reply = self.page.execute(params).await?;
        Ok(reply.result.model.height)
    }

    async fn capture_screenshot(
        &mut self,
        format: ImageFormat,
        quality: Option<i64>,
    ) -> Result<Vec<u8>, SessionError> {
        let format = match format {
            ImageFormat::Png => CaptureScreenshotFormat::Png,
            ImageFormat::Jpeg => CaptureScreenshotFormat::Jpeg,
        };
        let mut builder = CaptureScreenshotParams::builder().format(format);
        if let Some(quality) = quality {
            builder = builder.quality(quality);
        }

        let reply = self.page.execute(builder.build()).await?;
        let encoded: &[u8] = reply.result.data.as_ref();
        BASE64_STANDARD
            .decode(encoded)
            .map_err(|e| SessionError::new(format!("screenshot payload is not base64: {e}")))
    }

    async fn close(mut self: Box<Self>) {
        if let Err(e) = self.page.clone().close().await {
            warn!("Failed to close the target: {}", e);
        }
        self.closed = true;
    }
}
