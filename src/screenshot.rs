//! Screenshot orchestration over a single protocol session
//!
//! [`take_screenshot`] drives one automation target through a fixed sequence
//! of protocol commands and returns the captured raster. Every failure names
//! the step that produced it and no partial image is ever returned.

use crate::{JobError, ProtocolSession, ProtocolStep, StepContext};
use futures::StreamExt;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use std::io::Cursor;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::debug;

/// JPEG quality used when re-encoding without an explicit quality.
const DEFAULT_JPEG_QUALITY: u8 = 75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageFormat {
    #[default]
    Png,
    Jpeg,
}

impl ImageFormat {
    /// An empty format selects PNG.
    pub fn parse(format: &str) -> Result<Self, JobError> {
        match format {
            "" | "png" => Ok(ImageFormat::Png),
            "jpeg" => Ok(ImageFormat::Jpeg),
            other => Err(JobError::Configuration(format!(
                "invalid image format '{other}', expected png or jpeg"
            ))),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
        }
    }

    fn raster(&self) -> image::ImageFormat {
        match self {
            ImageFormat::Png => image::ImageFormat::Png,
            ImageFormat::Jpeg => image::ImageFormat::Jpeg,
        }
    }
}

/// Rendering parameters for one page.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub url: String,
    pub width: i64,
    pub height: i64,
    /// 0 and 1 keep the captured raster as-is
    pub scale: f64,
    /// Extra wait after the content loaded
    pub delay: Duration,
    pub full_page: bool,
    /// Raw format name, validated before any command is issued
    pub format: String,
    pub quality: i64,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        Self {
            url: String::new(),
            width: 1280,
            height: 800,
            scale: 1.0,
            delay: Duration::ZERO,
            full_page: false,
            format: String::new(),
            quality: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageResult {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
}

impl ImageResult {
    pub fn content_type(&self) -> &'static str {
        self.format.content_type()
    }
}

/// Renders `request.url` in `session` and captures it.
///
/// The content-loaded subscription is taken before page and DOM events are
/// enabled so the event cannot fire unobserved. Deadlines are the caller's
/// concern: dropping the returned future abandons any outstanding wait.
pub async fn take_screenshot(
    session: &mut dyn ProtocolSession,
    request: &CaptureRequest,
) -> Result<ImageResult, JobError> {
    let format = ImageFormat::parse(&request.format)?;
    if !request.scale.is_finite() || request.scale < 0.0 {
        return Err(JobError::Configuration(format!(
            "invalid scale factor {}",
            request.scale
        )));
    }
    let started = Instant::now();

    let mut content_loaded = session
        .subscribe_content_loaded()
        .await
        .step(ProtocolStep::SubscribeContentLoaded)?;
    session.enable_page().await.step(ProtocolStep::EnablePage)?;
    session.enable_dom().await.step(ProtocolStep::EnableDom)?;

    session
        .set_device_metrics(request.width, request.height, 0.0)
        .await
        .step(ProtocolStep::SetViewport)?;
    session
        .set_visible_size(request.width, request.height)
        .await
        .step(ProtocolStep::SetVisibleSize)?;

    session
        .navigate(&request.url)
        .await
        .step(ProtocolStep::Navigate)?;
    if content_loaded.next().await.is_none() {
        return Err(JobError::Protocol {
            step: ProtocolStep::WaitContentLoaded,
            message: "event stream closed before the content loaded".to_string(),
        });
    }
    debug!(target_url = %request.url, "Content loaded");

    if !request.delay.is_zero() {
        sleep(request.delay).await;
    }

    if request.full_page {
        let root = session
            .document_root()
            .await
            .step(ProtocolStep::GetDocument)?;
        let body = session
            .query_selector(root, "body")
            .await
            .step(ProtocolStep::QueryBody)?;
        let height = session
            .box_model_height(body)
            .await
            .step(ProtocolStep::GetBoxModel)?;
        debug!("Measured body height {}", height);

        session
            .set_device_metrics(request.width, height, 1.0)
            .await
            .step(ProtocolStep::ResizeViewport)?;
        session
            .set_visible_size(request.width, height)
            .await
            .step(ProtocolStep::ResizeVisibleSize)?;
    }

    let quality = match format {
        ImageFormat::Jpeg if request.quality != 0 => Some(request.quality),
        _ => None,
    };
    let mut bytes = session
        .capture_screenshot(format, quality)
        .await
        .step(ProtocolStep::CaptureScreenshot)?;

    if request.scale != 0.0 && request.scale != 1.0 {
        bytes = rescale(&bytes, format, request.width, request.scale, request.quality)?;
    }

    debug!(
        "Captured {} bytes from {} in {:?}",
        bytes.len(),
        request.url,
        started.elapsed()
    );
    Ok(ImageResult { bytes, format })
}

/// Resizes a captured raster to `floor(width * scale)` pixels wide, keeping
/// its aspect ratio, and re-encodes it in the same format.
pub fn rescale(
    bytes: &[u8],
    format: ImageFormat,
    width: i64,
    scale: f64,
    quality: i64,
) -> Result<Vec<u8>, JobError> {
    let decoded = image::load_from_memory_with_format(bytes, format.raster())
        .map_err(|e| JobError::Image(format!("unable to decode the capture: {e}")))?;
    if decoded.width() == 0 || decoded.height() == 0 {
        return Err(JobError::Image("captured image is empty".to_string()));
    }

    let target_width = (width as f64 * scale).floor();
    if target_width < 1.0 || target_width > u32::MAX as f64 {
        return Err(JobError::Image(format!(
            "scaled width {target_width} is out of range"
        )));
    }
    let target_width = target_width as u32;
    let target_height = (decoded.height() as f64 * target_width as f64 / decoded.width() as f64)
        .round()
        .max(1.0) as u32;

    let resized = decoded.resize_exact(target_width, target_height, FilterType::CatmullRom);

    let mut encoded = Vec::new();
    match format {
        ImageFormat::Png => resized
            .write_to(&mut Cursor::new(&mut encoded), image::ImageFormat::Png)
            .map_err(|e| JobError::Image(format!("unable to encode png: {e}")))?,
        ImageFormat::Jpeg => {
            let quality = if quality <= 0 {
                DEFAULT_JPEG_QUALITY
            } else {
                quality.min(100) as u8
            };
            JpegEncoder::new_with_quality(&mut encoded, quality)
                .encode_image(&resized.to_rgb8())
                .map_err(|e| JobError::Image(format!("unable to encode jpeg: {e}")))?
        }
    }

    Ok(encoded)
}
