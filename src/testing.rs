//! Recording fakes for the engine and protocol seams.

use crate::{
    EngineLauncher, EngineProcess, ImageFormat, PoolError, ProtocolSession, SessionConnector,
    SessionError,
};
use crate::session::ContentLoaded;
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Launcher whose processes only count how often they were started and killed.
#[derive(Clone)]
pub struct CountingLauncher {
    state: Arc<LauncherState>,
}

struct LauncherState {
    launches: AtomicUsize,
    terminations: AtomicUsize,
    fail_after: AtomicI64,
    fail_terminations: AtomicBool,
    next_pid: AtomicU32,
}

impl Default for CountingLauncher {
    fn default() -> Self {
        Self {
            state: Arc::new(LauncherState {
                launches: AtomicUsize::new(0),
                terminations: AtomicUsize::new(0),
                fail_after: AtomicI64::new(-1),
                fail_terminations: AtomicBool::new(false),
                next_pid: AtomicU32::new(1000),
            }),
        }
    }
}

impl CountingLauncher {
    /// Successful launches so far.
    pub fn launches(&self) -> usize {
        self.state.launches.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.state.terminations.load(Ordering::SeqCst)
    }

    /// Every launch fails once `n` launches have succeeded.
    pub fn fail_launches_after(&self, n: i64) {
        self.state.fail_after.store(n, Ordering::SeqCst);
    }

    pub fn fail_terminations(&self) {
        self.state.fail_terminations.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl EngineLauncher for CountingLauncher {
    async fn launch(&self) -> Result<Box<dyn EngineProcess>, PoolError> {
        let fail_after = self.state.fail_after.load(Ordering::SeqCst);
        if fail_after >= 0 && self.launches() as i64 >= fail_after {
            return Err(PoolError::Launch("exec format error".to_string()));
        }

        self.state.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeProcess {
            state: self.state.clone(),
            pid: self.state.next_pid.fetch_add(1, Ordering::SeqCst),
        }))
    }
}

struct FakeProcess {
    state: Arc<LauncherState>,
    pid: u32,
}

#[async_trait]
impl EngineProcess for FakeProcess {
    async fn terminate(&mut self) -> std::io::Result<()> {
        if self.state.fail_terminations.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "operation not permitted",
            ));
        }
        self.state.terminations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }
}

/// Encodes a solid raster of the given size.
pub fn solid_image(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let raster = image::RgbImage::from_pixel(width.max(1), height.max(1), image::Rgb([200, 40, 40]));
    let format = match format {
        ImageFormat::Png => image::ImageFormat::Png,
        ImageFormat::Jpeg => image::ImageFormat::Jpeg,
    };
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgb8(raster)
        .write_to(&mut Cursor::new(&mut bytes), format)
        .unwrap();
    bytes
}

/// Shared, ordered record of the commands a fake session received.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    fn push(&self, call: impl Into<String>) {
        self.0.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, call: &str) -> bool {
        self.calls().iter().any(|c| c == call)
    }

    /// Index of the first call starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

/// How the content-loaded event behaves after navigation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadBehavior {
    Fires,
    Never,
    Closes,
}

type NavigateHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct SessionScript {
    pub body_height: i64,
    pub load: LoadBehavior,
    pub fail_capture: bool,
    pub on_navigate: Option<NavigateHook>,
}

impl Default for SessionScript {
    fn default() -> Self {
        Self {
            body_height: 2000,
            load: LoadBehavior::Fires,
            fail_capture: false,
            on_navigate: None,
        }
    }
}

pub struct FakeSession {
    script: SessionScript,
    log: CallLog,
    visible: (i64, i64),
    loaded: Option<mpsc::UnboundedSender<()>>,
}

impl FakeSession {
    pub fn new(script: SessionScript) -> (Self, CallLog) {
        let log = CallLog::default();
        (Self::with_log(script, log.clone()), log)
    }

    fn with_log(script: SessionScript, log: CallLog) -> Self {
        Self {
            script,
            log,
            visible: (0, 0),
            loaded: None,
        }
    }
}

#[async_trait]
impl ProtocolSession for FakeSession {
    async fn subscribe_content_loaded(&mut self) -> Result<ContentLoaded, SessionError> {
        self.log.push("subscribe_content_loaded");
        let (tx, rx) = mpsc::unbounded();
        self.loaded = Some(tx);
        Ok(rx.boxed())
    }

    async fn enable_page(&mut self) -> Result<(), SessionError> {
        self.log.push("enable_page");
        Ok(())
    }

    async fn enable_dom(&mut self) -> Result<(), SessionError> {
        self.log.push("enable_dom");
        Ok(())
    }

    async fn set_device_metrics(
        &mut self,
        width: i64,
        height: i64,
        device_scale_factor: f64,
    ) -> Result<(), SessionError> {
        self.log.push(format!(
            "set_device_metrics({width}, {height}, {device_scale_factor})"
        ));
        Ok(())
    }

    async fn set_visible_size(&mut self, width: i64, height: i64) -> Result<(), SessionError> {
        self.log.push(format!("set_visible_size({width}, {height})"));
        self.visible = (width, height);
        Ok(())
    }

    async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
        self.log.push(format!("navigate({url})"));
        if let Some(hook) = &self.script.on_navigate {
            hook(url);
        }
        match self.script.load {
            LoadBehavior::Fires => {
                if let Some(tx) = &self.loaded {
                    let _ = tx.unbounded_send(());
                }
            }
            LoadBehavior::Never => {}
            LoadBehavior::Closes => self.loaded = None,
        }
        Ok(())
    }

    async fn document_root(&mut self) -> Result<i64, SessionError> {
        self.log.push("document_root");
        Ok(1)
    }

    async fn query_selector(&mut self, node_id: i64, selector: &str) -> Result<i64, SessionError> {
        self.log.push(format!("query_selector({node_id}, {selector})"));
        Ok(7)
    }

    async fn box_model_height(&mut self, node_id: i64) -> Result<i64, SessionError> {
        self.log.push(format!("box_model_height({node_id})"));
        Ok(self.script.body_height)
    }

    async fn capture_screenshot(
        &mut self,
        format: ImageFormat,
        quality: Option<i64>,
    ) -> Result<Vec<u8>, SessionError> {
        self.log.push(format!(
            "capture_screenshot({}, {:?})",
            format.extension(),
            quality
        ));
        if self.script.fail_capture {
            return Err(SessionError::new("target crashed"));
        }
        let (width, height) = self.visible;
        Ok(solid_image(width as u32, height as u32, format))
    }

    async fn close(self: Box<Self>) {
        self.log.push("close");
    }
}

/// Hands out [`FakeSession`]s that all record into one log.
#[derive(Clone, Default)]
pub struct FakeConnector {
    script: SessionScript,
    log: CallLog,
    opened: Arc<AtomicUsize>,
}

impl FakeConnector {
    pub fn new(script: SessionScript) -> Self {
        Self {
            script,
            ..Default::default()
        }
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn open(&self) -> Result<Box<dyn ProtocolSession>, SessionError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession::with_log(
            self.script.clone(),
            self.log.clone(),
        )))
    }
}

/// A callback request as seen by [`spawn_callback_receiver`].
#[derive(Clone, Debug)]
pub struct ReceivedCallback {
    pub query: Option<String>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

pub type Received = Arc<Mutex<Vec<ReceivedCallback>>>;

/// Serves `POST /callback` on an ephemeral port, answering with `status`.
pub async fn spawn_callback_receiver(status: axum::http::StatusCode) -> (String, Received) {
    use axum::body::Bytes;
    use axum::http::{HeaderMap, Uri};
    use axum::routing::post;

    let received: Received = Arc::default();
    let recorder = received.clone();
    let app = axum::Router::new().route(
        "/callback",
        post(move |uri: Uri, headers: HeaderMap, body: Bytes| {
            let recorder = recorder.clone();
            async move {
                recorder.lock().unwrap().push(ReceivedCallback {
                    query: uri.query().map(str::to_string),
                    content_type: headers
                        .get(axum::http::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string),
                    body: body.to_vec(),
                });
                status
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    (format!("http://{addr}/callback"), received)
}

/// In-process stand-in for the broker.
#[derive(Default)]
pub struct MemoryQueue {
    jobs: Mutex<std::collections::VecDeque<crate::QueuedJob>>,
    failures: Mutex<Vec<(crate::QueuedJob, &'static str)>>,
}

impl MemoryQueue {
    pub fn with_jobs(jobs: Vec<crate::QueuedJob>) -> Self {
        Self {
            jobs: Mutex::new(jobs.into()),
            ..Default::default()
        }
    }

    pub fn pending(&self) -> Vec<crate::QueuedJob> {
        self.jobs.lock().unwrap().iter().cloned().collect()
    }

    /// Reported failures as `(job, error kind)`.
    pub fn failures(&self) -> Vec<(crate::QueuedJob, &'static str)> {
        self.failures.lock().unwrap().clone()
    }
}

#[async_trait]
impl crate::JobQueue for MemoryQueue {
    async fn next_job(&self) -> Result<Option<crate::QueuedJob>, crate::QueueError> {
        let job = self.jobs.lock().unwrap().pop_front();
        if job.is_none() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        Ok(job)
    }

    async fn push(&self, job: &crate::QueuedJob) -> Result<(), crate::QueueError> {
        self.jobs.lock().unwrap().push_back(job.clone());
        Ok(())
    }

    async fn report_failure(
        &self,
        job: &crate::QueuedJob,
        error: &crate::JobError,
    ) -> Result<(), crate::QueueError> {
        self.failures.lock().unwrap().push((job.clone(), error.kind()));
        Ok(())
    }
}

/// Polls `condition` until it holds, panicking after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
