use crate::{
    ensure_bucket, install_prometheus, take_screenshot, validate_config, CallbackRegistry,
    CaptureRequest, CdpConnector, Config, ContentServer, DispatchSettings, Dispatcher,
    EnginePool, GatewayState, HttpObjectStore, ObjectStore, ProtocolStep, RedisQueue,
    SessionConnector, StepContext, WorkerPool,
};
use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};

/// How often the gateway sweeps expired pending callbacks.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "screenshot-worker")]
#[command(about = "Queue-driven web page screenshot worker")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Maximum concurrent jobs")]
    pub concurrency: Option<usize>,

    #[arg(long, global = true, help = "Render timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Browser engine executable name or path")]
    pub chrome_path: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Consume screenshot jobs from the queue
    Worker,

    /// Serve the synchronous HTTP front end
    Gateway,

    /// Render a single page to a file without the queue
    Render {
        #[arg(short, long, required_unless_present = "html", help = "URL to render")]
        url: Option<String>,

        #[arg(long, conflicts_with = "url", help = "HTML file to render instead of a URL")]
        html: Option<PathBuf>,

        #[arg(short, long, help = "Output file path")]
        output: PathBuf,

        #[arg(long, default_value = "1280", help = "Viewport width")]
        width: i64,

        #[arg(long, default_value = "800", help = "Viewport height")]
        height: i64,

        #[arg(long, default_value = "1", help = "Output scale factor (0 or 1 keep the capture)")]
        scale: f64,

        #[arg(long, default_value = "0", help = "Wait after load in milliseconds")]
        delay: u64,

        #[arg(long, help = "Capture the full page height")]
        full_page: bool,

        #[arg(long, default_value = "png", help = "Output format (png, jpeg)")]
        format: String,

        #[arg(long, default_value = "0", help = "JPEG quality (0 uses the default)")]
        quality: i64,
    },

    /// Validate configuration
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

impl Cli {
    /// Applies command-line overrides on top of a loaded configuration.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(concurrency) = self.concurrency {
            config.max_concurrent_jobs = concurrency;
        }
        if let Some(timeout) = self.timeout {
            config.screenshot_timeout = Duration::from_secs(timeout);
        }
        if let Some(chrome_path) = &self.chrome_path {
            config.engine.chrome_path = chrome_path.clone();
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub url: Option<String>,
    pub html: Option<PathBuf>,
    pub output: PathBuf,
    pub request: CaptureRequest,
}

pub struct CliRunner {
    pub config: Config,
}

impl CliRunner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Runs `command` until it finishes or `shutdown` fires.
    pub async fn run(
        &self,
        command: Commands,
        shutdown: broadcast::Sender<()>,
    ) -> anyhow::Result<()> {
        match command {
            Commands::Worker => self.run_worker(shutdown).await,
            Commands::Gateway => self.run_gateway(shutdown).await,
            Commands::Render {
                url,
                html,
                output,
                width,
                height,
                scale,
                delay,
                full_page,
                format,
                quality,
            } => {
                let options = RenderOptions {
                    url,
                    html,
                    output,
                    request: CaptureRequest {
                        url: String::new(),
                        width,
                        height,
                        scale,
                        delay: Duration::from_millis(delay),
                        full_page,
                        format,
                        quality,
                    },
                };
                let mut stop = shutdown.subscribe();
                tokio::select! {
                    result = self.run_render(options) => result,
                    _ = stop.recv() => Err(anyhow!("render interrupted")),
                }
            }
            Commands::Validate { config } => self.validate_config(config).await,
        }
    }

    pub async fn run_worker(&self, shutdown: broadcast::Sender<()>) -> anyhow::Result<()> {
        let config = &self.config;
        if let Some(bind) = &config.metrics_bind {
            install_prometheus(bind)?;
        }

        let http = reqwest::Client::new();
        let store = HttpObjectStore::from_config(http.clone(), &config.storage)?;
        info!(
            "Object storage at {} ({})",
            config.storage.endpoint_url(),
            if store.is_signed() { "signed" } else { "anonymous" }
        );
        let store: Arc<dyn ObjectStore> = Arc::new(store);
        ensure_bucket(store.as_ref(), &config.storage.bucket, &config.storage.region)
            .await
            .context("unable to prepare the storage bucket")?;

        let content = Arc::new(ContentServer::new());
        let content_task = self.spawn_content_server(&content, &shutdown).await?;

        let pool = Arc::new(EnginePool::from_config(&config.engine).await?);
        let connector: Arc<dyn SessionConnector> =
            Arc::new(CdpConnector::new(&config.engine.debugging_url));
        let dispatcher = Arc::new(Dispatcher::new(
            pool.clone(),
            connector,
            content,
            store,
            http,
            DispatchSettings::from_config(config),
        ));

        let queue = Arc::new(RedisQueue::connect(&config.queue).await?);
        info!("Consuming jobs from {}", queue.queue_key());
        let workers = WorkerPool::new(
            dispatcher,
            queue,
            config.queue.job_class.clone(),
            config.max_concurrent_jobs,
        );

        let result = workers.run(shutdown.clone()).await;

        let _ = shutdown.send(());
        let stats = pool.get_stats().await;
        info!(
            restarts = stats.restarts,
            remaining_uses = stats.remaining_uses,
            "Engine used {} times since its last start",
            stats.initial_uses - stats.remaining_uses
        );
        pool.shutdown().await;
        if let Err(e) = content_task.await {
            error!("Content server task failed: {}", e);
        }

        result.map_err(Into::into)
    }

    pub async fn run_gateway(&self, shutdown: broadcast::Sender<()>) -> anyhow::Result<()> {
        let config = &self.config;
        if let Some(bind) = &config.metrics_bind {
            install_prometheus(bind)?;
        }

        let queue = Arc::new(RedisQueue::connect(&config.queue).await?);
        let registry = Arc::new(CallbackRegistry::new());
        let sweeper = registry.clone().spawn_sweeper(
            config.gateway.pending_ttl,
            SWEEP_INTERVAL,
            shutdown.subscribe(),
        );

        let state = Arc::new(GatewayState::new(
            queue,
            registry,
            &config.gateway,
            config.queue.job_class.clone(),
        )?);
        let listener = TcpListener::bind(&config.gateway.bind)
            .await
            .with_context(|| format!("unable to bind the gateway to {}", config.gateway.bind))?;

        crate::gateway::serve(state, listener, signalled(shutdown.subscribe())).await?;
        let _ = sweeper.await;
        Ok(())
    }

    pub async fn run_render(&self, options: RenderOptions) -> anyhow::Result<()> {
        let config = &self.config;
        let content = Arc::new(ContentServer::new());
        let (stop_content, _) = broadcast::channel(1);

        let (registration, content_task) = match &options.html {
            Some(path) => {
                let html = fs::read_to_string(path)
                    .await
                    .with_context(|| format!("unable to read {}", path.display()))?;
                let task = self.spawn_content_server(&content, &stop_content).await?;
                (Some(content.register(html)), Some(task))
            }
            None => (None, None),
        };
        let target = match (&registration, &options.url) {
            (Some(registration), _) => registration.url(&config.content_base_url()),
            (None, Some(url)) => url.clone(),
            (None, None) => return Err(anyhow!("either --url or --html is required")),
        };
        info!("Taking screenshot of: {}", target);

        let request = CaptureRequest {
            url: target,
            ..options.request
        };
        let limit = request.delay + config.screenshot_timeout;
        let pool = EnginePool::from_config(&config.engine).await?;
        let connector = CdpConnector::new(&config.engine.debugging_url);

        let outcome = pool
            .execute(|| async {
                tokio::time::timeout(limit, async {
                    let mut session = connector.open().await.step(ProtocolStep::OpenSession)?;
                    let result = take_screenshot(session.as_mut(), &request).await;
                    session.close().await;
                    result
                })
                .await
            })
            .await;
        pool.shutdown().await;
        drop(registration);
        let _ = stop_content.send(());
        if let Some(task) = content_task {
            let _ = task.await;
        }

        let image = outcome?
            .map_err(|_| anyhow!("render timed out after {:?}", limit))??;

        if let Some(parent) = options.output.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&options.output, &image.bytes).await?;

        println!("Screenshot captured successfully:");
        println!("  Target: {}", request.url);
        println!("  Output: {}", options.output.display());
        println!("  Format: {}", image.content_type());
        println!("  Size: {}", crate::format_bytes(image.bytes.len()));
        Ok(())
    }

    pub async fn validate_config(&self, config_path: PathBuf) -> anyhow::Result<()> {
        println!("Validating configuration: {}", config_path.display());

        let config = load_config_file(&config_path).await?;
        validate_config(&config)?;

        println!("Configuration is valid:");
        println!("  Engine: {}", config.engine.chrome_path);
        println!("  Uses per instance: {}", config.engine.uses_per_instance);
        println!("  Max concurrent jobs: {}", config.max_concurrent_jobs);
        println!(
            "  Timeouts: render {}, callback {}",
            crate::format_duration(config.screenshot_timeout),
            crate::format_duration(config.callback_timeout)
        );
        println!("  Queue: {}", config.queue.queue_key());
        println!("  Bucket: {}", config.storage.bucket);

        Ok(())
    }

    async fn spawn_content_server(
        &self,
        content: &Arc<ContentServer>,
        shutdown: &broadcast::Sender<()>,
    ) -> anyhow::Result<tokio::task::JoinHandle<()>> {
        let bind = &self.config.content_bind;
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("unable to bind the content server to {bind}"))?;

        let server = content.clone();
        let stop = signalled(shutdown.subscribe());
        Ok(tokio::spawn(async move {
            if let Err(e) = server.serve(listener, stop).await {
                error!("Content server stopped: {}", e);
            }
        }))
    }
}

/// Reads a JSON configuration file; missing fields take their defaults.
pub async fn load_config_file(path: &PathBuf) -> anyhow::Result<Config> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("unable to read {}", path.display()))?;
    let config = serde_json::from_str(&content)
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    Ok(config)
}

async fn signalled(mut shutdown: broadcast::Receiver<()>) {
    let _ = shutdown.recv().await;
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!(e))?;

    Ok(())
}
