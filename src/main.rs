use clap::Parser;
use screenshot_worker::{load_config_file, setup_logging, validate_config, Cli, CliRunner, Config};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting screenshot-worker v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args).await?;
    let cli_runner = CliRunner::new(config);

    // Setup graceful shutdown
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx.clone());

    // Long-running commands drain on the shutdown broadcast themselves
    let result = cli_runner.run(args.command, shutdown_tx).await;

    if let Err(e) = result {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    info!("Screenshot-worker stopped");
    Ok(())
}

async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(config_path) => load_config_file(config_path).await?,
        None => Config::default(),
    };

    args.apply_overrides(&mut config);
    validate_config(&config)?;

    info!("Configuration loaded successfully");
    info!("Engine: {}", config.engine.chrome_path);
    info!("Uses per engine instance: {}", config.engine.uses_per_instance);
    info!("Max concurrent jobs: {}", config.max_concurrent_jobs);
    info!("Screenshot timeout: {:?}", config.screenshot_timeout);

    Ok(config)
}

fn setup_shutdown_handler(
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("Failed to create SIGINT handler");
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to create SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        let _ = shutdown_tx.send(());
    })
}
