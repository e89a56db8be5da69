use anyhow::{Context, Result};
use clap::Parser;
use contact_harvester::{
    apply_overrides, setup_logging, ChromeSessionFactory, Cli, CliRunner, Config, Metrics,
    MetricsExporter,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting contact-harvester v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args).await?;

    // The recorder has to be in place before any counter is registered.
    let exporter = match &args.metrics_file {
        Some(_) => Some(MetricsExporter::install()?),
        None => None,
    };
    let metrics = Arc::new(if exporter.is_some() {
        Metrics::register()
    } else {
        Metrics::new()
    });

    let factory = Arc::new(ChromeSessionFactory::new(config.chrome_path.clone()));
    let cli_runner = CliRunner::new(config, factory, metrics);

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx);

    let result = tokio::select! {
        result = cli_runner.run(args.command) => {
            info!("Application completed");
            result
        }
        _ = shutdown_rx.recv() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    if let (Some(exporter), Some(path)) = (&exporter, &args.metrics_file) {
        if let Err(e) = exporter.write_to(path) {
            warn!("Failed to write metrics: {}", e);
        }
    }

    if let Err(e) = result {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    info!("contact-harvester stopped");
    Ok(())
}

async fn load_config(args: &Cli) -> Result<Config> {
    let mut config = if let Some(config_path) = &args.config {
        let config_content = tokio::fs::read_to_string(config_path)
            .await
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        serde_json::from_str(&config_content)
            .with_context(|| format!("Invalid configuration in {}", config_path.display()))?
    } else {
        Config::default()
    };

    apply_overrides(&mut config, args);
    config.validate()?;

    info!("Configuration loaded successfully");
    info!("Discovery concurrency: {}", config.discovery.concurrency);
    info!("Navigation timeout: {:?}", config.session.navigation_timeout);
    info!("Data directory: {}", config.output.data_dir.display());

    Ok(config)
}

fn setup_shutdown_handler(
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (mut sigint, mut sigterm) = match (
            signal::unix::signal(signal::unix::SignalKind::interrupt()),
            signal::unix::signal(signal::unix::SignalKind::terminate()),
        ) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers: {}", e);
                return;
            }
        };

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
