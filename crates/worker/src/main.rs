//! Anomaly Worker - streaming anomaly detection for sensor data
//!
//! Consumes jobs from the input stream, fits one isolation forest per metric
//! type, and publishes the flagged samples to the output stream.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use worker_lib::{
    anomaly::{MetricDetector, SeverityClassifier},
    api::{self, AppState},
    health::HealthRegistry,
    observability::{StructuredLogger, WorkerMetrics},
    stream::{RedisStreams, ResultPublisher, StreamConsumer, StreamTransport},
    FileModelStore, JobProcessor,
};

mod config;

use crate::config::{LogFormat, WorkerConfig};

const WORKER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "anomaly-worker", version, about = "Streaming anomaly detection worker")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "ANOMALY_WORKER_CONFIG")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = WorkerConfig::load(cli.config.as_deref())?;

    init_tracing(config.log_format);

    if cli.check {
        info!(config = ?config, "Configuration is valid");
        return Ok(());
    }

    info!(worker = %config.worker_name, "Starting anomaly-worker");

    let health_registry = HealthRegistry::new();
    let metrics = WorkerMetrics::new();
    let logger = StructuredLogger::new(&config.worker_name);

    let transport: Arc<dyn StreamTransport> = Arc::new(
        RedisStreams::open(&config.redis.url).context("Failed to configure stream transport")?,
    );

    let store = FileModelStore::new(&config.models.dir, config.models.naming)
        .with_context(|| format!("Failed to open model directory {:?}", config.models.dir))?;
    let detector = MetricDetector::new(config.detector_config())?;
    let classifier = SeverityClassifier::new(config.severity)?;
    let processor = Arc::new(JobProcessor::new(
        detector,
        classifier,
        Arc::new(store),
        metrics.clone(),
        logger.clone(),
    ));

    let publisher = ResultPublisher::new(Arc::clone(&transport), config.publisher_config());
    let consumer = StreamConsumer::builder(config.consumer_config())
        .transport(transport)
        .processor(processor)
        .publisher(publisher)
        .health(health_registry.clone())
        .metrics(metrics.clone())
        .logger(logger.clone())
        .build()?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let app_state = Arc::new(AppState::new(health_registry.clone(), metrics.clone()));
    let mut api_shutdown = shutdown_tx.subscribe();
    let mut api_handle = tokio::spawn(api::serve(config.api_port, app_state, async move {
        let _ = api_shutdown.recv().await;
    }));

    let consumer_handle = tokio::spawn(consumer.run(shutdown_tx.subscribe()));

    logger.log_startup(WORKER_VERSION, &config.stream.input, &config.stream.output);

    tokio::select! {
        signal = shutdown_signal() => {
            info!(signal = signal, "Shutdown requested, finishing in-flight job");
        }
        result = &mut api_handle => {
            match result {
                Ok(Ok(())) => warn!("API server exited"),
                Ok(Err(e)) => error!(error = %e, "API server failed"),
                Err(e) => error!(error = %e, "API server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(());

    let stats = consumer_handle
        .await
        .context("Stream consumer task panicked")?;
    info!(
        entries = stats.entries_received,
        published = stats.jobs_published,
        decode_errors = stats.decode_errors,
        publish_errors = stats.publish_errors,
        "Consumer drained"
    );

    if !api_handle.is_finished() {
        if let Err(e) = api_handle.await {
            warn!(error = %e, "API server task did not stop cleanly");
        }
    }

    Ok(())
}

/// Resolves with the name of the first termination signal received
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
        "SIGINT"
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
        "SIGTERM"
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        name = ctrl_c => name,
        name = terminate => name,
    }
}
