use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vidframe_worker::api::{start_api_server, AppState, ServiceInfo};
use vidframe_worker::frame_extractor::ExtractorSettings;
use vidframe_worker::{
    Config, FrameExtractor, Ingestor, KafkaSource, MetadataStore, Orchestrator, S3Storage,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting Vidframe Worker"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let metadata_store = Arc::new(
        MetadataStore::new(&config.database)
            .await
            .context("Failed to initialize metadata store")?,
    );

    if config.database.run_migrations {
        metadata_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let storage = Arc::new(
        S3Storage::new(&config.s3)
            .await
            .context("Failed to initialize S3 storage")?,
    );

    let extractor = Arc::new(FrameExtractor::new(ExtractorSettings::from(&config.processing)));

    let orchestrator = Arc::new(Orchestrator::new(
        storage.clone(),
        metadata_store.clone(),
        extractor,
        (&config.processing).into(),
    ));

    let ingestor = Ingestor::new(
        metadata_store.clone(),
        orchestrator,
        config.processing.worker_limit,
    );

    let kafka_source = KafkaSource::new(&config.kafka).context("Failed to initialize Kafka consumer")?;

    let shutdown = CancellationToken::new();

    // Spawn API server task
    let api_state = AppState {
        repository: metadata_store.clone(),
        storage: storage.clone(),
        info: Arc::new(ServiceInfo::new(config.service.name.clone())),
    };
    let api_config = config.api.clone();
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_shutdown.cancel();
    });

    info!(
        worker_limit = config.processing.worker_limit,
        "Vidframe worker started successfully"
    );

    kafka_source.run(&ingestor, shutdown.clone()).await;

    // The stream can also end on its own
    shutdown.cancel();

    info!("Draining in-flight videos");
    if !ingestor.drain(config.drain_timeout()).await {
        warn!("Exiting with unfinished videos");
    }

    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task failed");
    }

    info!("Vidframe worker stopped");

    Ok(())
}

/// JSON logs filtered by `RUST_LOG`, falling back to the configured level
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Expose worker counters and histograms for scraping
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
