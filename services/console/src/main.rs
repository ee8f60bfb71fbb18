use anyhow::{Context, Result};
use qc_console::api::{start_api_server, AppState};
use qc_console::config::{Config, ServiceConfig};
use qc_console::{CaptureSession, DeviceModeController, HttpVisionClient, SessionSettings};
use qc_storage::{PgRecordStore, PixelsPerCm, ReportPipeline, S3Uploader, StandardsIngestor};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service);

    info!(
        service = %config.service.name,
        tenant_id = %config.session.tenant_id,
        "Starting QC console"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let record_store = Arc::new(
        PgRecordStore::new(&config.database)
            .await
            .context("Failed to initialize record store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        record_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let s3_uploader = Arc::new(
        S3Uploader::new(&config.s3)
            .await
            .context("Failed to initialize S3 uploader")?,
    );

    let vision = Arc::new(
        HttpVisionClient::new(&config.vision).context("Failed to build vision client")?,
    );

    let pipeline = ReportPipeline::new(
        s3_uploader,
        record_store.clone(),
        config.pipeline.clone(),
    );

    let pixels_per_cm = PixelsPerCm::new(config.session.default_pixels_per_cm)
        .context("Invalid session.default_pixels_per_cm")?;

    let session = Arc::new(CaptureSession::new(
        vision.clone(),
        DeviceModeController::new(vision),
        Arc::new(pipeline),
        SessionSettings {
            tenant_id: config.session.tenant_id.clone(),
            default_garment_type: config.session.garment_type.clone(),
            pixels_per_cm,
        },
    ));

    // The backend may be down at startup; the operator can retry from the UI
    if config.session.reset_rotation_on_start {
        if let Err(e) = session.rotate_camera(0).await {
            warn!(error = %e, "Failed to reset camera rotation");
        }
    }

    if config.session.load_saved_calibration {
        match session.load_saved_calibration().await {
            Ok(Some(applied)) => info!(pixels_per_cm = applied.get(), "Loaded saved calibration"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to load saved calibration"),
        }
    }

    // Create API state
    let api_state = AppState {
        session,
        reports: record_store.clone(),
        standards: record_store.clone(),
        ingestor: Arc::new(StandardsIngestor::new(record_store)),
    };

    info!("QC console started successfully");

    start_api_server(api_state, &config.api, shutdown_signal()).await?;

    info!("QC console stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(service: &ServiceConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&service.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if service.log_format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
