use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use ersha_store::api::{self, AppState};
use ersha_store::compression::BuiltinCodec;
use ersha_store::retention::run_retention;
use ersha_store::{
    CompressionPipeline, Config, MemoryStorage, MockTelemetrySource, PointStorage, SqliteStorage,
    StorageBackend, StorageService, TelemetryConfig, TelemetrySource,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "ersha-store")]
#[command(about = "Ersha Store")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "ersha-store.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "tracing=info,ersha_store=info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        info!("No configuration file found, using defaults");
        Config::default()
    };

    info!(
        http_addr = %config.server.http_addr,
        compression_workers = config.pipeline.compression_workers,
        overflow = ?config.pipeline.overflow,
        "Starting ersha-store"
    );

    match config.storage {
        StorageBackend::Memory => {
            info!("Using in-memory storage");
            let storage = MemoryStorage::default();
            run_pipeline(config, storage).await?;
        }
        StorageBackend::Sqlite { ref path } => {
            info!(path = ?path, "Using SQLite storage");
            let storage = SqliteStorage::new(path.to_string_lossy()).await?;
            run_pipeline(config, storage).await?;
        }
    }

    Ok(())
}

async fn run_pipeline<S: PointStorage>(config: Config, storage: S) -> color_eyre::Result<()> {
    let cancel = CancellationToken::new();

    let pipeline = CompressionPipeline::new(
        Arc::new(BuiltinCodec),
        config.pipeline.compression_workers,
        config.pipeline.overflow,
    );
    let service = StorageService::new(storage, pipeline);

    for device in config.devices {
        let device_id = device.device_id.clone();
        if let Err(e) = service.configure_device_storage(device).await {
            warn!(device_id = %device_id, error = ?e, "Skipping invalid device config");
        }
    }

    let telemetry_rx = match &config.telemetry {
        TelemetryConfig::Mock {
            reading_interval_secs,
            device_count,
        } => {
            info!(
                reading_interval_secs,
                device_count, "Using mock telemetry source"
            );
            let source = MockTelemetrySource::new(*reading_interval_secs, *device_count);
            source.start(cancel.clone()).await?
        }
    };

    let (lifecycle_tx, lifecycle_rx) = mpsc::channel(16);

    // Spawn telemetry listener
    let service_for_listener = service.clone();
    let cancel_for_listener = cancel.clone();
    let listener_handle = tokio::spawn(async move {
        service_for_listener
            .run(telemetry_rx, lifecycle_rx, cancel_for_listener)
            .await;
    });

    // Spawn retention sweeper
    let service_for_retention = service.clone();
    let cancel_for_retention = cancel.clone();
    let cleanup_interval = config.pipeline.cleanup_interval();
    let retention_handle = tokio::spawn(async move {
        run_retention(service_for_retention, cleanup_interval, cancel_for_retention).await;
    });

    // HTTP server
    let http_addr = config.server.http_addr;
    let axum_app = api::router(AppState {
        service: service.clone(),
        lifecycle: lifecycle_tx,
    });
    let axum_listener = TcpListener::bind(http_addr).await?;
    info!(%http_addr, "HTTP server listening");

    let cancel_for_http = cancel.clone();

    tokio::select! {
        result = axum::serve(axum_listener, axum_app).with_graceful_shutdown(async move {
            cancel_for_http.cancelled().await;
        }) => {
            if let Err(e) = result {
                error!(error = ?e, "HTTP server error");
            }
            info!("HTTP server shut down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }
    cancel.cancel();

    // Wait for background tasks to complete
    let _ = listener_handle.await;
    let _ = retention_handle.await;

    service.shutdown();
    let failed = service.flush_all().await;
    if failed > 0 {
        warn!(failed, "Some devices could not be flushed on shutdown");
    }

    info!("ersha-store shut down complete");
    Ok(())
}
