//! Detection Enrichment Service
//!
//! Enriches upstream object detections (vehicles, people, pets) with plate
//! readings, faces, poses and classifications, loading models on demand.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use vigil::api::rest::{create_rest_router, AppState};
use vigil::config::Config;
use vigil::engine::{ModelPool, ModelRegistry, OpenVinoLoader};
use vigil::service::EnrichmentService;
use vigil::storage::{AuditSink, SqliteAuditSink, TracingSink};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    info!("Starting Detection Enrichment Service v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_path = Config::default_path();
    if !std::path::Path::new(&config_path).exists() {
        info!("No config at {}, using defaults", config_path);
    }
    let config = Config::load_or_default(&config_path)?;

    info!("Configuration loaded:");
    info!("  REST port: {}", config.server.rest_port);
    info!("  Device: {}", config.inference.device);
    info!("  Threads: {}", config.inference.num_threads);
    info!("  Memory budget: {}", config.inference.memory_budget);
    match config.inference.model_idle_timeout {
        Some(secs) => info!("  Model idle timeout: {}s", secs),
        None => info!("  Model idle timeout: disabled"),
    }

    // Audit sink
    let audit = match config.storage.audit_path.as_deref() {
        Some(path) => {
            let path = path.to_string_lossy();
            let sink = Arc::new(SqliteAuditSink::new(&path).await?);
            info!("SQLite audit sink at: {}", path);
            Some(sink)
        }
        None => None,
    };
    let sink: Arc<dyn AuditSink> = match &audit {
        Some(sink) => sink.clone(),
        None => Arc::new(TracingSink),
    };

    // Initialize model registry and pool
    let loader = Arc::new(OpenVinoLoader::new(&config.inference)?);
    let registry = Arc::new(ModelRegistry::from_config(&config.models, loader)?);
    info!(
        "Registered {} models ({} enabled)",
        registry.len(),
        registry.list_enabled().len()
    );

    let pool = Arc::new(ModelPool::new(registry, &config.inference, sink.clone()));

    // Start model cleanup task
    let pool_clone = pool.clone();
    tokio::spawn(async move {
        pool_clone.start_cleanup_task().await;
    });

    // Create enrichment service
    let service = Arc::new(EnrichmentService::new(
        pool.clone(),
        config.pipelines.clone(),
        sink,
    ));

    // Create REST app state
    let app_state = Arc::new(AppState {
        service,
        pool: pool.clone(),
        audit,
        start_time: Instant::now(),
    });

    let rest_router = create_rest_router(app_state);

    // Start REST server
    let addr = format!("0.0.0.0:{}", config.server.rest_port);
    let listener = TcpListener::bind(&addr).await?;
    info!("REST API listening on http://{}", addr);
    info!("Detection Enrichment Service is ready!");

    axum::serve(listener, rest_router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received, cleaning up...");
        })
        .await?;

    // Shutdown model pool
    pool.shutdown();
    let report = pool.unload_all().await;
    info!(
        "Unloaded {} models ({} still in use)",
        report.unloaded.len(),
        report.in_use.len()
    );

    info!("Goodbye!");
    Ok(())
}
