use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use botlens::api;
use botlens::config::{AnalysisSettings, Config};
use botlens::orchestrator::Orchestrator;
use botlens::storage;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = Config::from_env()?;
    let settings = AnalysisSettings::load(config.analysis_config.as_deref().map(Path::new))?;
    info!("Loaded configuration");

    // Initialize storage
    let handles = storage::connect(&config).await?;
    info!("Database initialized successfully");

    let orchestrator = Orchestrator::from_settings(&settings, Some(Arc::clone(&handles.cache)))
        .await?
        .with_entry_store(Arc::clone(&handles.entries))
        .with_report_sink(Arc::clone(&handles.reports));
    info!(
        "Using price table {}",
        orchestrator.price_table().version
    );

    match &config.data_dir {
        Some(dir) => info!("Serving file inputs from {}", dir.display()),
        None => info!("DATA_DIR not set; file inputs over the API are disabled"),
    }
    let api_router =
        api::create_api_router(Arc::new(orchestrator), handles.reports, config.data_dir.clone());

    let api_addr = format!("{}:{}", config.api_server.host, config.api_server.port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr).await?;
    info!("🚀 API server listening on http://{}", api_addr);

    axum::serve(api_listener, api_router).await?;

    Ok(())
}
