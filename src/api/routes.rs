use axum::{
    routing::{get, post},
    Router,
};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::orchestrator::Orchestrator;
use crate::storage::ReportSink;

use super::handlers::{analyze, get_report, health_check, latest_report, AppState};

pub fn create_api_router(
    orchestrator: Arc<Orchestrator>,
    reports: Arc<dyn ReportSink>,
    data_dir: Option<PathBuf>,
) -> Router {
    let state = Arc::new(AppState {
        orchestrator,
        reports,
        data_dir,
    });

    let api_routes = Router::new()
        .route("/analyze", post(analyze))
        .route("/reports/{report_id}", get(get_report))
        .route("/sites/{site_id}/reports/latest", get(latest_report))
        .with_state(state);

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
}
