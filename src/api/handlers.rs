use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::path::{Component, Path as FsPath, PathBuf};
use std::sync::Arc;
use tracing::{error, warn};

use crate::models::AnalysisReport;
use crate::orchestrator::{AnalyzeRequest, Orchestrator};
use crate::storage::ReportSink;

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub reports: Arc<dyn ReportSink>,
    /// Root for `logPath` and `aggregatesPath`; `None` rejects file inputs
    pub data_dir: Option<PathBuf>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct SuccessResponse {
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

/// Resolve a client-supplied input path inside `data_dir`.
///
/// Only plain relative paths are accepted. A path that exists must still
/// land inside the directory once symlinks are resolved; a missing one is
/// passed on so the analysis reports it as unusable input.
pub async fn resolve_data_path(
    data_dir: Option<&FsPath>,
    requested: &FsPath,
) -> Result<PathBuf, String> {
    let Some(root) = data_dir else {
        return Err("file inputs are not enabled on this server".to_string());
    };
    let plain = requested
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if requested.as_os_str().is_empty() || !plain {
        return Err(format!(
            "path '{}' must be relative to the data directory",
            requested.display()
        ));
    }

    let joined = root.join(requested);
    if let (Ok(real_root), Ok(real)) = (
        tokio::fs::canonicalize(root).await,
        tokio::fs::canonicalize(&joined).await,
    ) {
        if !real.starts_with(&real_root) {
            return Err(format!(
                "path '{}' escapes the data directory",
                requested.display()
            ));
        }
    }
    Ok(joined)
}

/// Run an analysis and return its report
pub async fn analyze(
    State(state): State<Arc<AppState>>,
    Json(mut payload): Json<AnalyzeRequest>,
) -> Result<Json<AnalysisReport>, ApiError> {
    if payload.site_id.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "siteId cannot be empty"));
    }
    if payload.provider.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "provider cannot be empty"));
    }

    let data_dir = state.data_dir.as_deref();
    for slot in [&mut payload.data.log_path, &mut payload.data.aggregates_path] {
        if let Some(requested) = slot.take() {
            match resolve_data_path(data_dir, &requested).await {
                Ok(resolved) => *slot = Some(resolved),
                Err(reason) => {
                    warn!("Rejected input path for site {}: {}", payload.site_id, reason);
                    return Err(api_error(StatusCode::BAD_REQUEST, reason));
                }
            }
        }
    }

    match state.orchestrator.analyze(&payload).await {
        Ok(report) => Ok(Json(report)),
        Err(e) if e.is_fatal() => Err(api_error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())),
        Err(e) => {
            error!("Analysis for site {} failed: {}", payload.site_id, e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

/// Fetch a stored report by id
pub async fn get_report(
    State(state): State<Arc<AppState>>,
    Path(report_id): Path<String>,
) -> Result<Json<AnalysisReport>, ApiError> {
    match state.reports.get_report(&report_id).await {
        Ok(Some(report)) => Ok(Json(report)),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, "Report not found")),
        Err(e) => Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to load report: {}", e),
        )),
    }
}

/// Most recent report for a site
pub async fn latest_report(
    State(state): State<Arc<AppState>>,
    Path(site_id): Path<String>,
) -> Result<Json<AnalysisReport>, ApiError> {
    match state.reports.latest_report(&site_id).await {
        Ok(Some(report)) => Ok(Json(report)),
        Ok(None) => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("No reports for site {}", site_id),
        )),
        Err(e) => Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to load report: {}", e),
        )),
    }
}

pub async fn health_check() -> Json<SuccessResponse> {
    Json(SuccessResponse {
        message: "OK".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_relative_paths_resolve_inside_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("logs")).unwrap();
        std::fs::write(dir.path().join("logs/a.jsonl"), "").unwrap();

        let resolved = resolve_data_path(Some(dir.path()), FsPath::new("logs/a.jsonl"))
            .await
            .unwrap();
        assert_eq!(resolved, dir.path().join("logs/a.jsonl"));

        // Missing files are left for the analysis to report
        let missing = resolve_data_path(Some(dir.path()), FsPath::new("./gone.jsonl"))
            .await
            .unwrap();
        assert_eq!(missing, dir.path().join("./gone.jsonl"));
    }

    #[tokio::test]
    async fn test_escaping_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = Some(dir.path());

        for bad in ["../etc/passwd", "logs/../../secret", "/etc/passwd", ""] {
            let err = resolve_data_path(root, FsPath::new(bad)).await.unwrap_err();
            assert!(err.contains("relative to the data directory"), "{bad}: {err}");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_out_of_data_dir_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.jsonl"), "").unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret.jsonl"), dir.path().join("link.jsonl"))
            .unwrap();

        let err = resolve_data_path(Some(dir.path()), FsPath::new("link.jsonl"))
            .await
            .unwrap_err();
        assert!(err.contains("escapes the data directory"), "{err}");
    }

    #[tokio::test]
    async fn test_file_inputs_need_a_data_dir() {
        let err = resolve_data_path(None, FsPath::new("a.jsonl")).await.unwrap_err();
        assert!(err.contains("not enabled"));
    }
}
