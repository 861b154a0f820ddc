//! Error taxonomy for the analysis pipeline
//!
//! Only `DataLoad` is fatal to an analysis run. Every other variant is caught
//! by the orchestrator and surfaced as a degraded stage plus a report note.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    /// No usable input source could be resolved
    #[error("no usable input data: {0}")]
    DataLoad(String),

    /// Cache or signature source could not be used
    #[error("classification degraded: {0}")]
    Classification(String),

    /// Anomaly detection could not run
    #[error("anomaly detection failed: {0}")]
    AnomalyTool(String),

    /// Cost could not be priced for the requested provider
    #[error("cost computation degraded: {0}")]
    CostCompute(String),

    /// Report could not be persisted
    #[error("report persistence failed: {0}")]
    Persistence(String),

    /// External classifier, verdict model or web search call failed
    #[error("external tool call failed: {0}")]
    ExternalTool(String),
}

impl AnalysisError {
    /// Whether the error aborts the whole analysis
    pub fn is_fatal(&self) -> bool {
        matches!(self, AnalysisError::DataLoad(_))
    }
}

impl From<reqwest::Error> for AnalysisError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AnalysisError::ExternalTool(format!("request timed out: {err}"))
        } else {
            AnalysisError::ExternalTool(err.to_string())
        }
    }
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;
