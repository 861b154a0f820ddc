use crate::models::{AnalysisReport, CachedClassification, LogEntry, UaClassification};
use crate::models::Provenance;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("stored report {0} could not be decoded")]
    Corrupt(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Other(err.into())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A verdict to write into the classification cache
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationUpdate {
    pub verdict: UaClassification,
    pub source: Provenance,
}

/// User agent -> last known classification.
///
/// Upserts are last-write-wins; concurrent writers are not serialized.
#[async_trait]
pub trait ClassificationCache: Send + Sync {
    /// Fetch cached classifications; missing keys are simply absent
    async fn get_many(&self, user_agents: &[String]) -> Result<HashMap<String, CachedClassification>>;

    /// Insert or overwrite classifications, stamping them with the current time
    async fn upsert_many(&self, updates: &HashMap<String, ClassificationUpdate>) -> Result<()>;

    /// Most recently updated entries first
    async fn list_recent(&self, limit: i64) -> Result<Vec<(String, CachedClassification)>>;
}

/// Normalized log entries persisted per site
#[async_trait]
pub trait EntryStore: Send + Sync {
    async fn insert_entries(&self, site_id: &str, entries: &[LogEntry]) -> Result<u64>;

    /// Entries with start <= timestamp <= end, oldest first, fetched lazily
    fn stream_entries<'a>(
        &'a self,
        site_id: &'a str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BoxStream<'a, Result<LogEntry>>;
}

/// Analysis report persistence, keyed by (site, window)
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Insert or replace the report for its (site, window_start, window_end)
    async fn upsert_report(&self, report: &AnalysisReport) -> StorageResult<()>;

    async fn get_report(&self, report_id: &str) -> StorageResult<Option<AnalysisReport>>;

    async fn latest_report(&self, site_id: &str) -> StorageResult<Option<AnalysisReport>>;
}

/// Full persistence backend
#[async_trait]
pub trait Storage: ClassificationCache + EntryStore + ReportSink {
    /// Initialize the storage (create tables, etc.)
    async fn init(&self) -> Result<()>;
}
