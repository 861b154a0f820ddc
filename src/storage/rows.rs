//! Row types shared by the SQL backends

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::models::{AnalysisReport, CachedClassification, LogEntry, Provenance, UaClassification};
use crate::storage::{StorageError, StorageResult};

#[derive(Debug, FromRow)]
pub(crate) struct LogEntryRow {
    pub ts: i64,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub status_code: Option<i64>,
    pub bytes_transferred: Option<i64>,
    pub referer: Option<String>,
}

impl From<LogEntryRow> for LogEntry {
    fn from(row: LogEntryRow) -> Self {
        LogEntry {
            timestamp: DateTime::from_timestamp_millis(row.ts).unwrap_or_default(),
            ip: row.ip,
            user_agent: row.user_agent,
            method: row.method,
            path: row.path,
            status_code: row.status_code.and_then(|s| u16::try_from(s).ok()),
            bytes_transferred: row.bytes_transferred.and_then(|b| u64::try_from(b).ok()),
            referer: row.referer,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct ClassificationRow {
    pub user_agent: String,
    pub is_bot: bool,
    pub bot_type: Option<String>,
    pub bot_name: Option<String>,
    pub confidence: f64,
    pub source: String,
    pub last_updated: i64,
}

impl ClassificationRow {
    pub fn into_pair(self) -> (String, CachedClassification) {
        let cached = CachedClassification {
            verdict: UaClassification {
                is_bot: self.is_bot,
                bot_type: self.bot_type,
                bot_name: self.bot_name,
                confidence: self.confidence,
            },
            source: Provenance::parse(&self.source).unwrap_or(Provenance::External),
            last_updated: DateTime::<Utc>::from_timestamp_millis(self.last_updated)
                .unwrap_or_default(),
        };
        (self.user_agent, cached)
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct ReportRow {
    pub report_id: String,
    pub body: String,
}

impl ReportRow {
    pub fn decode(self) -> StorageResult<AnalysisReport> {
        serde_json::from_str(&self.body).map_err(|e| {
            tracing::error!("Failed to decode stored report {}: {}", self.report_id, e);
            StorageError::Corrupt(self.report_id)
        })
    }
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Saturating u64 -> i64 for BIGINT columns
pub(crate) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
