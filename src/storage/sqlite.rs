use crate::models::{AnalysisReport, CachedClassification, LogEntry};
use crate::storage::rows::{now_millis, to_i64, ClassificationRow, LogEntryRow, ReportRow};
use crate::storage::{
    ClassificationCache, ClassificationUpdate, EntryStore, ReportSink, Storage, StorageError,
    StorageResult,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;

/// Keys per `IN (...)` lookup, well under SQLite's bound-parameter limit
const LOOKUP_CHUNK: usize = 500;

pub struct SqliteStorage {
    pool: Arc<SqlitePool>,
}

impl SqliteStorage {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ua_classifications (
                user_agent TEXT PRIMARY KEY,
                is_bot INTEGER NOT NULL,
                bot_type TEXT,
                bot_name TEXT,
                confidence REAL NOT NULL,
                source TEXT NOT NULL,
                last_updated INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS log_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                site_id TEXT NOT NULL,
                ts INTEGER NOT NULL,
                ip TEXT,
                user_agent TEXT,
                method TEXT,
                path TEXT,
                status_code INTEGER,
                bytes_transferred INTEGER,
                referer TEXT
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_log_entries_site_ts ON log_entries(site_id, ts)")
            .execute(self.pool.as_ref())
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS analysis_reports (
                report_id TEXT NOT NULL,
                site_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                window_start INTEGER NOT NULL,
                window_end INTEGER NOT NULL,
                generated_at INTEGER NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (site_id, window_start, window_end)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_reports_report_id ON analysis_reports(report_id)")
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }
}

#[async_trait]
impl ClassificationCache for SqliteStorage {
    async fn get_many(&self, user_agents: &[String]) -> Result<HashMap<String, CachedClassification>> {
        let mut found = HashMap::new();

        for chunk in user_agents.chunks(LOOKUP_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT user_agent, is_bot, bot_type, bot_name, confidence, source, last_updated \
                 FROM ua_classifications WHERE user_agent IN (",
            );
            let mut separated = builder.separated(", ");
            for ua in chunk {
                separated.push_bind(ua);
            }
            separated.push_unseparated(")");

            let rows = builder
                .build_query_as::<ClassificationRow>()
                .fetch_all(self.pool.as_ref())
                .await?;
            found.extend(rows.into_iter().map(ClassificationRow::into_pair));
        }

        Ok(found)
    }

    async fn upsert_many(&self, updates: &HashMap<String, ClassificationUpdate>) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let now = now_millis();
        let mut tx = self.pool.begin().await?;
        for (ua, update) in updates {
            sqlx::query(
                r#"
                INSERT INTO ua_classifications
                    (user_agent, is_bot, bot_type, bot_name, confidence, source, last_updated)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(user_agent) DO UPDATE SET
                    is_bot = excluded.is_bot,
                    bot_type = excluded.bot_type,
                    bot_name = excluded.bot_name,
                    confidence = excluded.confidence,
                    source = excluded.source,
                    last_updated = excluded.last_updated
                "#,
            )
            .bind(ua)
            .bind(update.verdict.is_bot)
            .bind(update.verdict.bot_type.as_deref())
            .bind(update.verdict.bot_name.as_deref())
            .bind(update.verdict.confidence)
            .bind(update.source.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<(String, CachedClassification)>> {
        let rows = sqlx::query_as::<_, ClassificationRow>(
            r#"
            SELECT user_agent, is_bot, bot_type, bot_name, confidence, source, last_updated
            FROM ua_classifications
            ORDER BY last_updated DESC, user_agent ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(rows.into_iter().map(ClassificationRow::into_pair).collect())
    }
}

#[async_trait]
impl EntryStore for SqliteStorage {
    async fn insert_entries(&self, site_id: &str, entries: &[LogEntry]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for entry in entries {
            let result = sqlx::query(
                r#"
                INSERT INTO log_entries
                    (site_id, ts, ip, user_agent, method, path, status_code, bytes_transferred, referer)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(site_id)
            .bind(entry.timestamp.timestamp_millis())
            .bind(entry.ip.as_deref())
            .bind(entry.user_agent.as_deref())
            .bind(entry.method.as_deref())
            .bind(entry.path.as_deref())
            .bind(entry.status_code.map(i64::from))
            .bind(entry.bytes_transferred.map(to_i64))
            .bind(entry.referer.as_deref())
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;

        Ok(inserted)
    }

    fn stream_entries<'a>(
        &'a self,
        site_id: &'a str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BoxStream<'a, Result<LogEntry>> {
        sqlx::query_as::<_, LogEntryRow>(
            r#"
            SELECT ts, ip, user_agent, method, path, status_code, bytes_transferred, referer
            FROM log_entries
            WHERE site_id = ? AND ts >= ? AND ts <= ?
            ORDER BY ts ASC, id ASC
            "#,
        )
        .bind(site_id)
        .bind(start.timestamp_millis())
        .bind(end.timestamp_millis())
        .fetch(self.pool.as_ref())
        .map(|row| row.map(LogEntry::from).map_err(anyhow::Error::from))
        .boxed()
    }
}

#[async_trait]
impl ReportSink for SqliteStorage {
    async fn upsert_report(&self, report: &AnalysisReport) -> StorageResult<()> {
        let body = serde_json::to_string(report).map_err(|e| StorageError::Other(e.into()))?;

        sqlx::query(
            r#"
            INSERT INTO analysis_reports
                (report_id, site_id, provider, window_start, window_end, generated_at, body)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(site_id, window_start, window_end) DO UPDATE SET
                report_id = excluded.report_id,
                provider = excluded.provider,
                generated_at = excluded.generated_at,
                body = excluded.body
            "#,
        )
        .bind(&report.report_id)
        .bind(&report.site_id)
        .bind(&report.provider)
        .bind(report.window_start.timestamp_millis())
        .bind(report.window_end.timestamp_millis())
        .bind(report.generated_at.timestamp_millis())
        .bind(body)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn get_report(&self, report_id: &str) -> StorageResult<Option<AnalysisReport>> {
        let row = sqlx::query_as::<_, ReportRow>(
            r#"
            SELECT report_id, body FROM analysis_reports
            WHERE report_id = ?
            ORDER BY generated_at DESC
            LIMIT 1
            "#,
        )
        .bind(report_id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.map(ReportRow::decode).transpose()
    }

    async fn latest_report(&self, site_id: &str) -> StorageResult<Option<AnalysisReport>> {
        let row = sqlx::query_as::<_, ReportRow>(
            r#"
            SELECT report_id, body FROM analysis_reports
            WHERE site_id = ?
            ORDER BY window_end DESC, generated_at DESC
            LIMIT 1
            "#,
        )
        .bind(site_id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.map(ReportRow::decode).transpose()
    }
}
