//! End-to-end tests for the analysis orchestrator
//!
//! External capabilities are replaced by scripted implementations so the
//! whole pipeline runs offline against an in-memory SQLite database.

use async_trait::async_trait;
use botlens::analysis::{aggregate, PriceTable};
use botlens::classify::{BulkClassifier, SignatureSet, UaClassifier};
use botlens::config::DisambiguationSettings;
use botlens::error::{AnalysisError, AnalysisResult};
use botlens::models::{AnalysisReport, InputSource, LogEntry, Provenance, StageStatus, UaClassification};
use botlens::orchestrator::{AnalyzeRequest, DataReference, Orchestrator, WindowQuery};
use botlens::sherlock::{Sherlock, ToolBox, UaFeatures, Verdict, VerdictModel};
use botlens::storage::{
    ClassificationCache, EntryStore, ReportSink, SqliteStorage, Storage, StorageError, StorageResult,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const GPTBOT: &str = "Mozilla/5.0 AppleWebKit/537.36 (KHTML, like Gecko; compatible; GPTBot/1.1; +https://openai.com/gptbot)";
const CHROME: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";
const MYSTERY: &str = "mystery-fetcher/0.3";

fn at(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + Duration::minutes(minute)
}

fn entry(minute: i64, ip: &str, ua: &str, path: &str, bytes: u64) -> LogEntry {
    LogEntry {
        timestamp: at(minute),
        ip: Some(ip.to_string()),
        user_agent: Some(ua.to_string()),
        method: Some("GET".to_string()),
        path: Some(path.to_string()),
        status_code: Some(200),
        bytes_transferred: Some(bytes),
        referer: None,
    }
}

fn sample_entries() -> Vec<LogEntry> {
    vec![
        entry(0, "198.51.100.1", GPTBOT, "/blog/post", 5_000),
        entry(1, "198.51.100.1", GPTBOT, "/blog/other", 5_000),
        entry(2, "203.0.113.9", CHROME, "/", 1_000),
        entry(2, "203.0.113.9", CHROME, "/app.js", 2_000),
        entry(3, "192.0.2.44", MYSTERY, "/api/items", 700),
        entry(4, "192.0.2.44", MYSTERY, "/api/items", 300),
    ]
}

fn write_log(entries: &[LogEntry]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for entry in entries {
        writeln!(file, "{}", serde_json::to_string(entry).unwrap()).unwrap();
    }
    writeln!(file, "{{not json").unwrap();
    file.flush().unwrap();
    file
}

async fn create_storage() -> Arc<SqliteStorage> {
    let storage = SqliteStorage::new("sqlite::memory:", 1).await.unwrap();
    storage.init().await.unwrap();
    Arc::new(storage)
}

/// Calls Chrome agents human and everything else a scraper
struct ScriptedModel {
    assessed: AtomicUsize,
}

#[async_trait]
impl VerdictModel for ScriptedModel {
    async fn assess(&self, batch: &[UaFeatures]) -> AnalysisResult<Vec<Verdict>> {
        self.assessed.fetch_add(batch.len(), Ordering::SeqCst);
        Ok(batch
            .iter()
            .map(|f| {
                let classification = if f.user_agent.contains("Chrome/") {
                    UaClassification {
                        is_bot: false,
                        bot_type: None,
                        bot_name: None,
                        confidence: 0.9,
                    }
                } else {
                    UaClassification::bot("scraper", "mystery-fetcher", 0.92)
                };
                Verdict {
                    user_agent: f.user_agent.clone(),
                    classification,
                    reasoning: "scripted".to_string(),
                    needs_web: false,
                }
            })
            .collect())
    }

    async fn investigate(&self, _batch: &[UaFeatures], _tools: &ToolBox) -> AnalysisResult<Vec<Verdict>> {
        Err(AnalysisError::ExternalTool("not scripted".to_string()))
    }
}

struct FailingBulk;

#[async_trait]
impl BulkClassifier for FailingBulk {
    async fn classify_batch(&self, _user_agents: &[String]) -> AnalysisResult<HashMap<String, UaClassification>> {
        Err(AnalysisError::ExternalTool("classifier offline".to_string()))
    }
}

struct FailingSink;

#[async_trait]
impl ReportSink for FailingSink {
    async fn upsert_report(&self, _report: &AnalysisReport) -> StorageResult<()> {
        Err(StorageError::Other(anyhow::anyhow!("disk full")))
    }

    async fn get_report(&self, _report_id: &str) -> StorageResult<Option<AnalysisReport>> {
        Ok(None)
    }

    async fn latest_report(&self, _site_id: &str) -> StorageResult<Option<AnalysisReport>> {
        Ok(None)
    }
}

fn orchestrator(storage: &Arc<SqliteStorage>, model: Arc<ScriptedModel>) -> Orchestrator {
    let cache: Arc<dyn ClassificationCache> = storage.clone();
    let classifier = UaClassifier::new(SignatureSet::builtin()).with_cache(Arc::clone(&cache));
    let sherlock = Sherlock::new(model, DisambiguationSettings::default()).with_cache(cache);
    Orchestrator::new(classifier, PriceTable::builtin())
        .with_sherlock(sherlock)
        .with_entry_store(storage.clone())
        .with_report_sink(storage.clone())
}

fn log_request(site_id: &str, path: &std::path::Path) -> AnalyzeRequest {
    AnalyzeRequest {
        site_id: site_id.to_string(),
        provider: "vercel".to_string(),
        data: DataReference {
            log_path: Some(path.to_path_buf()),
            ..Default::default()
        },
        window_days: None,
        options: Default::default(),
    }
}

#[tokio::test]
async fn test_log_file_analysis_end_to_end() {
    let storage = create_storage().await;
    let model = Arc::new(ScriptedModel {
        assessed: AtomicUsize::new(0),
    });
    let orchestrator = orchestrator(&storage, Arc::clone(&model));
    let log = write_log(&sample_entries());

    let report = orchestrator.analyze(&log_request("site-a", log.path())).await.unwrap();

    assert_eq!(report.input.source, InputSource::RawLog);
    assert_eq!(report.input.skipped_lines, 1);
    assert!(report.input.raw_entries_available);
    assert_eq!(report.totals.total_requests, 6);
    assert_eq!(report.totals.total_bytes, 14_000);

    // GPTBot resolved by signature; the other two went to the verdict model
    let agents = &report.classification.user_agents;
    assert_eq!(agents[GPTBOT].provenance, Provenance::Signature);
    assert_eq!(agents[GPTBOT].verdict.bot_type.as_deref(), Some("ai_training"));
    assert_eq!(agents[MYSTERY].provenance, Provenance::Disambiguation);
    assert!(agents[MYSTERY].verdict.is_bot);
    assert!(!agents[CHROME].verdict.is_bot);
    assert_eq!(model.assessed.load(Ordering::SeqCst), 2);
    assert_eq!(report.classification.refined_by_disambiguation, 2);

    // Byte split follows the merged classifications
    assert_eq!(report.bytes.bot.bytes, 11_000);
    assert_eq!(report.bytes.human.bytes, 3_000);
    assert_eq!(report.bytes.unattributed.count, 0);
    assert_eq!(report.classification.top_bots[0].user_agent, GPTBOT);

    // Four minutes of data bill as one whole day
    assert_eq!(report.window_start, at(0));
    assert_eq!(report.window_end, at(4));
    assert_eq!(report.window_days, 1.0);
    assert_eq!(report.cost.monthly_factor, 30.0);

    // Skipped lines degrade the input stage only
    let input_stage = report.stages.iter().find(|s| s.stage == "input").unwrap();
    assert_eq!(input_stage.status, StageStatus::Degraded);
    assert!(report.notes.iter().any(|n| n.contains("malformed")));
    let persistence = report.stages.iter().find(|s| s.stage == "persistence").unwrap();
    assert_eq!(persistence.status, StageStatus::Complete);

    let stored = storage.get_report(&report.report_id).await.unwrap().unwrap();
    assert_eq!(stored.report_id, report.report_id);
    assert_eq!(storage.latest_report("site-a").await.unwrap().unwrap().report_id, report.report_id);

    // Final verdicts were written back to the cache
    let cached = storage
        .get_many(&[MYSTERY.to_string(), GPTBOT.to_string()])
        .await
        .unwrap();
    assert_eq!(cached[MYSTERY].source, Provenance::Disambiguation);
    assert_eq!(cached[GPTBOT].source, Provenance::Signature);
}

#[tokio::test]
async fn test_second_run_hits_cache() {
    let storage = create_storage().await;
    let model = Arc::new(ScriptedModel {
        assessed: AtomicUsize::new(0),
    });
    let orchestrator = orchestrator(&storage, Arc::clone(&model));
    let log = write_log(&sample_entries());

    orchestrator.analyze(&log_request("site-a", log.path())).await.unwrap();
    let second = orchestrator.analyze(&log_request("site-a", log.path())).await.unwrap();

    // Every agent now resolves from the cache and the model is not asked again
    assert_eq!(model.assessed.load(Ordering::SeqCst), 2);
    let agents = &second.classification.user_agents;
    assert_eq!(agents[MYSTERY].provenance, Provenance::Cache);
    assert!(agents[MYSTERY].verdict.is_bot);
    assert_eq!(agents[GPTBOT].provenance, Provenance::Cache);
    assert_eq!(second.bytes.bot.bytes, 11_000);
}

#[tokio::test]
async fn test_window_query_over_stored_entries() {
    let storage = create_storage().await;
    storage.insert_entries("site-q", &sample_entries()).await.unwrap();
    storage
        .insert_entries("site-q", &[entry(90, "198.51.100.1", GPTBOT, "/late", 9_999)])
        .await
        .unwrap();

    let orchestrator = Orchestrator::new(UaClassifier::new(SignatureSet::builtin()), PriceTable::builtin())
        .with_entry_store(storage.clone());
    let request = AnalyzeRequest {
        site_id: "site-q".to_string(),
        provider: "netlify".to_string(),
        data: DataReference {
            query: Some(WindowQuery { start: at(0), end: at(60) }),
            ..Default::default()
        },
        window_days: Some(1.0),
        options: Default::default(),
    };

    let report = orchestrator.analyze(&request).await.unwrap();
    assert_eq!(report.input.source, InputSource::Query);
    assert_eq!(report.totals.total_requests, 6);
    assert_eq!(report.window_start, at(0));
    assert_eq!(report.window_end, at(60));
    assert_eq!(report.window_days, 1.0);
    assert!((report.cost.monthly_factor - 30.0).abs() < 1e-9);
    // Without a verdict model the unknown agents stay on the default verdict
    let agents = &report.classification.user_agents;
    assert_eq!(agents[MYSTERY].provenance, Provenance::Default);
    assert_eq!(report.bytes.bot.bytes, 10_000);
}

#[tokio::test]
async fn test_aggregates_only_leaves_bytes_unattributed() {
    let aggregation = aggregate(sample_entries().iter());
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(serde_json::to_string(&aggregation).unwrap().as_bytes())
        .unwrap();
    file.flush().unwrap();

    let orchestrator = Orchestrator::new(UaClassifier::new(SignatureSet::builtin()), PriceTable::builtin());
    let request = AnalyzeRequest {
        site_id: "site-agg".to_string(),
        provider: "aws".to_string(),
        data: DataReference {
            aggregates_path: Some(file.path().to_path_buf()),
            ..Default::default()
        },
        window_days: None,
        options: Default::default(),
    };

    let report = orchestrator.analyze(&request).await.unwrap();
    assert_eq!(report.input.source, InputSource::Aggregates);
    assert!(!report.input.raw_entries_available);
    assert_eq!(report.bytes.unattributed.bytes, 14_000);
    assert_eq!(report.bytes.bot.count, 0);
    assert!(report.cost.items.iter().any(|i| i.category == "unattributed"));

    let usage = report.stages.iter().find(|s| s.stage == "usage").unwrap();
    assert_eq!(usage.status, StageStatus::Degraded);
    assert!(report.is_degraded());
}

#[tokio::test]
async fn test_failures_degrade_without_aborting() {
    let storage = create_storage().await;
    let classifier = UaClassifier::new(SignatureSet::builtin()).with_external(Arc::new(FailingBulk));
    let orchestrator = Orchestrator::new(classifier, PriceTable::builtin())
        .with_entry_store(storage.clone())
        .with_report_sink(Arc::new(FailingSink));
    let log = write_log(&sample_entries());

    let report = orchestrator.analyze(&log_request("site-f", log.path())).await.unwrap();

    let classification = report.stages.iter().find(|s| s.stage == "classification").unwrap();
    assert_eq!(classification.status, StageStatus::Degraded);
    let persistence = report.stages.iter().find(|s| s.stage == "persistence").unwrap();
    assert_eq!(persistence.status, StageStatus::Degraded);
    assert!(report.notes.iter().any(|n| n.starts_with("persistence:") && n.contains("disk full")));
    assert_eq!(report.classification.user_agents[MYSTERY].provenance, Provenance::Default);
}

#[tokio::test]
async fn test_missing_input_is_fatal() {
    let orchestrator = Orchestrator::new(UaClassifier::new(SignatureSet::builtin()), PriceTable::builtin());
    let request = AnalyzeRequest {
        site_id: "site-none".to_string(),
        provider: "vercel".to_string(),
        data: DataReference {
            log_path: Some("/nonexistent/botlens/access.jsonl".into()),
            query: Some(WindowQuery { start: at(0), end: at(10) }),
            ..Default::default()
        },
        window_days: None,
        options: Default::default(),
    };

    let err = orchestrator.analyze(&request).await.unwrap_err();
    assert!(matches!(err, AnalysisError::DataLoad(_)));
    assert!(err.to_string().contains("no entry store"));
}

#[tokio::test]
async fn test_short_log_spans_bill_as_one_day() {
    let orchestrator = Orchestrator::new(UaClassifier::new(SignatureSet::builtin()), PriceTable::builtin());

    let one_entry = write_log(&[entry(0, "203.0.113.9", CHROME, "/", 1_000)]);
    let mut second_later = entry(0, "203.0.113.9", CHROME, "/about", 1_000);
    second_later.timestamp += Duration::seconds(1);
    let two_entries = write_log(&[entry(0, "203.0.113.9", CHROME, "/", 1_000), second_later]);

    let single = orchestrator.analyze(&log_request("site-s", one_entry.path())).await.unwrap();
    let pair = orchestrator.analyze(&log_request("site-s", two_entries.path())).await.unwrap();

    assert_eq!(single.window_days, 1.0);
    assert_eq!(pair.window_days, 1.0);
    assert_eq!(single.cost.monthly_factor, pair.cost.monthly_factor);
}
