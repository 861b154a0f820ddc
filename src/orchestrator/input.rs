//! Input resolution and the per-entry usage pass

use anyhow::anyhow;
use futures::stream::{BoxStream, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

use crate::analysis::{aggregate_stream, open_log_file, AggregationResult, UaByteLedger};
use crate::error::AnalysisError;
use crate::models::{InputSource, LogEntry};
use crate::orchestrator::outcome::StageOutcome;
use crate::orchestrator::request::{DataReference, WindowQuery};
use crate::sherlock::FeatureExtractor;
use crate::storage::EntryStore;

/// Per-entry data that can be replayed for the usage pass
#[derive(Debug, Clone)]
pub(crate) enum RawSource {
    Query(WindowQuery),
    File(PathBuf),
}

#[derive(Debug)]
pub(crate) struct ResolvedInput {
    pub aggregation: AggregationResult,
    pub source: InputSource,
    pub raw: Option<RawSource>,
    pub query: Option<WindowQuery>,
    pub skipped_lines: u64,
}

/// Aggregates file, then window query, then raw log file.
///
/// Sources that are missing, unreadable or empty are skipped with a note;
/// running out of sources is fatal.
pub(crate) async fn resolve_input(
    site_id: &str,
    data: &DataReference,
    entries: Option<&dyn EntryStore>,
) -> StageOutcome<ResolvedInput> {
    let mut notes = Vec::new();

    let replayable = match (data.query, entries) {
        (Some(query), Some(_)) => Some(RawSource::Query(query)),
        _ => data.log_path.clone().map(RawSource::File),
    };

    if let Some(path) = &data.aggregates_path {
        match AggregationResult::load(path).await {
            Ok(aggregation) if !aggregation.is_empty() => {
                info!("Using precomputed aggregates from {}", path.display());
                return StageOutcome::from_notes(
                    ResolvedInput {
                        aggregation,
                        source: InputSource::Aggregates,
                        raw: replayable,
                        query: data.query,
                        skipped_lines: 0,
                    },
                    notes,
                );
            }
            Ok(_) => notes.push(format!("aggregates file {} is empty", path.display())),
            Err(e) => notes.push(format!("{e:#}")),
        }
    }

    if let Some(query) = data.query {
        match entries {
            Some(store) => match aggregate_query(store, site_id, query).await {
                Ok(aggregation) if !aggregation.is_empty() => {
                    info!(
                        "Aggregated {} stored entries for site {}",
                        aggregation.totals.total_requests, site_id
                    );
                    return StageOutcome::from_notes(
                        ResolvedInput {
                            aggregation,
                            source: InputSource::Query,
                            raw: Some(RawSource::Query(query)),
                            query: Some(query),
                            skipped_lines: 0,
                        },
                        notes,
                    );
                }
                Ok(_) => notes.push(format!(
                    "no stored entries for site {site_id} between {} and {}",
                    query.start, query.end
                )),
                Err(e) => notes.push(format!("window query failed: {e:#}")),
            },
            None => notes.push("window query requested but no entry store is configured".to_string()),
        }
    }

    if let Some(path) = &data.log_path {
        match aggregate_file(path).await {
            Ok((aggregation, skipped_lines)) if !aggregation.is_empty() => {
                info!("Aggregated {} entries from {}", aggregation.totals.total_requests, path.display());
                if skipped_lines > 0 {
                    notes.push(format!("skipped {skipped_lines} malformed log lines"));
                }
                return StageOutcome::from_notes(
                    ResolvedInput {
                        aggregation,
                        source: InputSource::RawLog,
                        raw: Some(RawSource::File(path.clone())),
                        query: data.query,
                        skipped_lines,
                    },
                    notes,
                );
            }
            Ok(_) => notes.push(format!("log file {} has no entries", path.display())),
            Err(e) => notes.push(format!("{e:#}")),
        }
    }

    for note in &notes {
        warn!("Input source skipped: {}", note);
    }
    let detail = if notes.is_empty() {
        "no data reference supplied".to_string()
    } else {
        notes.join("; ")
    };
    StageOutcome::Fatal(AnalysisError::DataLoad(detail))
}

async fn aggregate_query(
    store: &dyn EntryStore,
    site_id: &str,
    query: WindowQuery,
) -> anyhow::Result<AggregationResult> {
    aggregate_stream(store.stream_entries(site_id, query.start, query.end)).await
}

async fn aggregate_file(path: &Path) -> anyhow::Result<(AggregationResult, u64)> {
    let log = open_log_file(path).await?;
    let skipped = Arc::clone(&log.skipped);
    let aggregation = aggregate_stream(log.entries).await?;
    Ok((aggregation, skipped.load(Ordering::Relaxed)))
}

/// Replay the raw entries into the byte ledger and the feature extractor
pub(crate) async fn usage_pass(
    raw: &RawSource,
    site_id: &str,
    entries: Option<&dyn EntryStore>,
    ledger: &mut UaByteLedger,
    extractor: &mut FeatureExtractor,
) -> anyhow::Result<u64> {
    let mut stream: BoxStream<'_, anyhow::Result<LogEntry>> = match raw {
        RawSource::Query(query) => entries
            .ok_or_else(|| anyhow!("no entry store configured"))?
            .stream_entries(site_id, query.start, query.end),
        RawSource::File(path) => open_log_file(path).await?.entries,
    };

    let mut seen = 0;
    while let Some(entry) = stream.next().await {
        let entry = entry?;
        ledger.observe(&entry);
        extractor.observe(&entry);
        seen += 1;
    }
    Ok(seen)
}
