//! Single-pass log aggregation
//!
//! Compacts a log-entry stream into per-minute/per-IP counters plus status,
//! path-group and user-agent rollups. Memory grows with distinct
//! (IP, minute) pairs, never with entry count, so streaming sources are
//! consumed without buffering.

use futures::stream::{Stream, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::analysis::models::{
    AggregationResult, MinuteCounter, PathGroupRollup, StatusTally, Tally, Totals,
};
use crate::models::{LogEntry, PathGroup};

/// Incremental aggregator; feed entries with [`Aggregator::observe`]
#[derive(Debug, Default)]
pub struct Aggregator {
    unique_user_agents: BTreeSet<String>,
    by_ip_minute: HashMap<String, BTreeMap<i64, MinuteCounter>>,
    by_status: BTreeMap<String, Tally>,
    by_path_group: PathGroupRollup,
    by_ip_status: HashMap<String, StatusTally>,
    totals: Totals,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one entry into the running counters
    pub fn observe(&mut self, entry: &LogEntry) {
        let ip = entry.client_ip();
        let bytes = entry.bytes();

        let ua = entry.user_agent();
        if !ua.is_empty() && !self.unique_user_agents.contains(ua) {
            self.unique_user_agents.insert(ua.to_string());
        }

        let counter = self
            .by_ip_minute
            .entry(ip.to_string())
            .or_default()
            .entry(entry.minute_bucket())
            .or_default();
        counter.request_count += 1;
        counter.byte_count += bytes;

        self.by_status
            .entry(entry.status_class())
            .or_default()
            .add(bytes);

        match entry.path_group() {
            PathGroup::Static => self.by_path_group.static_assets.add(bytes),
            PathGroup::Dynamic => self.by_path_group.dynamic.add(bytes),
        }

        let status = self.by_ip_status.entry(ip.to_string()).or_default();
        status.total += 1;
        match entry.status_code {
            Some(404) => {
                status.status_4xx += 1;
                status.status_404 += 1;
            }
            Some(400..=499) => status.status_4xx += 1,
            Some(500..=599) => status.status_5xx += 1,
            _ => {}
        }

        self.totals.total_bytes += bytes;
        self.totals.total_requests += 1;
        self.totals.start_time = Some(match self.totals.start_time {
            Some(start) => start.min(entry.timestamp),
            None => entry.timestamp,
        });
        self.totals.end_time = Some(match self.totals.end_time {
            Some(end) => end.max(entry.timestamp),
            None => entry.timestamp,
        });
    }

    pub fn entries_seen(&self) -> u64 {
        self.totals.total_requests
    }

    pub fn finish(self) -> AggregationResult {
        debug!(
            "Aggregated {} entries across {} IPs and {} user agents",
            self.totals.total_requests,
            self.by_ip_minute.len(),
            self.unique_user_agents.len()
        );

        AggregationResult {
            unique_user_agents: self.unique_user_agents,
            by_ip_minute: self.by_ip_minute,
            by_status: self.by_status,
            by_path_group: self.by_path_group,
            by_ip_status: self.by_ip_status,
            totals: self.totals,
        }
    }
}

/// Aggregate an in-memory sequence of entries
pub fn aggregate<'a, I>(entries: I) -> AggregationResult
where
    I: IntoIterator<Item = &'a LogEntry>,
{
    let mut aggregator = Aggregator::new();
    for entry in entries {
        aggregator.observe(entry);
    }
    aggregator.finish()
}

/// Aggregate an async stream of entries without buffering it
pub async fn aggregate_stream<S>(entries: S) -> anyhow::Result<AggregationResult>
where
    S: Stream<Item = anyhow::Result<LogEntry>>,
{
    let mut aggregator = Aggregator::new();

    tokio::pin!(entries);
    while let Some(entry) = entries.next().await {
        aggregator.observe(&entry?);
    }

    Ok(aggregator.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn entry(secs: i64, ip: Option<&str>, ua: Option<&str>, path: &str, status: Option<u16>, bytes: u64) -> LogEntry {
        LogEntry {
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            ip: ip.map(str::to_string),
            user_agent: ua.map(str::to_string),
            method: Some("GET".to_string()),
            path: Some(path.to_string()),
            status_code: status,
            bytes_transferred: Some(bytes),
            referer: None,
        }
    }

    fn sample() -> Vec<LogEntry> {
        vec![
            entry(1_700_000_000, Some("1.1.1.1"), Some("Mozilla/5.0"), "/", Some(200), 1000),
            entry(1_700_000_030, Some("1.1.1.1"), Some("Mozilla/5.0"), "/app.js", Some(200), 500),
            entry(1_700_000_065, Some("1.1.1.1"), Some("curl/8.0"), "/missing", Some(404), 10),
            entry(1_700_000_070, None, Some("  "), "/robots.txt", None, 20),
            entry(1_700_000_200, Some("2.2.2.2"), None, "/api?x=1", Some(503), 0),
        ]
    }

    #[test]
    fn test_rollup_counts_match_entry_count() {
        let entries = sample();
        let result = aggregate(&entries);

        let status_sum: u64 = result.by_status.values().map(|t| t.count).sum();
        let path_sum = result.by_path_group.static_assets.count + result.by_path_group.dynamic.count;
        assert_eq!(status_sum, entries.len() as u64);
        assert_eq!(path_sum, entries.len() as u64);
        assert_eq!(result.totals.total_requests, 5);
        assert_eq!(result.totals.total_bytes, 1530);
        assert_eq!(result.by_status["0xx"].count, 1);
        assert_eq!(result.by_status["4xx"].bytes, 10);
        assert_eq!(result.by_path_group.static_assets.count, 2);
    }

    #[test]
    fn test_minute_buckets_and_unknown_ip() {
        let result = aggregate(&sample());
        let series = &result.by_ip_minute["1.1.1.1"];
        assert_eq!(series.len(), 2);
        let first = series[&(1_700_000_000 / 60 * 60)];
        assert_eq!(first.request_count, 2);
        assert_eq!(first.byte_count, 1500);
        assert!(result.by_ip_minute.contains_key("unknown"));

        let status = result.by_ip_status["1.1.1.1"];
        assert_eq!(status.total, 3);
        assert_eq!(status.status_404, 1);
        assert_eq!(status.status_4xx, 1);
        assert_eq!(result.by_ip_status["2.2.2.2"].status_5xx, 1);
    }

    #[test]
    fn test_unique_user_agents_skip_blank() {
        let result = aggregate(&sample());
        let uas: Vec<&str> = result.unique_user_agents.iter().map(String::as_str).collect();
        assert_eq!(uas, vec!["Mozilla/5.0", "curl/8.0"]);
    }

    #[test]
    fn test_padded_user_agents_collapse() {
        let entries = vec![
            entry(1_700_000_000, Some("1.1.1.1"), Some("curl/8"), "/", Some(200), 1),
            entry(1_700_000_001, Some("1.1.1.1"), Some("  curl/8 "), "/", Some(200), 1),
        ];
        let result = aggregate(&entries);
        assert_eq!(result.unique_user_agents.len(), 1);
        assert!(result.unique_user_agents.contains("curl/8"));
    }

    #[test]
    fn test_reaggregation_is_identical() {
        let entries = sample();
        let mut reversed = entries.clone();
        reversed.reverse();
        assert_eq!(aggregate(&entries), aggregate(&entries));
        assert_eq!(aggregate(&entries), aggregate(&reversed));
    }

    #[tokio::test]
    async fn test_stream_matches_iterator() {
        let entries = sample();
        let stream = futures::stream::iter(entries.clone().into_iter().map(Ok));
        let streamed = aggregate_stream(stream).await.unwrap();
        assert_eq!(streamed, aggregate(&entries));
    }

    #[tokio::test]
    async fn test_stream_error_propagates() {
        let stream = futures::stream::iter(vec![
            Ok(sample().remove(0)),
            Err(anyhow::anyhow!("connection reset")),
        ]);
        assert!(aggregate_stream(stream).await.is_err());
    }

    #[test]
    fn test_artifact_roundtrip_keeps_minute_keys() {
        let result = aggregate(&sample());
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("byIPMinute"));
        let back: AggregationResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }
}
