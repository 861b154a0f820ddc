//! Data models for log aggregation

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

/// Requests and bytes seen from one IP within one minute bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinuteCounter {
    pub request_count: u64,
    pub byte_count: u64,
}

/// Request count and byte total for a rollup bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub count: u64,
    pub bytes: u64,
}

impl Tally {
    pub fn add(&mut self, bytes: u64) {
        self.count += 1;
        self.bytes += bytes;
    }

    pub fn merge(&mut self, other: &Tally) {
        self.count += other.count;
        self.bytes += other.bytes;
    }
}

/// Static asset vs dynamic page rollup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathGroupRollup {
    #[serde(rename = "static")]
    pub static_assets: Tally,
    pub dynamic: Tally,
}

/// Per-IP status totals feeding the error-rate anomalies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTally {
    pub total: u64,
    #[serde(rename = "status4xx", default)]
    pub status_4xx: u64,
    #[serde(rename = "status5xx", default)]
    pub status_5xx: u64,
    #[serde(rename = "status404", default)]
    pub status_404: u64,
}

impl StatusTally {
    /// Counts that could have come from one consistent set of requests
    pub fn is_consistent(&self) -> bool {
        self.status_4xx + self.status_5xx <= self.total && self.status_404 <= self.status_4xx
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub total_bytes: u64,
    pub total_requests: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Single-pass compaction of a log-entry stream.
///
/// Also the shape of the precomputed aggregates artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationResult {
    pub unique_user_agents: BTreeSet<String>,

    /// IP -> minute bucket (unix seconds) -> counters
    #[serde(rename = "byIPMinute", alias = "byIpMinute")]
    pub by_ip_minute: HashMap<String, BTreeMap<i64, MinuteCounter>>,

    pub by_status: BTreeMap<String, Tally>,

    pub by_path_group: PathGroupRollup,

    #[serde(default)]
    pub by_ip_status: HashMap<String, StatusTally>,

    pub totals: Totals,
}

impl AggregationResult {
    /// Load a precomputed aggregates artifact
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read aggregates file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse aggregates file {}", path.display()))
    }

    pub fn is_empty(&self) -> bool {
        self.totals.total_requests == 0
    }
}
