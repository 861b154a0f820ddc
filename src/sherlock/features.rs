//! Behavioral feature vectors for hard-to-classify user agents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::analysis::{AnomalyRecord, AnomalyType, SeriesStats};
use crate::models::LogEntry;

const SAMPLE_IPS: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UaFeatures {
    pub user_agent: String,
    pub total_requests: u64,
    pub total_bytes: u64,
    pub unique_ips: usize,
    pub minutes_observed: usize,
    pub mean_per_minute: f64,
    pub std_per_minute: f64,
    pub max_per_minute: u64,
    pub burst_z_score: f64,
    pub rate_4xx: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    /// 0-100, higher is more bot-like
    pub suspicion_score: u8,
    pub has_anomaly: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomaly_types: Vec<AnomalyType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample_ips: Vec<String>,
}

/// Weighted 0-100 score from the behavioral signals
pub fn suspicion_score(
    burst_z_score: f64,
    rate_4xx: f64,
    mean_per_minute: f64,
    max_per_minute: u64,
    unique_ips: usize,
) -> u8 {
    let mut score: u32 = 0;
    if burst_z_score >= 3.0 {
        score += 30;
    } else if burst_z_score >= 2.0 {
        score += 15;
    }
    if rate_4xx >= 0.6 {
        score += 40;
    } else if rate_4xx >= 0.3 {
        score += 20;
    }
    if mean_per_minute >= 5.0 {
        score += 20;
    }
    if max_per_minute >= 20 {
        score += 10;
    }
    if unique_ips >= 5 {
        score += 10;
    }
    score.min(100) as u8
}

#[derive(Debug, Default)]
struct UaAccumulator {
    requests: u64,
    bytes: u64,
    status_4xx: u64,
    ips: BTreeSet<String>,
    minutes: BTreeMap<i64, u64>,
    first_seen: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
}

/// Collects features for a fixed set of target agents
#[derive(Debug, Default)]
pub struct FeatureExtractor {
    targets: BTreeMap<String, UaAccumulator>,
}

impl FeatureExtractor {
    pub fn new<I>(targets: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            targets: targets
                .into_iter()
                .map(|ua| (ua, UaAccumulator::default()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Entries from agents outside the target set are ignored
    pub fn observe(&mut self, entry: &LogEntry) {
        let Some(acc) = self.targets.get_mut(entry.user_agent()) else {
            return;
        };
        acc.requests += 1;
        acc.bytes += entry.bytes();
        if matches!(entry.status_code, Some(400..=499)) {
            acc.status_4xx += 1;
        }
        acc.ips.insert(entry.client_ip().to_string());
        *acc.minutes.entry(entry.minute_bucket()).or_default() += 1;
        acc.first_seen = Some(match acc.first_seen {
            Some(first) => first.min(entry.timestamp),
            None => entry.timestamp,
        });
        acc.last_seen = Some(match acc.last_seen {
            Some(last) => last.max(entry.timestamp),
            None => entry.timestamp,
        });
    }

    /// Build feature vectors, flagging agents seen on anomalous IPs.
    ///
    /// Output is ordered by suspicion, highest first.
    pub fn finish(self, anomalies: &[AnomalyRecord]) -> Vec<UaFeatures> {
        let mut by_ip: HashMap<&str, BTreeSet<AnomalyType>> = HashMap::new();
        for record in anomalies {
            by_ip.entry(record.ip.as_str()).or_default().insert(record.kind);
        }

        let mut features: Vec<UaFeatures> = self
            .targets
            .into_iter()
            .map(|(user_agent, acc)| build_features(user_agent, acc, &by_ip))
            .collect();
        features.sort_by(|a, b| {
            b.suspicion_score
                .cmp(&a.suspicion_score)
                .then_with(|| b.total_requests.cmp(&a.total_requests))
                .then_with(|| a.user_agent.cmp(&b.user_agent))
        });
        features
    }
}

fn build_features(
    user_agent: String,
    acc: UaAccumulator,
    anomalous_ips: &HashMap<&str, BTreeSet<AnomalyType>>,
) -> UaFeatures {
    let counts: Vec<u64> = acc.minutes.values().copied().collect();
    let stats = SeriesStats::from_counts(&counts);
    let (mean, std, max, z) = stats
        .map(|s| (s.mean, s.std, s.max, s.z_score))
        .unwrap_or_default();
    let rate_4xx = if acc.requests > 0 {
        acc.status_4xx as f64 / acc.requests as f64
    } else {
        0.0
    };

    let anomaly_types: BTreeSet<AnomalyType> = acc
        .ips
        .iter()
        .filter_map(|ip| anomalous_ips.get(ip.as_str()))
        .flatten()
        .copied()
        .collect();

    UaFeatures {
        user_agent,
        total_requests: acc.requests,
        total_bytes: acc.bytes,
        unique_ips: acc.ips.len(),
        minutes_observed: counts.len(),
        mean_per_minute: mean,
        std_per_minute: std,
        max_per_minute: max,
        burst_z_score: z,
        rate_4xx,
        first_seen: acc.first_seen,
        last_seen: acc.last_seen,
        suspicion_score: suspicion_score(z, rate_4xx, mean, max, acc.ips.len()),
        has_anomaly: !anomaly_types.is_empty(),
        anomaly_types: anomaly_types.into_iter().collect(),
        sample_ips: acc.ips.into_iter().take(SAMPLE_IPS).collect(),
    }
}
