//! Threshold-based anomaly scoring over per-IP minute series
//!
//! Every IP is evaluated independently and may trigger several anomaly
//! types. Each record carries the numbers that made it fire.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::analysis::models::{MinuteCounter, StatusTally};
use crate::error::{AnalysisError, AnalysisResult};

const TRIM_FRACTION: f64 = 0.1;
const SAMPLE_BUCKETS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnomalyThresholds {
    pub min_minutes: usize,
    pub z_score_threshold: f64,
    pub min_max_requests: u64,
    pub burst_multiplier: f64,
    pub burst_min_requests: u64,
    pub min_total_requests: u64,
    #[serde(rename = "high4xxRate")]
    pub high_4xx_rate: f64,
    #[serde(rename = "high5xxRate")]
    pub high_5xx_rate: f64,
    #[serde(rename = "high404Rate")]
    pub high_404_rate: f64,
    pub bytes_per_request_heavy: f64,
    pub steady_mean_min: f64,
    pub steady_cv_max: f64,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self {
            min_minutes: 3,
            z_score_threshold: 3.0,
            min_max_requests: 200,
            burst_multiplier: 5.0,
            burst_min_requests: 300,
            min_total_requests: 100,
            high_4xx_rate: 0.5,
            high_5xx_rate: 0.2,
            high_404_rate: 0.3,
            bytes_per_request_heavy: 1_000_000.0,
            steady_mean_min: 5.0,
            steady_cv_max: 0.2,
        }
    }
}

impl AnomalyThresholds {
    pub fn validate(&self) -> AnalysisResult<()> {
        let floats = [
            ("zScoreThreshold", self.z_score_threshold),
            ("burstMultiplier", self.burst_multiplier),
            ("high4xxRate", self.high_4xx_rate),
            ("high5xxRate", self.high_5xx_rate),
            ("high404Rate", self.high_404_rate),
            ("bytesPerRequestHeavy", self.bytes_per_request_heavy),
            ("steadyMeanMin", self.steady_mean_min),
            ("steadyCvMax", self.steady_cv_max),
        ];
        for (name, value) in floats {
            if !value.is_finite() || value < 0.0 {
                return Err(AnalysisError::AnomalyTool(format!(
                    "threshold {name} must be a non-negative number, got {value}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyType {
    HighRequestRate,
    BurstSpike,
    BytesHeavy,
    SteadyScrape,
    #[serde(rename = "HIGH_4XX_RATE")]
    High4xxRate,
    #[serde(rename = "HIGH_5XX_RATE")]
    High5xxRate,
    #[serde(rename = "HIGH_404_RATE")]
    High404Rate,
}

/// A minute bucket kept as evidence
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleBucket {
    pub minute: i64,
    pub request_count: u64,
    pub byte_count: u64,
}

/// Numbers behind an anomaly; only the fields relevant to its type are set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyEvidence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minutes_observed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_requests: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub std: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cv: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_per_request: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyRecord {
    #[serde(rename = "type")]
    pub kind: AnomalyType,
    pub ip: String,
    pub evidence: AnomalyEvidence,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub samples: Vec<SampleBucket>,
}

/// Summary statistics of one request-count series
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesStats {
    pub minutes: usize,
    pub total_requests: u64,
    pub mean: f64,
    pub std: f64,
    pub median: f64,
    pub trimmed_mean: f64,
    pub max: u64,
    pub baseline: f64,
    pub z_score: f64,
    pub burst_ratio: f64,
}

impl SeriesStats {
    /// Compute stats over request counts (one value per observed minute)
    pub fn from_counts(counts: &[u64]) -> Option<Self> {
        if counts.is_empty() {
            return None;
        }

        let values: Vec<f64> = counts.iter().map(|&c| c as f64).collect();
        let mean = values.iter().mean();
        let std = values.iter().population_std_dev();
        let max = counts.iter().copied().max().unwrap_or(0);

        let mut sorted = values.clone();
        sorted.sort_by(f64::total_cmp);
        let median = median_of_sorted(&sorted);
        let trimmed_mean = trimmed_mean_of_sorted(&sorted, TRIM_FRACTION);

        let baseline = ((median + trimmed_mean + mean) / 3.0).round().max(1.0);
        let z_score = if std > 0.0 {
            (max as f64 - mean) / std
        } else {
            0.0
        };

        Some(Self {
            minutes: counts.len(),
            total_requests: counts.iter().sum(),
            mean,
            std,
            median,
            trimmed_mean,
            max,
            baseline,
            z_score,
            burst_ratio: max as f64 / baseline,
        })
    }

    pub fn coefficient_of_variation(&self) -> f64 {
        if self.mean > 0.0 {
            self.std / self.mean
        } else {
            0.0
        }
    }
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Mean after dropping floor(n * fraction) values from each end
fn trimmed_mean_of_sorted(sorted: &[f64], fraction: f64) -> f64 {
    let trim = (sorted.len() as f64 * fraction).floor() as usize;
    let kept = &sorted[trim..sorted.len() - trim];
    kept.iter().mean()
}

/// Scores per-IP minute series against configurable thresholds
#[derive(Debug, Clone, Default)]
pub struct AnomalyDetector {
    thresholds: AnomalyThresholds,
}

impl AnomalyDetector {
    pub fn new(thresholds: AnomalyThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &AnomalyThresholds {
        &self.thresholds
    }

    /// Evaluate every IP; output is ordered by IP then anomaly type
    pub fn detect(
        &self,
        by_ip_minute: &HashMap<String, BTreeMap<i64, MinuteCounter>>,
        by_ip_status: Option<&HashMap<String, StatusTally>>,
    ) -> AnalysisResult<Vec<AnomalyRecord>> {
        self.thresholds.validate()?;

        let mut ips: Vec<&String> = by_ip_minute.keys().collect();
        ips.sort();

        let mut records = Vec::new();
        for ip in ips {
            let series = &by_ip_minute[ip];
            let status = by_ip_status.and_then(|s| s.get(ip));
            records.extend(self.evaluate_ip(ip, series, status));
        }

        debug!("Anomaly detection produced {} records", records.len());
        Ok(records)
    }

    fn evaluate_ip(
        &self,
        ip: &str,
        series: &BTreeMap<i64, MinuteCounter>,
        status: Option<&StatusTally>,
    ) -> Vec<AnomalyRecord> {
        let t = &self.thresholds;
        let counts: Vec<u64> = series.values().map(|c| c.request_count).collect();
        let Some(stats) = SeriesStats::from_counts(&counts) else {
            return Vec::new();
        };
        let total_bytes: u64 = series.values().map(|c| c.byte_count).sum();
        let samples = top_buckets(series);

        let mut records = Vec::new();
        let mut push = |kind: AnomalyType, evidence: AnomalyEvidence, with_samples: bool| {
            records.push(AnomalyRecord {
                kind,
                ip: ip.to_string(),
                evidence,
                samples: if with_samples { samples.clone() } else { Vec::new() },
            });
        };

        if stats.minutes >= t.min_minutes
            && stats.max >= t.min_max_requests
            && stats.z_score >= t.z_score_threshold
        {
            push(
                AnomalyType::HighRequestRate,
                AnomalyEvidence {
                    minutes_observed: Some(stats.minutes),
                    max: Some(stats.max),
                    mean: Some(stats.mean),
                    std: Some(stats.std),
                    baseline: Some(stats.baseline),
                    z_score: Some(stats.z_score),
                    ..Default::default()
                },
                true,
            );
        }

        if stats.minutes >= t.min_minutes
            && stats.max >= t.burst_min_requests
            && stats.burst_ratio >= t.burst_multiplier
        {
            push(
                AnomalyType::BurstSpike,
                AnomalyEvidence {
                    minutes_observed: Some(stats.minutes),
                    max: Some(stats.max),
                    baseline: Some(stats.baseline),
                    ratio: Some(stats.burst_ratio),
                    z_score: Some(stats.z_score),
                    ..Default::default()
                },
                true,
            );
        }

        if stats.total_requests > 0 {
            let bytes_per_request = total_bytes as f64 / stats.total_requests as f64;
            if bytes_per_request >= t.bytes_per_request_heavy
                && stats.total_requests as f64 >= t.min_total_requests as f64 / 2.0
            {
                push(
                    AnomalyType::BytesHeavy,
                    AnomalyEvidence {
                        total_requests: Some(stats.total_requests),
                        total_bytes: Some(total_bytes),
                        bytes_per_request: Some(bytes_per_request),
                        ..Default::default()
                    },
                    true,
                );
            }
        }

        let cv = stats.coefficient_of_variation();
        if stats.minutes >= (2 * t.min_minutes).max(6)
            && stats.mean >= t.steady_mean_min
            && cv <= t.steady_cv_max
            && stats.total_requests >= t.min_total_requests
        {
            push(
                AnomalyType::SteadyScrape,
                AnomalyEvidence {
                    minutes_observed: Some(stats.minutes),
                    total_requests: Some(stats.total_requests),
                    mean: Some(stats.mean),
                    std: Some(stats.std),
                    cv: Some(cv),
                    ..Default::default()
                },
                false,
            );
        }

        if let Some(status) = status {
            if status.total >= t.min_total_requests && status.total > 0 {
                if !status.is_consistent() {
                    debug!("Skipping status-rate anomalies for {ip}: inconsistent status tally");
                } else {
                    let checks = [
                        (AnomalyType::High4xxRate, status.status_4xx, t.high_4xx_rate),
                        (AnomalyType::High5xxRate, status.status_5xx, t.high_5xx_rate),
                        (AnomalyType::High404Rate, status.status_404, t.high_404_rate),
                    ];
                    for (kind, count, threshold) in checks {
                        let rate = count as f64 / status.total as f64;
                        if rate >= threshold {
                            push(
                                kind,
                                AnomalyEvidence {
                                    total_requests: Some(status.total),
                                    count: Some(count),
                                    rate: Some(rate),
                                    ..Default::default()
                                },
                                false,
                            );
                        }
                    }
                }
            }
        }

        records
    }
}

/// Top buckets by request count, ties broken by earliest minute
fn top_buckets(series: &BTreeMap<i64, MinuteCounter>) -> Vec<SampleBucket> {
    let mut buckets: Vec<SampleBucket> = series
        .iter()
        .map(|(&minute, c)| SampleBucket {
            minute,
            request_count: c.request_count,
            byte_count: c.byte_count,
        })
        .collect();
    buckets.sort_by(|a, b| {
        b.request_count
            .cmp(&a.request_count)
            .then(a.minute.cmp(&b.minute))
    });
    buckets.truncate(SAMPLE_BUCKETS);
    buckets
}
