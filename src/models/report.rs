//! Per-window analysis report

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

use crate::analysis::{AnomalyRecord, ByteBreakdown, CostEstimate, Totals, UaUsage};
use crate::models::{Classification, Provenance};

const TOP_BOTS: usize = 10;

/// Stable identifier for a (site, provider, window, price table) tuple
pub fn report_id(
    site_id: &str,
    provider: &str,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    price_table_version: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "{}|{}|{}|{}|{}",
            site_id,
            provider,
            window_start.timestamp_millis(),
            window_end.timestamp_millis(),
            price_table_version
        )
        .as_bytes(),
    );
    hasher
        .finalize()
        .iter()
        .take(16)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Where the analysed traffic came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSource {
    Aggregates,
    Query,
    RawLog,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputSummary {
    pub source: InputSource,
    /// Whether per-entry data was available for the usage pass
    pub raw_entries_available: bool,
    pub entries_processed: u64,
    pub skipped_lines: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Complete,
    Degraded,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    pub stage: String,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotTypeRollup {
    pub user_agents: usize,
    pub requests: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopBot {
    pub user_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_type: Option<String>,
    pub requests: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationSummary {
    pub total_user_agents: usize,
    pub bot_user_agents: usize,
    pub human_user_agents: usize,
    pub by_provenance: BTreeMap<String, usize>,
    pub by_bot_type: BTreeMap<String, BotTypeRollup>,
    pub top_bots: Vec<TopBot>,
    pub refined_by_disambiguation: usize,
    pub user_agents: BTreeMap<String, Classification>,
}

impl ClassificationSummary {
    /// Roll merged classifications up against per-agent usage.
    ///
    /// `usage` may be empty when only precomputed aggregates were available.
    pub fn build(
        classifications: &HashMap<String, Classification>,
        usage: &HashMap<String, UaUsage>,
    ) -> Self {
        let mut summary = Self {
            total_user_agents: classifications.len(),
            ..Default::default()
        };

        let mut bots = Vec::new();
        for (ua, classification) in classifications {
            let verdict = &classification.verdict;
            *summary
                .by_provenance
                .entry(classification.provenance.as_str().to_string())
                .or_default() += 1;
            if classification.provenance == Provenance::Disambiguation {
                summary.refined_by_disambiguation += 1;
            }

            let used = usage.get(ua).cloned().unwrap_or_default();
            if verdict.is_bot {
                summary.bot_user_agents += 1;
                let bot_type = verdict.bot_type.clone().unwrap_or_else(|| "unknown".to_string());
                let rollup = summary.by_bot_type.entry(bot_type).or_default();
                rollup.user_agents += 1;
                rollup.requests += used.requests;
                rollup.bytes += used.bytes;
                bots.push(TopBot {
                    user_agent: ua.clone(),
                    bot_name: verdict.bot_name.clone(),
                    bot_type: verdict.bot_type.clone(),
                    requests: used.requests,
                    bytes: used.bytes,
                });
            } else {
                summary.human_user_agents += 1;
            }

            summary.user_agents.insert(ua.clone(), classification.clone());
        }

        bots.sort_by(|a, b| {
            b.bytes
                .cmp(&a.bytes)
                .then_with(|| b.requests.cmp(&a.requests))
                .then_with(|| a.user_agent.cmp(&b.user_agent))
        });
        bots.truncate(TOP_BOTS);
        summary.top_bots = bots;

        summary
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub report_id: String,
    pub site_id: String,
    pub provider: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub window_days: f64,
    pub price_table_version: String,
    pub generated_at: DateTime<Utc>,
    pub input: InputSummary,
    pub totals: Totals,
    pub classification: ClassificationSummary,
    pub bytes: ByteBreakdown,
    pub cost: CostEstimate,
    pub anomalies: Vec<AnomalyRecord>,
    pub stages: Vec<StageReport>,
    pub notes: Vec<String>,
}

impl AnalysisReport {
    pub fn is_degraded(&self) -> bool {
        self.stages
            .iter()
            .any(|s| s.status != StageStatus::Complete)
    }
}
