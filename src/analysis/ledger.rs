//! Per-user-agent byte ledger
//!
//! Filled during the usage pass, then resolved into a bot/human byte
//! breakdown once classifications are merged.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::analysis::models::{AggregationResult, Tally};
use crate::models::{Classification, LogEntry, PathGroup};

pub const CATEGORY_BOT: &str = "bot";
pub const CATEGORY_HUMAN: &str = "human";
pub const CATEGORY_UNATTRIBUTED: &str = "unattributed";

/// Traffic attributed to one user agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UaUsage {
    pub requests: u64,
    pub bytes: u64,
    #[serde(rename = "static")]
    pub static_assets: Tally,
    pub dynamic: Tally,
    pub by_status: BTreeMap<String, Tally>,
}

/// Byte totals by audience, path group and status class
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ByteBreakdown {
    pub total_bytes: u64,
    pub total_requests: u64,
    pub bot: Tally,
    pub human: Tally,
    /// Traffic that could not be attributed to bot or human
    pub unattributed: Tally,
    #[serde(rename = "static")]
    pub static_assets: Tally,
    pub dynamic: Tally,
    pub by_status: BTreeMap<String, Tally>,
}

impl ByteBreakdown {
    /// Mutually exclusive categories handed to the cost calculator
    pub fn cost_categories(&self) -> BTreeMap<String, u64> {
        let mut categories = BTreeMap::new();
        if self.bot.count > 0 || self.human.count > 0 {
            categories.insert(CATEGORY_BOT.to_string(), self.bot.bytes);
            categories.insert(CATEGORY_HUMAN.to_string(), self.human.bytes);
        }
        if self.unattributed.count > 0 {
            categories.insert(CATEGORY_UNATTRIBUTED.to_string(), self.unattributed.bytes);
        }
        categories
    }

    /// Breakdown when only precomputed aggregates are available
    pub fn from_aggregation(aggregation: &AggregationResult) -> Self {
        let totals = &aggregation.totals;
        Self {
            total_bytes: totals.total_bytes,
            total_requests: totals.total_requests,
            bot: Tally::default(),
            human: Tally::default(),
            unattributed: Tally {
                count: totals.total_requests,
                bytes: totals.total_bytes,
            },
            static_assets: aggregation.by_path_group.static_assets,
            dynamic: aggregation.by_path_group.dynamic,
            by_status: aggregation.by_status.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct UaByteLedger {
    usage: HashMap<String, UaUsage>,
}

impl UaByteLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, entry: &LogEntry) {
        let bytes = entry.bytes();
        let usage = self.usage.entry(entry.user_agent().to_string()).or_default();
        usage.requests += 1;
        usage.bytes += bytes;
        match entry.path_group() {
            PathGroup::Static => usage.static_assets.add(bytes),
            PathGroup::Dynamic => usage.dynamic.add(bytes),
        }
        usage
            .by_status
            .entry(entry.status_class())
            .or_default()
            .add(bytes);
    }

    pub fn usage(&self) -> &HashMap<String, UaUsage> {
        &self.usage
    }

    /// Resolve the ledger against merged classifications.
    ///
    /// The empty user agent is always bot traffic; an agent with no
    /// classification lands in `unattributed`.
    pub fn breakdown(&self, classifications: &HashMap<String, Classification>) -> ByteBreakdown {
        let mut out = ByteBreakdown::default();

        for (ua, usage) in &self.usage {
            let is_bot = if ua.is_empty() {
                Some(true)
            } else {
                classifications.get(ua).map(|c| c.verdict.is_bot)
            };
            let audience = match is_bot {
                Some(true) => &mut out.bot,
                Some(false) => &mut out.human,
                None => &mut out.unattributed,
            };
            audience.merge(&Tally {
                count: usage.requests,
                bytes: usage.bytes,
            });

            out.total_bytes += usage.bytes;
            out.total_requests += usage.requests;
            out.static_assets.merge(&usage.static_assets);
            out.dynamic.merge(&usage.dynamic);
            for (class, tally) in &usage.by_status {
                out.by_status.entry(class.clone()).or_default().merge(tally);
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Provenance, UaClassification};
    use chrono::{TimeZone, Utc};

    fn entry(ua: &str, path: &str, status: u16, bytes: u64) -> LogEntry {
        LogEntry {
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            ip: Some("10.0.0.1".to_string()),
            user_agent: Some(ua.to_string()),
            method: None,
            path: Some(path.to_string()),
            status_code: Some(status),
            bytes_transferred: Some(bytes),
            referer: None,
        }
    }

    #[test]
    fn test_breakdown_partitions_traffic() {
        let mut ledger = UaByteLedger::new();
        ledger.observe(&entry("GPTBot/1.0", "/post", 200, 400));
        ledger.observe(&entry("GPTBot/1.0", "/style.css", 200, 100));
        ledger.observe(&entry("Mozilla/5.0", "/", 200, 1000));
        ledger.observe(&entry("", "/", 404, 5));
        ledger.observe(&entry("Mystery/2", "/x", 500, 7));

        let mut classifications = HashMap::new();
        classifications.insert(
            "GPTBot/1.0".to_string(),
            Classification::new(
                UaClassification::bot("ai_training", "GPTBot", 0.99),
                Provenance::Signature,
            ),
        );
        classifications.insert(
            "Mozilla/5.0".to_string(),
            Classification::new(UaClassification::unresolved_default(), Provenance::Default),
        );

        let b = ledger.breakdown(&classifications);
        assert_eq!(b.bot, Tally { count: 3, bytes: 505 });
        assert_eq!(b.human, Tally { count: 1, bytes: 1000 });
        assert_eq!(b.unattributed, Tally { count: 1, bytes: 7 });
        assert_eq!(b.total_bytes, 1512);
        assert_eq!(b.static_assets, Tally { count: 1, bytes: 100 });
        assert_eq!(b.dynamic.count, 4);
        assert_eq!(b.by_status["4xx"].bytes, 5);

        let categories = b.cost_categories();
        assert_eq!(categories["bot"], 505);
        assert_eq!(categories["human"], 1000);
        assert_eq!(categories["unattributed"], 7);
        assert_eq!(categories.values().sum::<u64>(), b.total_bytes);
    }

    #[test]
    fn test_padded_agents_share_one_key() {
        let mut ledger = UaByteLedger::new();
        ledger.observe(&entry("curl/8", "/a", 200, 10));
        ledger.observe(&entry("  curl/8 ", "/b", 200, 20));
        ledger.observe(&entry("\tcurl/8", "/c", 200, 30));

        assert_eq!(ledger.usage().len(), 1);
        assert_eq!(ledger.usage()["curl/8"].requests, 3);

        let mut classifications = HashMap::new();
        classifications.insert(
            "curl/8".to_string(),
            Classification::new(UaClassification::bot("tool", "curl", 0.9), Provenance::Signature),
        );
        let b = ledger.breakdown(&classifications);
        assert_eq!(b.bot, Tally { count: 3, bytes: 60 });
        assert_eq!(b.unattributed, Tally::default());
    }
}
