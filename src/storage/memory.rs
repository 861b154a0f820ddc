use crate::models::CachedClassification;
use crate::storage::{ClassificationCache, ClassificationUpdate};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;

/// Process-local classification cache for runs without a database
#[derive(Default)]
pub struct MemoryClassificationCache {
    entries: DashMap<String, CachedClassification>,
}

impl MemoryClassificationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ClassificationCache for MemoryClassificationCache {
    async fn get_many(&self, user_agents: &[String]) -> Result<HashMap<String, CachedClassification>> {
        Ok(user_agents
            .iter()
            .filter_map(|ua| {
                self.entries
                    .get(ua)
                    .map(|entry| (ua.clone(), entry.value().clone()))
            })
            .collect())
    }

    async fn upsert_many(&self, updates: &HashMap<String, ClassificationUpdate>) -> Result<()> {
        let now = Utc::now();
        for (ua, update) in updates {
            self.entries.insert(
                ua.clone(),
                CachedClassification {
                    verdict: update.verdict.clone(),
                    source: update.source,
                    last_updated: now,
                },
            );
        }
        Ok(())
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<(String, CachedClassification)>> {
        let mut all: Vec<(String, CachedClassification)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        all.sort_by(|a, b| b.1.last_updated.cmp(&a.1.last_updated).then_with(|| a.0.cmp(&b.0)));
        all.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(all)
    }
}
