use crate::models::CachedClassification;
use crate::storage::{ClassificationCache, ClassificationUpdate};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use moka::future::Cache;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Read-through cache in front of a persistent classification cache
pub struct CachedClassificationCache {
    /// Underlying classification store
    inner: Arc<dyn ClassificationCache>,
    /// Hot user agents (Moka cache)
    read_cache: Cache<String, CachedClassification>,
}

impl CachedClassificationCache {
    pub fn new(inner: Arc<dyn ClassificationCache>, max_entries: u64, ttl_secs: u64) -> Self {
        let read_cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();

        Self { inner, read_cache }
    }

    pub fn entry_count(&self) -> u64 {
        self.read_cache.entry_count()
    }
}

#[async_trait]
impl ClassificationCache for CachedClassificationCache {
    async fn get_many(&self, user_agents: &[String]) -> Result<HashMap<String, CachedClassification>> {
        let mut found = HashMap::with_capacity(user_agents.len());
        let mut misses = Vec::new();

        for ua in user_agents {
            match self.read_cache.get(ua).await {
                Some(hit) => {
                    found.insert(ua.clone(), hit);
                }
                None => misses.push(ua.clone()),
            }
        }

        if misses.is_empty() {
            return Ok(found);
        }

        // Absent keys are not negatively cached so later upserts become visible
        let loaded = self.inner.get_many(&misses).await?;
        for (ua, cached) in loaded {
            self.read_cache.insert(ua.clone(), cached.clone()).await;
            found.insert(ua, cached);
        }

        Ok(found)
    }

    async fn upsert_many(&self, updates: &HashMap<String, ClassificationUpdate>) -> Result<()> {
        self.inner.upsert_many(updates).await?;

        let now = Utc::now();
        for (ua, update) in updates {
            self.read_cache
                .insert(
                    ua.clone(),
                    CachedClassification {
                        verdict: update.verdict.clone(),
                        source: update.source,
                        last_updated: now,
                    },
                )
                .await;
        }

        Ok(())
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<(String, CachedClassification)>> {
        self.inner.list_recent(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Provenance, UaClassification};
    use crate::storage::MemoryClassificationCache;

    fn update(name: &str) -> ClassificationUpdate {
        ClassificationUpdate {
            verdict: UaClassification::bot("crawler", name, 0.9),
            source: Provenance::Signature,
        }
    }

    #[tokio::test]
    async fn test_read_through_and_write_through() {
        let backing = Arc::new(MemoryClassificationCache::new());
        let cache = CachedClassificationCache::new(backing.clone(), 100, 60);

        let mut updates = HashMap::new();
        updates.insert("Bot/1".to_string(), update("bot-one"));
        cache.upsert_many(&updates).await.unwrap();

        // Written through to the backing store
        let direct = backing.get_many(&["Bot/1".to_string()]).await.unwrap();
        assert_eq!(direct["Bot/1"].verdict.bot_name.as_deref(), Some("bot-one"));

        let keys = vec!["Bot/1".to_string(), "Missing/1".to_string()];
        let found = cache.get_many(&keys).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["Bot/1"].source, Provenance::Signature);
    }

    #[tokio::test]
    async fn test_miss_is_not_sticky() {
        let backing = Arc::new(MemoryClassificationCache::new());
        let cache = CachedClassificationCache::new(backing.clone(), 100, 60);
        let keys = vec!["Late/1".to_string()];

        assert!(cache.get_many(&keys).await.unwrap().is_empty());

        let mut updates = HashMap::new();
        updates.insert("Late/1".to_string(), update("late"));
        backing.upsert_many(&updates).await.unwrap();

        assert_eq!(cache.get_many(&keys).await.unwrap().len(), 1);
    }
}
