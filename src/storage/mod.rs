pub mod cached;
pub mod memory;
pub mod postgres;
mod rows;
pub mod sqlite;
pub mod trait_def;

pub use cached::CachedClassificationCache;
pub use memory::MemoryClassificationCache;
pub use postgres::PostgresStorage;
pub use sqlite::SqliteStorage;
pub use trait_def::{
    ClassificationCache, ClassificationUpdate, EntryStore, ReportSink, Storage, StorageError,
    StorageResult,
};

use std::sync::Arc;

use crate::config::{Config, DatabaseBackend};

/// One backend viewed through each of its persistence roles
#[derive(Clone)]
pub struct StorageHandles {
    pub cache: Arc<dyn ClassificationCache>,
    pub entries: Arc<dyn EntryStore>,
    pub reports: Arc<dyn ReportSink>,
}

impl StorageHandles {
    pub fn from_backend<S: Storage + 'static>(storage: Arc<S>) -> Self {
        Self {
            cache: storage.clone(),
            entries: storage.clone(),
            reports: storage,
        }
    }

    /// Put a moka read cache in front of the classification cache
    pub fn with_read_cache(mut self, max_entries: u64, ttl_secs: u64) -> Self {
        self.cache = Arc::new(CachedClassificationCache::new(
            self.cache,
            max_entries,
            ttl_secs,
        ));
        self
    }
}

/// Connect to the configured backend and create its schema
pub async fn connect(config: &Config) -> anyhow::Result<StorageHandles> {
    let database = &config.database;
    let handles = match database.backend {
        DatabaseBackend::Sqlite => {
            tracing::info!("Using SQLite storage: {}", database.url);
            let storage = SqliteStorage::new(&database.url, database.max_connections).await?;
            storage.init().await?;
            StorageHandles::from_backend(Arc::new(storage))
        }
        DatabaseBackend::Postgres => {
            tracing::info!("Using PostgreSQL storage: {}", database.url);
            let storage = PostgresStorage::new(&database.url, database.max_connections).await?;
            storage.init().await?;
            StorageHandles::from_backend(Arc::new(storage))
        }
    };

    Ok(handles.with_read_cache(config.cache.max_entries, config.cache.ttl_secs))
}
