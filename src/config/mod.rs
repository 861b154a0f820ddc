use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::analysis::AnomalyThresholds;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub api_server: ServerConfig,
    pub cache: CacheConfig,
    /// Path to the analysis settings file, if any
    pub analysis_config: Option<String>,
    /// Directory that API file inputs are resolved against; unset disables them
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Upper bound on hot user agents held in memory
    pub max_entries: u64,
    pub ttl_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let backend_str =
            std::env::var("DATABASE_BACKEND").unwrap_or_else(|_| "sqlite".to_string());

        let backend = match backend_str.to_lowercase().as_str() {
            "postgres" | "postgresql" => DatabaseBackend::Postgres,
            "sqlite" => DatabaseBackend::Sqlite,
            other => {
                tracing::warn!(
                    "Unknown DATABASE_BACKEND '{other}', falling back to 'sqlite'. Supported values: sqlite, postgres"
                );
                DatabaseBackend::Sqlite
            }
        };

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./botlens.db?mode=rwc".to_string());
        let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "5".to_string())
            .parse::<u32>()
            .context("DATABASE_MAX_CONNECTIONS must be a positive integer")?;

        let api_host = std::env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let api_port = std::env::var("API_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()?;

        let cache_entries = std::env::var("CLASSIFICATION_CACHE_ENTRIES")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(50_000);
        let cache_ttl = std::env::var("CLASSIFICATION_CACHE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(600);

        let analysis_config = std::env::var("ANALYSIS_CONFIG").ok();
        let data_dir = std::env::var("DATA_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        Ok(Config {
            database: DatabaseConfig {
                backend,
                url: database_url,
                max_connections: max_connections.max(1),
            },
            api_server: ServerConfig {
                host: api_host,
                port: api_port,
            },
            cache: CacheConfig {
                max_entries: cache_entries,
                ttl_secs: cache_ttl,
            },
            analysis_config,
            data_dir,
        })
    }
}

/// An HTTP endpoint for one of the external capabilities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSettings {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "EndpointSettings::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl EndpointSettings {
    const fn default_timeout_secs() -> u64 {
        30
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    pub batch_size: usize,
    /// Bulk classifier consulted for agents no local tier resolves
    pub external: Option<EndpointSettings>,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            batch_size: 200,
            external: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisambiguationSettings {
    pub confidence_threshold: f64,
    pub stage1_batch_size: usize,
    pub stage2_batch_size: usize,
    pub max_candidates: usize,
    /// Tool calls allowed per stage-2 batch
    pub tool_call_budget: usize,
    /// Run the tool-augmented pass unless a request says otherwise
    pub tools_enabled: bool,
    pub verdict_model: Option<EndpointSettings>,
    pub web_search: Option<EndpointSettings>,
}

impl Default for DisambiguationSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.65,
            stage1_batch_size: 50,
            stage2_batch_size: 10,
            max_candidates: 20,
            tool_call_budget: 6,
            tools_enabled: false,
            verdict_model: None,
            web_search: None,
        }
    }
}

/// Tunables for the analysis pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    pub signatures_path: Option<PathBuf>,
    pub price_table_path: Option<PathBuf>,
    pub default_window_days: f64,
    pub thresholds: AnomalyThresholds,
    pub classifier: ClassifierSettings,
    pub disambiguation: DisambiguationSettings,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            signatures_path: None,
            price_table_path: None,
            default_window_days: 7.0,
            thresholds: AnomalyThresholds::default(),
            classifier: ClassifierSettings::default(),
            disambiguation: DisambiguationSettings::default(),
        }
    }
}

impl AnalysisSettings {
    /// Optional settings file overlaid by `BOTLENS__`-prefixed environment variables
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("BOTLENS")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings: AnalysisSettings = builder
            .build()
            .context("failed to read analysis settings")?
            .try_deserialize()
            .context("invalid analysis settings")?;
        settings.thresholds.validate()?;

        Ok(settings)
    }
}
