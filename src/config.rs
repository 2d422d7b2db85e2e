use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE_NAME: &str = "sync.toml";
const APP_DIR_NAME: &str = "gallery-sync";

/// Sync engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub pagination: PaginationConfig,
    pub freshness: FreshnessConfig,
    pub retry: RetryConfig,
    pub stats: StatsConfig,
    pub filtered: FilteredConfig,
    pub polling: PollingConfig,
    pub storage: StorageConfig,
}

/// Page sizes for remote range queries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    /// Rows per page (also the probe window)
    pub page_size: usize,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self { page_size: 50 }
    }
}

/// Staleness windows for cached snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FreshnessConfig {
    pub collection_staleness_secs: u64,
    /// Filtered subsets are queried opportunistically, so they age out sooner
    pub filtered_staleness_secs: u64,
    pub stats_staleness_secs: u64,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            collection_staleness_secs: 30 * 60,
            filtered_staleness_secs: 10 * 60,
            stats_staleness_secs: 30 * 60,
        }
    }
}

impl FreshnessConfig {
    pub fn collection_window(&self) -> Duration {
        Duration::from_secs(self.collection_staleness_secs)
    }

    pub fn filtered_window(&self) -> Duration {
        Duration::from_secs(self.filtered_staleness_secs)
    }

    pub fn stats_window(&self) -> Duration {
        Duration::from_secs(self.stats_staleness_secs)
    }
}

/// Backoff for fetch-by-id / fetch-by-url
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles each time
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
        }
    }
}

/// Divergence rule between local and remote counts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub divergence_min_diff: u64,
    pub divergence_ratio: f64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            divergence_min_diff: 10,
            divergence_ratio: 2.0,
        }
    }
}

/// Filtered subset cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilteredConfig {
    /// Maximum filtered views kept in memory per owner
    pub max_views: usize,
}

impl Default for FilteredConfig {
    fn default() -> Self {
        Self { max_views: 32 }
    }
}

/// Periodic incremental refresh
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

/// Persistent cache location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// redb file path (empty = default data dir)
    pub path: Option<String>,
}

impl StorageConfig {
    pub fn resolve_path(&self) -> Result<PathBuf> {
        if let Some(ref custom) = self.path {
            return Ok(PathBuf::from(custom));
        }
        let data_dir = dirs::data_dir()
            .context("Failed to get data directory")?
            .join(APP_DIR_NAME);
        fs::create_dir_all(&data_dir)
            .context("Failed to create data directory")?;
        Ok(data_dir.join("cache.redb"))
    }
}

impl SyncConfig {
    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join(APP_DIR_NAME);

        fs::create_dir_all(&config_dir)
            .context("Failed to create config directory")?;

        Ok(config_dir.join(CONFIG_FILE_NAME))
    }

    /// Load configuration from the default location, or create it
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = SyncConfig::default();
            config.save_to(&path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .context("Failed to read config file")?;

        let config: SyncConfig = toml::from_str(&contents)
            .context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.pagination.page_size == 0 {
            anyhow::bail!("pagination.page_size must be at least 1");
        }
        if self.stats.divergence_ratio < 1.0 {
            anyhow::bail!("stats.divergence_ratio must be >= 1.0");
        }
        if self.filtered.max_views == 0 {
            anyhow::bail!("filtered.max_views must be at least 1");
        }
        Ok(())
    }

    /// Generate example config content for documentation
    pub fn example_config() -> String {
        let config = SyncConfig::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}
