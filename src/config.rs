use eyre::{Context, Result};
use hubcapture::backfill::BackfillConfig;
use hubcapture::daemon::TickConfig;
use hubcapture::engine::EngineConfig;
use hubcapture::retry::RetryConfig;
use hubcapture::routing::RoutingConfig;
use hubcapture::scheduler::{ConcurrencyTier, TierName};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const HOUR_SECS: u64 = 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub store: StoreConfig,
    pub tier: TierConfig,
    pub routing: RoutingConfig,
    pub backfill: BackfillConfig,
    pub retry: RetrySection,
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file; defaults under the local data dir
    pub path: Option<PathBuf>,
}

/// Tier selection with optional per-field overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    pub name: TierName,
    pub max_concurrent: Option<usize>,
    pub burst_capacity: Option<usize>,
    pub cooldown_ms: Option<u64>,
    pub queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub base_delay_secs: u64,
    pub backoff_multiplier: f64,
    pub jitter: f64,
    pub lookback_hours: u64,
    pub interval_secs: u64,
    pub stats_window_days: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 60,
            backoff_multiplier: 2.0,
            jitter: 0.3,
            lookback_hours: 24,
            interval_secs: 300,
            stats_window_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub tick_interval_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self { tick_interval_ms: 1000 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            store: StoreConfig::default(),
            tier: TierConfig::default(),
            routing: RoutingConfig::default(),
            backfill: BackfillConfig::default(),
            retry: RetrySection::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

impl TierConfig {
    /// Built-in tier limits with the configured overrides applied.
    pub fn resolve(&self) -> Result<ConcurrencyTier> {
        let mut tier = ConcurrencyTier::for_name(self.name);
        if let Some(max) = self.max_concurrent {
            tier.max_concurrent = max;
        }
        if let Some(burst) = self.burst_capacity {
            tier.burst_capacity = burst;
        }
        if let Some(ms) = self.cooldown_ms {
            tier.cooldown = Duration::from_millis(ms);
        }
        if let Some(capacity) = self.queue_capacity {
            tier.queue_capacity = capacity;
        }
        tier.validate().context("Invalid tier configuration")?;
        Ok(tier)
    }
}

impl RetrySection {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay: Duration::from_secs(self.base_delay_secs),
            backoff_multiplier: self.backoff_multiplier,
            jitter: self.jitter,
            lookback: Duration::from_secs(self.lookback_hours * HOUR_SECS),
            interval: Duration::from_secs(self.interval_secs),
            stats_window: Duration::from_secs(self.stats_window_days * 24 * HOUR_SECS),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let project_name = env!("CARGO_PKG_NAME");

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Check every section converts into settings the components accept.
    pub fn validate(&self) -> Result<()> {
        self.tier.resolve()?;
        self.retry_config().validate().context("Invalid retry configuration")?;
        self.tick_config().validate().context("Invalid daemon configuration")?;
        Ok(())
    }

    /// Database location: the configured path, else `<data_local_dir>/hubcapture/hubcapture.db`.
    pub fn database_path(&self) -> PathBuf {
        if let Some(path) = &self.store.path {
            return path.clone();
        }
        let project_name = env!("CARGO_PKG_NAME");
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(project_name)
            .join(format!("{}.db", project_name))
    }

    pub fn engine_config(&self) -> Result<EngineConfig> {
        Ok(EngineConfig {
            routing: self.routing.clone(),
            tier: self.tier.resolve()?,
            backfill: self.backfill.clone(),
        })
    }

    pub fn retry_config(&self) -> RetryConfig {
        self.retry.to_retry_config()
    }

    pub fn tick_config(&self) -> TickConfig {
        TickConfig::new(Duration::from_millis(self.daemon.tick_interval_ms))
            .with_retry_interval(Duration::from_secs(self.retry.interval_secs))
    }
}
