// Pipeline configuration
// Loaded from FXP_* environment variables (optionally via a .env file)

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.exchangerate-api.com/v4/latest/USD";
pub const DEFAULT_TRACKED: &[&str] = &["EUR", "GBP", "JPY", "CAD", "AUD"];
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";

/// Thresholds for the quality gate. Literal values, no derived business logic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    /// Maximum tolerated share of null target cells (0.0 - 1.0)
    pub max_null_ratio: f64,

    /// Minimum number of non-null currency columns
    pub min_currency_count: usize,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        QualityThresholds {
            max_null_ratio: 0.01,
            min_currency_count: 10,
        }
    }
}

/// Where committed datasets are pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BlobStoreConfig {
    Local { path: PathBuf },
    Http {
        url: String,
        #[serde(skip_serializing)]
        token: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub api_url: String,
    pub base_currency: String,
    pub data_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub models_dir: PathBuf,
    pub db_path: PathBuf,
    pub blob_store: BlobStoreConfig,
    pub thresholds: QualityThresholds,
    pub tracked_currencies: Vec<String>,
    pub request_timeout_secs: u64,
    pub tracking_enabled: bool,
    pub training_target: String,
    pub training_lags: usize,
    /// Status server bind address (`host:port`), unused by the CLI
    pub listen_addr: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("./data");
        PipelineConfig {
            api_url: DEFAULT_API_URL.to_string(),
            base_currency: "USD".to_string(),
            reports_dir: PathBuf::from("./reports"),
            models_dir: PathBuf::from("./models"),
            db_path: data_dir.join("pipeline.db"),
            blob_store: BlobStoreConfig::Local {
                path: data_dir.join("blobs"),
            },
            data_dir,
            thresholds: QualityThresholds::default(),
            tracked_currencies: DEFAULT_TRACKED.iter().map(|c| c.to_string()).collect(),
            request_timeout_secs: 30,
            tracking_enabled: true,
            training_target: "EUR".to_string(),
            training_lags: 3,
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = PipelineConfig::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(url) = get("FXP_API_URL") {
            config.api_url = url;
        }
        if let Some(base) = get("FXP_BASE_CURRENCY") {
            config.base_currency = base.to_uppercase();
        }
        if let Some(dir) = get("FXP_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
            // Paths below the data dir follow it unless set explicitly
            config.db_path = config.data_dir.join("pipeline.db");
            config.blob_store = BlobStoreConfig::Local {
                path: config.data_dir.join("blobs"),
            };
        }
        if let Some(dir) = get("FXP_REPORTS_DIR") {
            config.reports_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get("FXP_MODELS_DIR") {
            config.models_dir = PathBuf::from(dir);
        }
        if let Some(path) = get("FXP_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(store) = get("FXP_BLOB_STORE") {
            config.blob_store = if store.starts_with("http://") || store.starts_with("https://") {
                BlobStoreConfig::Http {
                    url: store,
                    token: get("FXP_BLOB_TOKEN"),
                }
            } else {
                BlobStoreConfig::Local {
                    path: PathBuf::from(store),
                }
            };
        }
        if let Some(ratio) = get("FXP_MAX_NULL_RATIO") {
            config.thresholds.max_null_ratio = parse_value("FXP_MAX_NULL_RATIO", &ratio)?;
        }
        if let Some(min) = get("FXP_MIN_CURRENCIES") {
            config.thresholds.min_currency_count = parse_value("FXP_MIN_CURRENCIES", &min)?;
        }
        if let Some(list) = get("FXP_TRACKED_CURRENCIES") {
            config.tracked_currencies = list
                .split(',')
                .map(|c| c.trim().to_uppercase())
                .filter(|c| !c.is_empty())
                .collect();
        }
        if let Some(secs) = get("FXP_REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = parse_value("FXP_REQUEST_TIMEOUT_SECS", &secs)?;
        }
        if let Some(flag) = get("FXP_TRACKING_ENABLED") {
            config.tracking_enabled = parse_bool("FXP_TRACKING_ENABLED", &flag)?;
        }
        if let Some(target) = get("FXP_TRAINING_TARGET") {
            config.training_target = target.to_uppercase();
        }
        if let Some(lags) = get("FXP_TRAINING_LAGS") {
            config.training_lags = parse_value("FXP_TRAINING_LAGS", &lags)?;
        }
        if let Some(addr) = get("FXP_LISTEN_ADDR") {
            config.listen_addr = addr;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let ratio = self.thresholds.max_null_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(PipelineError::Config(format!(
                "max_null_ratio must be within [0, 1], got {}",
                ratio
            )));
        }
        if self.tracked_currencies.is_empty() {
            return Err(PipelineError::Config(
                "tracked_currencies must not be empty".to_string(),
            ));
        }
        if self.training_lags == 0 {
            return Err(PipelineError::Config("training_lags must be >= 1".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(PipelineError::Config(
                "request_timeout_secs must be > 0".to_string(),
            ));
        }
        let port = self
            .listen_addr
            .rsplit_once(':')
            .filter(|(host, _)| !host.is_empty())
            .and_then(|(_, port)| port.parse::<u16>().ok());
        if port.is_none() {
            return Err(PipelineError::Config(format!(
                "listen_addr must be host:port, got {}",
                self.listen_addr
            )));
        }
        if self.base_currency.len() != 3 {
            return Err(PipelineError::Config(format!(
                "base_currency should be a 3-letter code: {}",
                self.base_currency
            )));
        }
        Ok(())
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.data_dir.join("raw")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.data_dir.join("processed")
    }

    /// The engineered dataset, rewritten in full each run.
    pub fn dataset_path(&self) -> PathBuf {
        self.processed_dir().join("exchange_rates.csv")
    }

    pub fn training_stats_path(&self) -> PathBuf {
        self.models_dir.join("training_stats.json")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Create every output directory the pipeline writes to.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.raw_dir(), self.processed_dir(), self.reports_dir.clone()] {
            std::fs::create_dir_all(&dir)?;
        }
        if let Some(parent) = self.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Point every path at a single root directory (used by tests and `--root`).
    pub fn rooted_at(mut self, root: &Path) -> Self {
        self.data_dir = root.join("data");
        self.reports_dir = root.join("reports");
        self.models_dir = root.join("models");
        self.db_path = self.data_dir.join("pipeline.db");
        if let BlobStoreConfig::Local { .. } = self.blob_store {
            self.blob_store = BlobStoreConfig::Local {
                path: self.data_dir.join("blobs"),
            };
        }
        self
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| PipelineError::Config(format!("invalid {}={}: {}", key, raw, e)))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(PipelineError::Config(format!("invalid {}={}: expected a boolean", key, raw))),
    }
}
