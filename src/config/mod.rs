use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub fetcher: FetcherConfig,
    pub cache: CacheConfig,
    pub limits: LimitsConfig,
}

/// Fetcher configuration: client-identity pool, timeouts and inter-request
/// delays per endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FetcherConfig {
    #[serde(default = "default_user_agents")]
    pub user_agents: Vec<String>,

    #[serde(default = "default_snapshot_timeout_secs")]
    pub snapshot_timeout_secs: u64,

    #[serde(default = "default_kline_timeout_secs")]
    pub kline_timeout_secs: u64,

    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,

    #[serde(default = "default_snapshot_delay_ms")]
    pub snapshot_delay_ms: u64,

    #[serde(default = "default_kline_delay_ms")]
    pub kline_delay_ms: u64,

    #[serde(default = "default_statement_delay_ms")]
    pub statement_delay_ms: u64,
}

/// On-disk cache and output paths
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_price_path")]
    pub price_path: PathBuf,

    #[serde(default = "default_financial_path")]
    pub financial_path: PathBuf,

    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
}

/// Per-run backfill budgets. Securities beyond the budget are deferred to
/// the next run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    #[serde(default = "default_price_backfill")]
    pub price_backfill: usize,

    #[serde(default = "default_financial_backfill")]
    pub financial_backfill: usize,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_user_agents() -> Vec<String> {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/120.0.0.0 Safari/537.36".to_string(),
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 Safari/605.1.15"
            .to_string(),
    ]
}
fn default_snapshot_timeout_secs() -> u64 {
    10
}
fn default_kline_timeout_secs() -> u64 {
    5
}
fn default_statement_timeout_secs() -> u64 {
    8
}
fn default_snapshot_delay_ms() -> u64 {
    50
}
fn default_kline_delay_ms() -> u64 {
    20
}
fn default_statement_delay_ms() -> u64 {
    1000
}
fn default_price_path() -> PathBuf {
    PathBuf::from("data/temp_price_history.csv")
}
fn default_financial_path() -> PathBuf {
    PathBuf::from("data/temp_data_financial.csv")
}
fn default_output_path() -> PathBuf {
    PathBuf::from("data/data.json")
}
fn default_price_backfill() -> usize {
    2000
}
fn default_financial_backfill() -> usize {
    200
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("ASHARE").separator("__"))
            .build()?;

        let app_cfg: AppConfig = cfg.try_deserialize().unwrap_or_else(|_| AppConfig::default());
        Ok(app_cfg)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            fetcher: FetcherConfig {
                user_agents: default_user_agents(),
                snapshot_timeout_secs: default_snapshot_timeout_secs(),
                kline_timeout_secs: default_kline_timeout_secs(),
                statement_timeout_secs: default_statement_timeout_secs(),
                snapshot_delay_ms: default_snapshot_delay_ms(),
                kline_delay_ms: default_kline_delay_ms(),
                statement_delay_ms: default_statement_delay_ms(),
            },
            cache: CacheConfig {
                price_path: default_price_path(),
                financial_path: default_financial_path(),
                output_path: default_output_path(),
            },
            limits: LimitsConfig {
                price_backfill: default_price_backfill(),
                financial_backfill: default_financial_backfill(),
            },
        }
    }
}
