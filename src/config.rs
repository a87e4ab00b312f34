use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{BotError, Result};

/// Top-level bot configuration, loaded from a JSON file.
///
/// Every field has a default so a partial (or missing) config file still
/// produces a runnable bot.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BotConfig {
    #[serde(default)]
    pub rsi: RsiConfig,

    #[serde(default)]
    pub auto_recheck: AutoRecheckConfig,

    #[serde(default)]
    pub bulk: BulkConfig,

    #[serde(default)]
    pub guild_sync: GuildSyncConfig,
}

/// RSI directory fetch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsiConfig {
    /// Base URL of the directory site
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Organization the bot verifies membership against (normalized on use)
    #[serde(default = "default_target_org")]
    pub target_org: String,

    /// How long a successful snapshot stays cached
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,

    /// Maximum concurrent outbound fetches across the whole process
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Minimum spacing between successive outbound fetches
    #[serde(default = "default_min_interval_seconds")]
    pub min_interval_seconds: f64,
}

impl Default for RsiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            target_org: default_target_org(),
            cache_ttl_seconds: default_cache_ttl_seconds(),
            max_concurrent_requests: default_max_concurrent_requests(),
            min_interval_seconds: default_min_interval_seconds(),
        }
    }
}

/// Periodic background re-verification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoRecheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub batch: RecheckBatchConfig,

    #[serde(default)]
    pub backoff: RecheckBackoffConfig,

    /// Normal interval between successful rechecks of the same user
    #[serde(default = "default_recheck_interval_minutes")]
    pub recheck_interval_minutes: u64,
}

impl Default for AutoRecheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            batch: RecheckBatchConfig::default(),
            backoff: RecheckBackoffConfig::default(),
            recheck_interval_minutes: default_recheck_interval_minutes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecheckBatchConfig {
    #[serde(default = "default_run_every_minutes")]
    pub run_every_minutes: u64,

    #[serde(default = "default_max_users_per_run")]
    pub max_users_per_run: usize,
}

impl Default for RecheckBatchConfig {
    fn default() -> Self {
        Self {
            run_every_minutes: default_run_every_minutes(),
            max_users_per_run: default_max_users_per_run(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecheckBackoffConfig {
    #[serde(default = "default_backoff_base_minutes")]
    pub base_minutes: u64,

    #[serde(default = "default_backoff_max_minutes")]
    pub max_minutes: u64,
}

impl Default for RecheckBackoffConfig {
    fn default() -> Self {
        Self {
            base_minutes: default_backoff_base_minutes(),
            max_minutes: default_backoff_max_minutes(),
        }
    }
}

/// Bulk verification queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkConfig {
    /// Targets per batch within a job
    #[serde(default = "default_bulk_batch_size")]
    pub batch_size: usize,

    /// Inter-batch sleep is drawn uniformly from [min, max] seconds
    #[serde(default = "default_inter_batch_delay_min")]
    pub inter_batch_delay_min_seconds: u64,

    #[serde(default = "default_inter_batch_delay_max")]
    pub inter_batch_delay_max_seconds: u64,

    /// Emit a progress notification every N batches
    #[serde(default = "default_progress_every_batches")]
    pub progress_every_batches: usize,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            batch_size: default_bulk_batch_size(),
            inter_batch_delay_min_seconds: default_inter_batch_delay_min(),
            inter_batch_delay_max_seconds: default_inter_batch_delay_max(),
            progress_every_batches: default_progress_every_batches(),
        }
    }
}

/// Role/nickname application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuildSyncConfig {
    #[serde(default = "default_sync_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_sync_max_concurrency")]
    pub max_concurrency: usize,

    /// Role assigned to verified main-org members
    #[serde(default = "default_main_role")]
    pub main_role: String,

    /// Role assigned to verified affiliates
    #[serde(default = "default_affiliate_role")]
    pub affiliate_role: String,
}

impl Default for GuildSyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_sync_batch_size(),
            max_concurrency: default_sync_max_concurrency(),
            main_role: default_main_role(),
            affiliate_role: default_affiliate_role(),
        }
    }
}

impl BotConfig {
    /// Load from a JSON file; a missing file yields the defaults.
    pub async fn load(path: &str) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let config: BotConfig =
                    serde_json::from_str(&content).map_err(|e| BotError::ConfigParse {
                        path: path.to_string(),
                        source: e,
                    })?;
                info!("Loaded config from {}", path);
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {} not found, using defaults", path);
                Ok(Self::default())
            }
            Err(e) => Err(BotError::ConfigLoad {
                path: path.to_string(),
                source: e,
            }),
        }
    }
}

fn default_base_url() -> String {
    "https://robertsspaceindustries.com".to_string()
}

fn default_target_org() -> String {
    "TEST Squadron - Best Squardon!".to_string()
}

fn default_cache_ttl_seconds() -> u64 {
    600
}

fn default_max_concurrent_requests() -> usize {
    3
}

fn default_min_interval_seconds() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_run_every_minutes() -> u64 {
    60
}

fn default_max_users_per_run() -> usize {
    25
}

fn default_backoff_base_minutes() -> u64 {
    180
}

fn default_backoff_max_minutes() -> u64 {
    1440
}

fn default_recheck_interval_minutes() -> u64 {
    10080
}

fn default_bulk_batch_size() -> usize {
    50
}

fn default_inter_batch_delay_min() -> u64 {
    5
}

fn default_inter_batch_delay_max() -> u64 {
    15
}

fn default_progress_every_batches() -> usize {
    1
}

fn default_sync_batch_size() -> usize {
    10
}

fn default_sync_max_concurrency() -> usize {
    4
}

fn default_main_role() -> String {
    "Verified Member".to_string()
}

fn default_affiliate_role() -> String {
    "Affiliate".to_string()
}
