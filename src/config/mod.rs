//! Configuration loading
//!
//! Defaults first, then `SHADOWBUS__*` environment overrides (double
//! underscore separates nesting levels, e.g. `SHADOWBUS__BUS__STUCK_AFTER_SECS`).
//! A `.env` file is honored when present.

use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    /// Root directory for all logs and snapshots
    pub data_dir: String,
    pub bus: BusConfig,
    pub shadow: ShadowSettings,
    pub feed: FeedConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    /// Seconds in a non-terminal state before a signal counts as stuck
    pub stuck_after_secs: i64,
    /// Maximum age before auto-expiry sweeps a signal
    pub max_signal_age_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShadowSettings {
    /// Virtual size per shadow position
    pub position_size_usd: f64,
    /// Closed-trades JSONL of the live portfolio, for comparison reports
    pub live_trades_log: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Exchange REST base URL
    pub binance_rest_url: String,
}

impl CoreConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .set_default("data_dir", "data")?
            .set_default("bus.stuck_after_secs", 3600)?
            .set_default("bus.max_signal_age_secs", 3600)?
            .set_default("shadow.position_size_usd", 1000.0)?
            .set_default("shadow.live_trades_log", "data/live_trades.jsonl")?
            .set_default("feed.binance_rest_url", "https://api.binance.com/api/v3")?
            .add_source(Environment::with_prefix("SHADOWBUS").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    pub fn bus_log_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("signal_events.jsonl")
    }

    pub fn decisions_log_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("decisions.jsonl")
    }

    pub fn shadow_config(&self) -> crate::shadow::ShadowConfig {
        crate::shadow::ShadowConfig {
            position_size_usd: self.shadow.position_size_usd,
            results_log: PathBuf::from(&self.data_dir).join("shadow_results.jsonl"),
            snapshot_file: PathBuf::from(&self.data_dir).join("shadow_state.json"),
            live_trades_log: PathBuf::from(&self.shadow.live_trades_log),
        }
    }
}
