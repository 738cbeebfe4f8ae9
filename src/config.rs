use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::models::Interval;
use crate::paper::PaperConfig;
use crate::trading::EngineConfig;
use crate::Result;

/// Config file looked up in the working directory (`tradecore.toml`)
pub const DEFAULT_CONFIG_FILE: &str = "tradecore";

/// Environment variable prefix, e.g. `TRADECORE_ENGINE__SETTLE_DELAY_MS`
pub const ENV_PREFIX: &str = "TRADECORE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub channel_buffer_size: usize,
    pub place_order_interval_ms: u64,
    pub place_order_timeout_ms: u64,
    pub settle_delay_ms: u64,
    pub cancel_retry_interval_ms: u64,
    pub cancel_timeout_secs: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            channel_buffer_size: 64,
            place_order_interval_ms: 200,
            place_order_timeout_ms: 1000,
            settle_delay_ms: 200,
            cancel_retry_interval_ms: 5000,
            cancel_timeout_secs: 3600,
            shutdown_grace_ms: 3000,
        }
    }
}

impl From<&EngineSettings> for EngineConfig {
    fn from(s: &EngineSettings) -> Self {
        Self {
            channel_buffer_size: s.channel_buffer_size,
            place_order_interval: Duration::from_millis(s.place_order_interval_ms),
            place_order_timeout: Duration::from_millis(s.place_order_timeout_ms),
            settle_delay: Duration::from_millis(s.settle_delay_ms),
            cancel_retry_interval: Duration::from_millis(s.cancel_retry_interval_ms),
            cancel_timeout: Duration::from_secs(s.cancel_timeout_secs),
            shutdown_grace: Duration::from_millis(s.shutdown_grace_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketSettings {
    /// Candles kept per synchronizer
    pub buffer_size: usize,
    pub symbols: Vec<String>,
    /// Interval name (`M1`, `H4`, ...) or minutes
    pub interval: String,
}

impl Default for MarketSettings {
    fn default() -> Self {
        Self {
            buffer_size: 2000,
            symbols: vec!["BTCUSDT".to_string()],
            interval: Interval::M1.to_string(),
        }
    }
}

impl MarketSettings {
    pub fn interval(&self) -> Result<Interval> {
        Interval::from_str(&self.interval)
    }
}

/// Application settings
///
/// Layered as: built-in defaults, then `tradecore.toml` (optional), then
/// `TRADECORE_*` environment variables with `__` between nested keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineSettings,
    pub market: MarketSettings,
    pub database_url: String,
    pub paper: PaperConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            engine: EngineSettings::default(),
            market: MarketSettings::default(),
            database_url: "sqlite://orders.db".to_string(),
            paper: PaperConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings, reading `path` instead of `tradecore.toml` when given
    ///
    /// An explicit path must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let env = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("market.symbols")
            .try_parsing(true);

        Self::from_builder(Self::defaults()?.add_source(file).add_source(env))
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        Ok(Config::builder().add_source(Config::try_from(&Settings::default())?))
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let settings: Settings = builder.build()?.try_deserialize()?;

        // Fail at startup rather than on first subscribe
        settings.market.interval()?;

        tracing::debug!(
            database_url = %settings.database_url,
            symbols = ?settings.market.symbols,
            interval = %settings.market.interval,
            "Settings loaded"
        );

        Ok(settings)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::from(&self.engine)
    }
}
