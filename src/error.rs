use thiserror::Error;

/// Errors surfaced by the trading core
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    #[error("provider returned no candles for {symbol} {interval}")]
    EmptyHistory { symbol: String, interval: String },

    #[error("market data provider error: {0}")]
    Provider(#[source] anyhow::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("{0} already started")]
    AlreadyStarted(&'static str),
}
