// Core modules
pub mod config;
pub mod db;
pub mod error;
pub mod market;
pub mod models;
pub mod paper;
pub mod trading;

// Re-export commonly used types
pub use crate::config::Settings;
pub use db::{PersistenceSink, SqliteOrderStore};
pub use error::Error;
pub use market::{CandleSynchronizer, MarketDataHub, MarketDataProvider, SubscriptionHandle};
pub use models::*;
pub use paper::{PaperConfig, PaperExchange};
pub use trading::{
    EngineConfig, Order, OrderExecutionEngine, OrderRequest, OrderSnapshot, OrderStage,
    OrderUpdate, Strategy, StrategyContext, TradingClient,
};

// Error handling
pub type Result<T> = std::result::Result<T, Error>;
