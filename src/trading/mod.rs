// Order execution module
pub mod client;
pub mod engine;
pub mod order;
pub mod strategy;

pub use client::TradingClient;
pub use engine::{EngineConfig, OrderExecutionEngine, OrderStage, StageEvent, StageObserver};
pub use order::{Order, OrderRequest, OrderRequestSnapshot, OrderSide, OrderSnapshot, OrderUpdate};
pub use strategy::{ProbeStrategy, Strategy, StrategyContext};
