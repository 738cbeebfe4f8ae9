// Market data synchronization module
pub mod candle_buffer;
pub mod hub;
pub mod provider;
pub mod sync;

pub use candle_buffer::BoundedCircularBuffer;
pub use hub::MarketDataHub;
pub use provider::MarketDataProvider;
pub use sync::{CandleSynchronizer, SubscriptionHandle};
