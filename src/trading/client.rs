use async_trait::async_trait;

/// Exchange order API consumed by the execution engine
#[async_trait]
pub trait TradingClient: Send + Sync {
    /// Place an order; `price` of `None` means a market order
    ///
    /// Returns the exchange order id.
    async fn place_order(
        &self,
        symbol: &str,
        qty: f64,
        price: Option<f64>,
    ) -> anyhow::Result<String>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> anyhow::Result<String>;

    /// Serialized order status, deserializable into
    /// [`OrderSnapshot`](crate::trading::OrderSnapshot)
    async fn get_order(&self, order_id: &str) -> anyhow::Result<Vec<u8>>;
}
