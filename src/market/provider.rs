use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::{Candle, CandleStreamUpdate, Interval};

/// Source of candle history and live candle updates
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Open a live update stream for `symbol`/`interval`
    ///
    /// The stream ends (channel closes) when `token` is cancelled or the
    /// upstream connection is lost. Confirmed updates must be delivered for
    /// every fully closed bar the provider observes.
    async fn open_stream(
        &self,
        token: CancellationToken,
        symbol: &str,
        interval: Interval,
    ) -> anyhow::Result<mpsc::Receiver<CandleStreamUpdate>>;

    /// Fetch the newest `limit` candles, ordered oldest to newest
    ///
    /// The newest element may be the still-open bar.
    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> anyhow::Result<Vec<Candle>>;
}
