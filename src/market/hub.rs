use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::provider::MarketDataProvider;
use super::sync::{CandleSynchronizer, SubscriptionHandle};
use crate::models::{Candle, CandleStreamUpdate, Interval};
use crate::Result;

/// Shared market data access for strategies
///
/// Starts one [`CandleSynchronizer`] per symbol/interval on first use and
/// reuses it afterwards.
pub struct MarketDataHub {
    provider: Arc<dyn MarketDataProvider>,
    synchronizers: Mutex<HashMap<(String, Interval), CandleSynchronizer>>,
    buffer_size: usize,
    token: CancellationToken,
}

impl MarketDataHub {
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        buffer_size: usize,
        token: CancellationToken,
    ) -> Self {
        Self {
            provider,
            synchronizers: Mutex::new(HashMap::new()),
            buffer_size,
            token,
        }
    }

    /// Get the running synchronizer for a key, starting it if needed
    pub async fn synchronizer(
        &self,
        symbol: &str,
        interval: Interval,
    ) -> Result<CandleSynchronizer> {
        let mut synchronizers = self.synchronizers.lock().await;

        let key = (symbol.to_string(), interval);
        if let Some(sync) = synchronizers.get(&key) {
            return Ok(sync.clone());
        }

        let sync = CandleSynchronizer::new(
            symbol,
            interval,
            self.buffer_size,
            self.provider.clone(),
            self.token.child_token(),
        );
        sync.start_sync().await?;
        synchronizers.insert(key, sync.clone());

        Ok(sync)
    }

    /// Subscribe a channel to live updates for `symbol`/`interval`
    pub async fn subscribe(
        &self,
        symbol: &str,
        interval: Interval,
        tx: mpsc::Sender<CandleStreamUpdate>,
    ) -> Result<SubscriptionHandle> {
        let sync = self.synchronizer(symbol, interval).await?;
        Ok(sync.subscribe(tx))
    }

    /// Newest `limit` synchronized candles (all when `None`)
    pub async fn candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: Option<usize>,
    ) -> Result<Vec<Candle>> {
        let sync = self.synchronizer(symbol, interval).await?;
        Ok(sync.candles(limit))
    }

    /// Number of active synchronizers
    pub async fn len(&self) -> usize {
        self.synchronizers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop and forget every synchronizer
    pub async fn clear(&self) {
        let mut synchronizers = self.synchronizers.lock().await;
        for (_, sync) in synchronizers.drain() {
            sync.shutdown();
        }
    }
}
