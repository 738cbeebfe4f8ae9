use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use tradecore::paper::synthetic::bucket_start;
use tradecore::trading::ProbeStrategy;
use tradecore::*;

const STEP: i64 = 60_000;

/// History ending with the still-open bar; the stream is driven by the test
struct ScriptedMarket {
    history: Vec<Candle>,
    stream_tx: Mutex<Option<mpsc::Sender<CandleStreamUpdate>>>,
}

impl ScriptedMarket {
    fn around_now(len: usize) -> Arc<Self> {
        let open = bucket_start(Utc::now().timestamp_millis(), Interval::M1);
        let history = (0..len as i64)
            .rev()
            .map(|i| bar(open - i * STEP))
            .collect();

        Arc::new(Self {
            history,
            stream_tx: Mutex::new(None),
        })
    }

    fn open_bar(&self) -> Candle {
        *self.history.last().unwrap()
    }

    async fn push(&self, candle: Candle, confirmed: bool) {
        let tx = self.stream_tx.lock().unwrap().clone().expect("stream not opened");
        tx.send(CandleStreamUpdate {
            candle,
            confirmed,
            interval: Interval::M1,
        })
        .await
        .unwrap();
    }
}

#[async_trait]
impl MarketDataProvider for ScriptedMarket {
    async fn open_stream(
        &self,
        _token: CancellationToken,
        _symbol: &str,
        _interval: Interval,
    ) -> anyhow::Result<mpsc::Receiver<CandleStreamUpdate>> {
        let (tx, rx) = mpsc::channel(64);
        *self.stream_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn fetch_candles(
        &self,
        _symbol: &str,
        _interval: Interval,
        limit: usize,
    ) -> anyhow::Result<Vec<Candle>> {
        let start = self.history.len().saturating_sub(limit);
        Ok(self.history[start..].to_vec())
    }
}

fn bar(time: i64) -> Candle {
    Candle {
        time,
        open: 100.0,
        high: 101.0,
        low: 99.0,
        close: 100.5,
        volume: 10.0,
        turnover: 1005.0,
    }
}

async fn recv_confirmed(rx: &mut mpsc::Receiver<CandleStreamUpdate>) -> CandleStreamUpdate {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let update = rx.recv().await.expect("subscriber channel closed");
            if update.confirmed {
                return update;
            }
        }
    })
    .await
    .expect("no confirmed update")
}

// ============================================================================
// Synchronizer against a scripted stream
// ============================================================================

#[tokio::test]
async fn test_stream_extends_seeded_history() {
    let market = ScriptedMarket::around_now(50);
    let token = CancellationToken::new();
    let sync = CandleSynchronizer::new("BTCUSDT", Interval::M1, 100, market.clone(), token.clone());
    assert_ok!(sync.start_sync().await);

    // Everything but the open bar is seeded
    assert_eq!(sync.candles(None).len(), 49);

    let (tx, mut rx) = mpsc::channel(16);
    let _handle = sync.subscribe(tx);

    let open = market.open_bar();
    market.push(Candle { close: 102.0, ..open }, false).await;
    market.push(Candle { close: 103.0, ..open }, true).await;
    // Redelivery of the same bar is ignored
    market.push(Candle { close: 103.0, ..open }, true).await;

    let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(!first.confirmed);
    assert_eq!(first.candle.close, 102.0);

    let confirmed = recv_confirmed(&mut rx).await;
    assert_eq!(confirmed.candle.time, open.time);

    sync.flush().await;
    let candles = sync.candles(None);
    assert_eq!(candles.len(), 50);
    assert_eq!(candles.last().unwrap().close, 103.0);
    assert_eq!(sync.last_confirmed().unwrap().time, open.time);
    for pair in candles.windows(2) {
        assert!(pair[0].is_followed_by(&pair[1], Interval::M1));
    }

    token.cancel();
}

#[tokio::test]
async fn test_empty_history_fails_to_start() {
    let market = ScriptedMarket::around_now(0);
    let sync = CandleSynchronizer::new(
        "BTCUSDT",
        Interval::M1,
        100,
        market,
        CancellationToken::new(),
    );

    let err = assert_err!(sync.start_sync().await);
    assert!(matches!(err, Error::EmptyHistory { .. }));
    assert!(!sync.is_running());
}

#[tokio::test]
async fn test_hub_shares_one_synchronizer_per_key() {
    let market = ScriptedMarket::around_now(20);
    let hub = MarketDataHub::new(market.clone(), 100, CancellationToken::new());

    let (tx_a, _rx_a) = mpsc::channel(4);
    let (tx_b, _rx_b) = mpsc::channel(4);
    let _a = hub.subscribe("BTCUSDT", Interval::M1, tx_a).await.unwrap();
    let _b = hub.subscribe("BTCUSDT", Interval::M1, tx_b).await.unwrap();

    assert_eq!(hub.len().await, 1);
    let sync = hub.synchronizer("BTCUSDT", Interval::M1).await.unwrap();
    assert_eq!(sync.subscriber_count(), 2);
    assert_eq!(hub.candles("BTCUSDT", Interval::M1, Some(5)).await.unwrap().len(), 5);

    hub.clear().await;
    assert!(hub.is_empty().await);
}

#[tokio::test]
async fn test_shutdown_closes_subscribers() {
    let market = ScriptedMarket::around_now(10);
    let hub = MarketDataHub::new(market, 100, CancellationToken::new());

    let (tx, mut rx) = mpsc::channel(4);
    let _handle = hub.subscribe("BTCUSDT", Interval::M1, tx).await.unwrap();
    hub.clear().await;

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        while rx.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "subscriber channel was not closed");
}

// ============================================================================
// Paper exchange
// ============================================================================

#[tokio::test]
async fn test_paper_exchange_seeds_synchronizer() {
    let paper = Arc::new(PaperExchange::new(PaperConfig {
        tick_ms: 20,
        ..Default::default()
    }));
    let token = CancellationToken::new();
    let sync = CandleSynchronizer::new("ETHUSDT", Interval::M1, 200, paper.clone(), token.clone());
    sync.start_sync().await.unwrap();

    let candles = sync.candles(None);
    assert_eq!(candles.len(), 199);
    for pair in candles.windows(2) {
        assert!(pair[0].is_followed_by(&pair[1], Interval::M1));
    }
    assert_eq!(sync.count_missing(Utc::now().timestamp_millis()), 0);

    let (tx, mut rx) = mpsc::channel(16);
    let _handle = sync.subscribe(tx);
    let update = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.interval, Interval::M1);
    assert!(paper.last_price("ETHUSDT").is_some());

    token.cancel();
}

// ============================================================================
// Strategy → engine → exchange → store
// ============================================================================

#[tokio::test]
async fn test_probe_order_flows_to_store() {
    let market = ScriptedMarket::around_now(30);
    let paper = Arc::new(PaperExchange::new(PaperConfig::default()));
    let store = Arc::new(SqliteOrderStore::open("sqlite::memory:").await.unwrap());
    let token = CancellationToken::new();

    let hub = Arc::new(MarketDataHub::new(market.clone(), 100, token.child_token()));
    let config = EngineConfig {
        settle_delay: Duration::from_millis(20),
        ..Default::default()
    };
    let engine = OrderExecutionEngine::new(
        paper.clone(),
        store.clone(),
        hub.clone(),
        config,
        token.clone(),
    );
    engine.start().unwrap();

    let probe = ProbeStrategy::new("BTCUSDT", Interval::M1, 0.5);
    engine.add_strategies(vec![Box::new(probe) as Box<dyn Strategy>]).await;
    assert_eq!(hub.len().await, 1);

    market.push(market.open_bar(), true).await;

    let stored = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let requests = store.order_requests_since(Duration::from_secs(60)).await.unwrap();
            if let Some(request) = requests.into_iter().find(|r| r.order.is_closed) {
                return request;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("probe order was not persisted as closed");

    assert_eq!(stored.tag, "probe-BTCUSDT-M1");
    assert_eq!(stored.order.qty, 0.5);
    assert_eq!(stored.order.exec_qty, 0.5);
    assert!(stored.order.fee > 0.0);

    token.cancel();
}
