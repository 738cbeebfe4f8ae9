// Paper trading module
pub mod synthetic;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::market::MarketDataProvider;
use crate::models::{Candle, CandleStreamUpdate, Interval};
use crate::trading::{OrderSnapshot, TradingClient};
use synthetic::{bucket_start, RandomWalk};

/// Taker fee charged on every fill (0.055%)
pub const PAPER_FEE_RATE: f64 = 0.00055;

/// Bars kept per symbol/interval
const HISTORY_LEN: usize = 5000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub seed: u64,
    /// Open price of the oldest generated bar
    pub base_price: f64,
    /// Chance that a fillable order fills on a given check
    pub fill_probability: f64,
    /// Stream tick period in milliseconds
    pub tick_ms: u64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            base_price: 100.0,
            fill_probability: 1.0,
            tick_ms: 1000,
        }
    }
}

struct PaperState {
    walk: RandomWalk,
    series: HashMap<(String, Interval), Vec<Candle>>,
    last_price: HashMap<String, f64>,
    orders: HashMap<String, OrderSnapshot>,
    next_order_id: u64,
}

impl PaperState {
    /// Bring the series up to `now_ms` and return the bars that closed
    fn roll(
        &mut self,
        base_price: f64,
        symbol: &str,
        interval: Interval,
        now_ms: i64,
    ) -> Vec<Candle> {
        let open_time = bucket_start(now_ms, interval);
        let step = interval.as_millis();
        let walk = &mut self.walk;

        let series = self
            .series
            .entry((symbol.to_string(), interval))
            .or_insert_with(|| walk.history(interval, open_time, HISTORY_LEN, base_price));

        let mut closed = Vec::new();
        while let Some(last) = series.last().copied() {
            if last.time + step > open_time {
                break;
            }
            closed.push(last);

            let time = last.time + step;
            let next = if time < open_time {
                walk.bar(time, last.close)
            } else {
                RandomWalk::open_bar(time, last.close)
            };
            series.push(next);
        }

        if series.len() > HISTORY_LEN {
            let excess = series.len() - HISTORY_LEN;
            series.drain(..excess);
        }

        closed
    }

    /// Advance the open bar one tick and return it
    fn tick(&mut self, symbol: &str, interval: Interval) -> Option<Candle> {
        let series = self.series.get_mut(&(symbol.to_string(), interval))?;
        let open = series.last_mut()?;
        self.walk.tick(open);

        let candle = *open;
        self.last_price.insert(symbol.to_string(), candle.close);
        Some(candle)
    }

    /// Fill `order` if it is marketable at the current price
    fn try_fill(&mut self, order: &mut OrderSnapshot, fill_probability: f64, base_price: f64) {
        if order.is_closed {
            return;
        }

        let market = self.last_price.get(&order.symbol).copied().unwrap_or(base_price);
        let fill_price = match order.price {
            None => market,
            Some(limit) if order.qty > 0.0 && market <= limit => limit,
            Some(limit) if order.qty < 0.0 && market >= limit => limit,
            Some(_) => return,
        };

        if self.walk.sample() >= fill_probability {
            return;
        }

        let exec_qty = order.qty;
        let exec_value = exec_qty.abs() * fill_price;
        order.avg_price = fill_price;
        order.exec_qty = exec_qty;
        order.exec_value = exec_value;
        order.fee = exec_value * PAPER_FEE_RATE;
        order.is_closed = true;
        order.updated_at = Utc::now().timestamp_millis();
    }
}

/// In-process simulated exchange
///
/// Serves seeded random-walk candles as a [`MarketDataProvider`] and fills
/// orders against the latest simulated price as a [`TradingClient`].
#[derive(Clone)]
pub struct PaperExchange {
    config: PaperConfig,
    state: Arc<Mutex<PaperState>>,
}

impl PaperExchange {
    pub fn new(config: PaperConfig) -> Self {
        let state = PaperState {
            walk: RandomWalk::new(config.seed),
            series: HashMap::new(),
            last_price: HashMap::new(),
            orders: HashMap::new(),
            next_order_id: 1,
        };

        Self {
            config,
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Latest simulated price for `symbol`, if any series was generated
    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.lock().last_price.get(symbol).copied()
    }

    /// Updates produced by one stream tick: closed bars, then the open bar
    fn step(&self, symbol: &str, interval: Interval, now_ms: i64) -> Vec<CandleStreamUpdate> {
        let mut state = self.lock();

        let mut updates: Vec<CandleStreamUpdate> = state
            .roll(self.config.base_price, symbol, interval, now_ms)
            .into_iter()
            .map(|candle| CandleStreamUpdate {
                candle,
                confirmed: true,
                interval,
            })
            .collect();

        if let Some(candle) = state.tick(symbol, interval) {
            updates.push(CandleStreamUpdate {
                candle,
                confirmed: false,
                interval,
            });
        }

        updates
    }
}

#[async_trait]
impl MarketDataProvider for PaperExchange {
    async fn open_stream(
        &self,
        token: CancellationToken,
        symbol: &str,
        interval: Interval,
    ) -> anyhow::Result<mpsc::Receiver<CandleStreamUpdate>> {
        let (tx, rx) = mpsc::channel(64);
        let exchange = self.clone();
        let symbol = symbol.to_string();
        let period = Duration::from_millis(self.config.tick_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let now_ms = Utc::now().timestamp_millis();
                for update in exchange.step(&symbol, interval, now_ms) {
                    if tx.send(update).await.is_err() {
                        return;
                    }
                }
            }

            tracing::debug!(symbol = %symbol, interval = %interval, "Paper stream closed");
        });

        Ok(rx)
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> anyhow::Result<Vec<Candle>> {
        let now_ms = Utc::now().timestamp_millis();
        let mut state = self.lock();

        state.roll(self.config.base_price, symbol, interval, now_ms);
        state.tick(symbol, interval);

        let series = state
            .series
            .get(&(symbol.to_string(), interval))
            .ok_or_else(|| anyhow::anyhow!("no series for {} {}", symbol, interval))?;

        let start = series.len().saturating_sub(limit);
        Ok(series[start..].to_vec())
    }
}

#[async_trait]
impl TradingClient for PaperExchange {
    async fn place_order(
        &self,
        symbol: &str,
        qty: f64,
        price: Option<f64>,
    ) -> anyhow::Result<String> {
        if qty == 0.0 || !qty.is_finite() {
            anyhow::bail!("invalid order quantity: {}", qty);
        }
        if let Some(price) = price {
            if price <= 0.0 || !price.is_finite() {
                anyhow::bail!("invalid limit price: {}", price);
            }
        }

        let now = Utc::now().timestamp_millis();
        let mut state = self.lock();

        let id = state.next_order_id.to_string();
        state.next_order_id += 1;

        let mut order = OrderSnapshot {
            id: id.clone(),
            symbol: symbol.to_string(),
            qty,
            price,
            created_at: now,
            updated_at: now,
            ..Default::default()
        };
        state.try_fill(&mut order, self.config.fill_probability, self.config.base_price);

        tracing::debug!(
            order_id = %id,
            symbol = %symbol,
            qty,
            price = ?price,
            filled = order.is_closed,
            "Paper order placed"
        );

        state.orders.insert(id.clone(), order);
        Ok(id)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> anyhow::Result<String> {
        let mut state = self.lock();
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| anyhow::anyhow!("order {} not found", order_id))?;

        if order.is_closed {
            anyhow::bail!("order {} already closed", order_id);
        }

        order.is_closed = true;
        order.updated_at = Utc::now().timestamp_millis();

        Ok(order_id.to_string())
    }

    async fn get_order(&self, order_id: &str) -> anyhow::Result<Vec<u8>> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let mut order = state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("order {} not found", order_id))?;

        state.try_fill(&mut order, self.config.fill_probability, self.config.base_price);
        state.orders.insert(order_id.to_string(), order.clone());

        Ok(serde_json::to_vec(&order)?)
    }
}
