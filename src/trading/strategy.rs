use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::order::{Order, OrderRequest, OrderUpdate};
use crate::market::MarketDataHub;
use crate::models::{CandleStreamUpdate, Interval};

/// Everything a strategy gets from the engine
#[derive(Clone)]
pub struct StrategyContext {
    /// Cancelled when the engine shuts down
    pub token: CancellationToken,
    pub market: Arc<MarketDataHub>,
    /// Engine intake; sending waits while the intake is full
    pub orders: mpsc::Sender<OrderRequest>,
}

impl StrategyContext {
    pub fn new(
        token: CancellationToken,
        market: Arc<MarketDataHub>,
        orders: mpsc::Sender<OrderRequest>,
    ) -> Self {
        Self {
            token,
            market,
            orders,
        }
    }
}

/// Decision logic plugged into the execution engine
///
/// `start` performs setup and spawns the strategy's own tasks; an error
/// means the strategy did not start.
#[async_trait]
pub trait Strategy: Send {
    /// Tag attached to every order request this strategy sends
    fn tag(&self) -> &str;

    async fn start(self: Box<Self>, ctx: StrategyContext) -> anyhow::Result<()>;
}

/// Sends an alternating buy/sell market order every `every` confirmed candles
///
/// Exercises the full pipeline against a paper exchange.
pub struct ProbeStrategy {
    tag: String,
    symbol: String,
    interval: Interval,
    qty: f64,
    every: usize,
    close_timeout: Duration,
}

impl ProbeStrategy {
    pub fn new(symbol: impl Into<String>, interval: Interval, qty: f64) -> Self {
        let symbol = symbol.into();
        Self {
            tag: format!("probe-{}-{}", symbol, interval),
            symbol,
            interval,
            qty,
            every: 1,
            close_timeout: Duration::from_secs(10),
        }
    }

    /// Trade on every `every`-th confirmed candle (at least 1)
    pub fn with_every(mut self, every: usize) -> Self {
        self.every = every.max(1);
        self
    }

    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    async fn run(
        self,
        ctx: StrategyContext,
        mut updates: mpsc::Receiver<CandleStreamUpdate>,
    ) {
        let (reply_tx, mut replies) = mpsc::channel::<OrderUpdate>(16);
        let mut confirmed = 0usize;
        let mut side = 1.0;

        loop {
            tokio::select! {
                _ = ctx.token.cancelled() => break,
                update = updates.recv() => {
                    let Some(update) = update else { break };
                    if !update.confirmed {
                        continue;
                    }

                    confirmed += 1;
                    if confirmed % self.every != 0 {
                        continue;
                    }

                    let order = Arc::new(Order::new(&self.symbol, side * self.qty, None));
                    let request = OrderRequest::new(&self.tag, order)
                        .with_close_timeout(self.close_timeout)
                        .with_reply(reply_tx.clone());

                    tracing::info!(
                        tag = %self.tag,
                        link_id = %request.link_id,
                        close = update.candle.close,
                        qty = side * self.qty,
                        "Probe order"
                    );

                    tokio::select! {
                        _ = ctx.token.cancelled() => break,
                        sent = ctx.orders.send(request) => if sent.is_err() {
                            break;
                        }
                    }
                    side = -side;
                }
                Some(reply) = replies.recv() => {
                    tracing::info!(
                        tag = %self.tag,
                        link_id = %reply.link_id,
                        order_id = %reply.order.id,
                        closed = reply.order.is_closed,
                        exec_qty = reply.order.exec_qty,
                        avg_price = reply.order.avg_price,
                        "Probe order update"
                    );
                }
            }
        }

        tracing::info!(tag = %self.tag, "Probe strategy stopped");
    }
}

#[async_trait]
impl Strategy for ProbeStrategy {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn start(self: Box<Self>, ctx: StrategyContext) -> anyhow::Result<()> {
        // Subscription handle must stay alive for the lifetime of the loop
        let (tx, rx) = mpsc::channel(32);
        let handle = ctx.market.subscribe(&self.symbol, self.interval, tx).await?;

        tokio::spawn(async move {
            let _handle = handle;
            (*self).run(ctx, rx).await;
        });

        Ok(())
    }
}
