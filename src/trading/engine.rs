use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::client::TradingClient;
use super::order::{OrderRequest, OrderRequestSnapshot, OrderSnapshot, OrderUpdate};
use super::strategy::{Strategy, StrategyContext};
use crate::db::PersistenceSink;
use crate::market::MarketDataHub;
use crate::{Error, Result};

/// Lifecycle position of a single order request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderStage {
    Queued,
    Placing,
    Registered,
    Confirming,
    Closed,
    CancelPending,
    Cancelled,
    /// Placement deadline expired; nothing was replied or persisted
    Abandoned,
}

impl OrderStage {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStage::Closed | OrderStage::Cancelled | OrderStage::Abandoned
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageEvent {
    pub link_id: String,
    pub tag: String,
    pub stage: OrderStage,
}

/// Optional listener notified on every stage transition
pub type StageObserver = mpsc::UnboundedSender<StageEvent>;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of the intake channel; producers wait when it is full
    pub channel_buffer_size: usize,
    pub place_order_interval: Duration,
    /// Deadline for placement retries, measured after the request delay
    pub place_order_timeout: Duration,
    /// Pause between registration and the first status poll
    pub settle_delay: Duration,
    pub cancel_retry_interval: Duration,
    pub cancel_timeout: Duration,
    /// Time between stopping strategies and closing the intake
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_buffer_size: 64,
            place_order_interval: Duration::from_millis(200),
            place_order_timeout: Duration::from_secs(1),
            settle_delay: Duration::from_millis(200),
            cancel_retry_interval: Duration::from_secs(5),
            cancel_timeout: Duration::from_secs(3600),
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

/// Per-request worker state shared by every spawned order task
struct Worker {
    client: Arc<dyn TradingClient>,
    sink: Arc<dyn PersistenceSink>,
    config: EngineConfig,
    token: CancellationToken,
    observer: Option<StageObserver>,
}

/// Takes order requests from strategies and drives each one through
/// placement, confirmation and, if it never closes, cancellation
///
/// Every request runs on its own task. Requests are not ordered or
/// serialized against each other, even for the same symbol.
pub struct OrderExecutionEngine {
    client: Arc<dyn TradingClient>,
    sink: Arc<dyn PersistenceSink>,
    hub: Arc<MarketDataHub>,
    config: EngineConfig,
    token: CancellationToken,
    strategies_token: CancellationToken,
    observer: Option<StageObserver>,
    tx: mpsc::Sender<OrderRequest>,
    rx: Mutex<Option<mpsc::Receiver<OrderRequest>>>,
}

impl OrderExecutionEngine {
    /// Build an engine bound to `token`; call [`start`](Self::start) to run it
    pub fn new(
        client: Arc<dyn TradingClient>,
        sink: Arc<dyn PersistenceSink>,
        hub: Arc<MarketDataHub>,
        config: EngineConfig,
        token: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_buffer_size.max(1));
        let strategies_token = token.child_token();

        Self {
            client,
            sink,
            hub,
            config,
            token,
            strategies_token,
            observer: None,
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn with_stage_observer(mut self, observer: StageObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Intake sender for submitting order requests
    pub fn sender(&self) -> mpsc::Sender<OrderRequest> {
        self.tx.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Spawn the polling loop
    ///
    /// The returned handle completes once the root token is cancelled, the
    /// grace period has elapsed and every buffered request was dispatched.
    pub fn start(&self) -> Result<JoinHandle<()>> {
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(Error::AlreadyStarted("order execution engine"))?;

        let worker = Arc::new(Worker {
            client: self.client.clone(),
            sink: self.sink.clone(),
            config: self.config.clone(),
            token: self.token.clone(),
            observer: self.observer.clone(),
        });

        tracing::info!("Order execution engine started polling");

        Ok(tokio::spawn(run_polling(
            worker,
            rx,
            self.hub.clone(),
            self.strategies_token.clone(),
        )))
    }

    /// Hand each strategy its context and start it
    ///
    /// A strategy that fails to start is logged and skipped.
    pub async fn add_strategies(&self, strategies: Vec<Box<dyn Strategy>>) {
        for strategy in strategies {
            let tag = strategy.tag().to_string();
            let ctx = StrategyContext::new(
                self.strategies_token.clone(),
                self.hub.clone(),
                self.tx.clone(),
            );

            match strategy.start(ctx).await {
                Ok(()) => tracing::info!(tag = %tag, "Strategy started"),
                Err(e) => tracing::error!(tag = %tag, error = %e, "Failed to start strategy"),
            }
        }
    }
}

async fn run_polling(
    worker: Arc<Worker>,
    mut rx: mpsc::Receiver<OrderRequest>,
    hub: Arc<MarketDataHub>,
    strategies_token: CancellationToken,
) {
    let shutdown = worker.token.clone();

    let grace = async {
        shutdown.cancelled().await;
        tracing::info!("Order execution engine stopping");
        strategies_token.cancel();
        hub.clear().await;
        sleep(worker.config.shutdown_grace).await;
    };
    tokio::pin!(grace);

    let mut closing = false;
    loop {
        tokio::select! {
            _ = &mut grace, if !closing => {
                // Buffered requests are still dispatched; recv yields None once drained
                rx.close();
                closing = true;
            }
            request = rx.recv() => match request {
                Some(request) => {
                    let worker = worker.clone();
                    tokio::spawn(async move { worker.handle_order(request).await });
                }
                None => break,
            }
        }
    }

    tracing::info!("Order execution engine stopped");
}

impl Worker {
    fn report(&self, request: &OrderRequest, stage: OrderStage) {
        tracing::debug!(
            link_id = %request.link_id,
            tag = %request.tag,
            stage = ?stage,
            "Order stage"
        );

        if let Some(observer) = &self.observer {
            let _ = observer.send(StageEvent {
                link_id: request.link_id.clone(),
                tag: request.tag.clone(),
                stage,
            });
        }
    }

    /// Non-blocking reply with the current order state
    fn reply(&self, request: &OrderRequest) {
        let Some(reply) = &request.reply else {
            return;
        };

        let update = OrderUpdate {
            link_id: request.link_id.clone(),
            order: request.order.snapshot(),
        };

        if let Err(e) = reply.try_send(update) {
            tracing::error!(
                link_id = %request.link_id,
                tag = %request.tag,
                error = %e,
                "Failed to send order update"
            );
        }
    }

    async fn handle_order(&self, request: OrderRequest) {
        self.report(&request, OrderStage::Queued);

        let queued = request.snapshot();
        tracing::info!(
            link_id = %queued.link_id,
            tag = %queued.tag,
            symbol = %queued.order.symbol,
            qty = queued.order.qty,
            price = ?queued.order.price,
            "New order request"
        );

        if !request.order.has_id() {
            self.report(&request, OrderStage::Placing);
            match self.place_with_retry(&request).await {
                Some(order_id) => request.order.set_id(order_id),
                None => {
                    tracing::error!(
                        link_id = %request.link_id,
                        tag = %request.tag,
                        stage = ?OrderStage::Abandoned,
                        "Order registration deadline expired"
                    );
                    self.report(&request, OrderStage::Abandoned);
                    return;
                }
            }
        }

        self.report(&request, OrderStage::Registered);
        self.persist_insert(&queued).await;
        self.reply(&request);

        let registered = request.snapshot();
        tracing::info!(
            link_id = %registered.link_id,
            tag = %registered.tag,
            order_id = %registered.order.id,
            "Order registered"
        );
        if let Err(e) = self.sink.update_id(&registered).await {
            tracing::error!(
                link_id = %registered.link_id,
                error = %e,
                "Failed to persist order id"
            );
        }

        self.report(&request, OrderStage::Confirming);
        if self.wait_for_closed(&request).await {
            self.report(&request, OrderStage::Closed);
            self.reply(&request);

            let closed = request.snapshot();
            tracing::info!(
                link_id = %closed.link_id,
                tag = %closed.tag,
                exec_qty = closed.order.exec_qty,
                avg_price = closed.order.avg_price,
                "Order closed"
            );
            if let Err(e) = self.sink.update(&closed).await {
                tracing::error!(
                    link_id = %closed.link_id,
                    error = %e,
                    "Failed to persist closed order"
                );
            }
            return;
        }

        self.report(&request, OrderStage::CancelPending);
        self.reply(&request);
        self.cancel_with_retry(&request).await;
        self.report(&request, OrderStage::Cancelled);
    }

    async fn persist_insert(&self, snapshot: &OrderRequestSnapshot) {
        if let Err(e) = self.sink.insert(snapshot).await {
            tracing::error!(
                link_id = %snapshot.link_id,
                error = %e,
                "Failed to persist order request"
            );
        }
    }

    /// Returns the exchange id, or `None` once the placement deadline passes
    async fn place_with_retry(&self, request: &OrderRequest) -> Option<String> {
        if !request.delay.is_zero() {
            sleep(request.delay).await;
        }

        let deadline = Instant::now() + self.config.place_order_timeout;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let order = request.order.snapshot();

            match self
                .client
                .place_order(&order.symbol, order.qty, order.price)
                .await
            {
                Ok(order_id) => return Some(order_id),
                Err(e) => tracing::warn!(
                    link_id = %request.link_id,
                    attempt,
                    error = %e,
                    "Failed to place order"
                ),
            }

            tokio::select! {
                _ = sleep(self.config.place_order_interval) => {}
                _ = sleep_until(deadline) => return None,
            }
        }
    }

    /// Poll until the exchange reports the order closed
    ///
    /// Cancellation of the engine token counts as not closed.
    async fn wait_for_closed(&self, request: &OrderRequest) -> bool {
        sleep(self.config.settle_delay).await;

        let timeout = request.close_timeout.max(Duration::from_secs(1));
        let period = timeout / 10;
        let deadline = sleep(timeout);
        tokio::pin!(deadline);

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.check_closed(request).await {
                return true;
            }

            tokio::select! {
                _ = self.token.cancelled() => return false,
                _ = ticker.tick() => {}
                _ = &mut deadline => {
                    tracing::error!(
                        link_id = %request.link_id,
                        tag = %request.tag,
                        "Waiting for order to close expired"
                    );
                    return self.check_closed(request).await;
                }
            }
        }
    }

    /// Fetch the exchange snapshot and merge it when the order is closed
    async fn check_closed(&self, request: &OrderRequest) -> bool {
        let order_id = request.order.id();

        let data = match self.client.get_order(&order_id).await {
            Ok(data) => data,
            Err(e) => {
                tracing::debug!(link_id = %request.link_id, error = %e, "Failed to get order");
                return false;
            }
        };

        let update: OrderSnapshot = match serde_json::from_slice(&data) {
            Ok(update) => update,
            Err(e) => {
                tracing::warn!(link_id = %request.link_id, error = %e, "Malformed order snapshot");
                return false;
            }
        };

        if !update.is_closed {
            return false;
        }

        request.order.replace(&update);
        true
    }

    async fn cancel_with_retry(&self, request: &OrderRequest) {
        let (symbol, order_id) = request
            .order
            .with_lock(|o| (o.symbol.clone(), o.id.clone()));

        let deadline = Instant::now() + self.config.cancel_timeout;
        loop {
            match self.client.cancel_order(&symbol, &order_id).await {
                Ok(_) => {
                    tracing::info!(
                        link_id = %request.link_id,
                        tag = %request.tag,
                        order_id = %order_id,
                        "Unclosed order cancelled"
                    );
                    return;
                }
                Err(e) => tracing::warn!(
                    link_id = %request.link_id,
                    order_id = %order_id,
                    error = %e,
                    "Failed to cancel order"
                ),
            }

            tokio::select! {
                _ = sleep(self.config.cancel_retry_interval) => {}
                _ = sleep_until(deadline) => {
                    tracing::error!(
                        link_id = %request.link_id,
                        tag = %request.tag,
                        order_id = %order_id,
                        "Gave up cancelling order"
                    );
                    return;
                }
            }
        }
    }
}
