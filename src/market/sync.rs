use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::candle_buffer::BoundedCircularBuffer;
use super::provider::MarketDataProvider;
use crate::error::Error;
use crate::models::{Candle, CandleStreamUpdate, Interval};
use crate::Result;

/// Delay before re-fetching the latest closed bar after the stream attaches
const CATCH_UP_DELAY: Duration = Duration::from_secs(1);

struct Subscriber {
    tx: mpsc::Sender<CandleStreamUpdate>,
    done: CancellationToken,
}

#[derive(Default)]
struct ControlPlane {
    subscribers: HashMap<Uuid, Subscriber>,
    last_confirmed: Option<Candle>,
}

/// Returned by [`CandleSynchronizer::subscribe`]
///
/// Unsubscribes when fired or dropped. The subscriber's channel is closed
/// once the synchronizer notices.
#[derive(Debug)]
#[must_use = "dropping the handle unsubscribes immediately"]
pub struct SubscriptionHandle {
    done: CancellationToken,
}

impl SubscriptionHandle {
    pub fn unsubscribe(&self) {
        self.done.cancel();
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.done.is_cancelled()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.done.cancel();
    }
}

struct SyncInner {
    symbol: String,
    interval: Interval,
    buffer_size: usize,
    provider: Arc<dyn MarketDataProvider>,
    token: CancellationToken,
    started: AtomicBool,

    // Data plane: the buffer locks internally; `cursor` orders admissions
    buffer: BoundedCircularBuffer<Candle>,
    cursor: Mutex<Option<Candle>>,

    // Control plane
    control: Mutex<ControlPlane>,
}

impl SyncInner {
    fn control(&self) -> MutexGuard<'_, ControlPlane> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_admit(&self, candle: Candle) -> bool {
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);

        let admissible = match *cursor {
            Some(last) => last.is_followed_by(&candle, self.interval),
            None => true,
        };
        if !admissible || !self.buffer.async_write(vec![candle]) {
            return false;
        }

        *cursor = Some(candle);
        true
    }

    fn count_missing(&self, now_ms: i64) -> usize {
        let interval = self.interval;
        let max_gap_ms = (interval.as_secs() + 1) * 1000;

        self.buffer.with_lock(|candles| {
            candles
                .iter()
                .skip(1)
                .rev()
                .take_while(|c| now_ms - c.close_time(interval) >= max_gap_ms)
                .count()
        })
    }

    fn broadcast(self: &Arc<Self>, control: &ControlPlane, update: CandleStreamUpdate) {
        let mut unsubscribed = Vec::new();

        for (id, sub) in &control.subscribers {
            if sub.done.is_cancelled() {
                unsubscribed.push(*id);
                continue;
            }
            match sub.tx.try_send(update) {
                Ok(()) | Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Closed(_)) => unsubscribed.push(*id),
            }
        }

        // Removal takes the registry lock, so it runs after this pass
        if !unsubscribed.is_empty() {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.remove_subscribers(&unsubscribed);
            });
        }
    }

    fn remove_subscribers(&self, ids: &[Uuid]) {
        let mut control = self.control();
        for id in ids {
            if control.subscribers.remove(id).is_some() {
                tracing::debug!(
                    symbol = %self.symbol,
                    interval = %self.interval,
                    subscriber = %id,
                    "Removed subscriber"
                );
            }
        }
    }

    fn handle_update(self: &Arc<Self>, update: CandleStreamUpdate) {
        if update.interval != self.interval {
            return;
        }

        self.broadcast(&self.control(), update);

        if update.confirmed {
            self.try_admit(update.candle);
            self.control().last_confirmed = Some(update.candle);
        }
    }

    async fn process_stream(self: Arc<Self>, mut stream: mpsc::Receiver<CandleStreamUpdate>) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                update = stream.recv() => match update {
                    Some(update) => self.handle_update(update),
                    None => {
                        tracing::warn!(
                            symbol = %self.symbol,
                            interval = %self.interval,
                            "Candle stream closed, relying on backfill"
                        );
                        return;
                    }
                },
            }
        }
    }

    async fn check_missing(self: Arc<Self>) {
        let period = Duration::from_millis((self.interval.as_millis() / 10) as u64);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = ticker.tick() => self.backfill().await,
            }
        }
    }

    async fn backfill(self: &Arc<Self>) {
        let missing = self.count_missing(Utc::now().timestamp_millis());
        if missing == 0 {
            return;
        }

        tracing::debug!(
            symbol = %self.symbol,
            interval = %self.interval,
            missing,
            "Detected missing candles"
        );

        // One extra candle: the newest is the still-open bar and gets trimmed
        let candles = match self
            .provider
            .fetch_candles(&self.symbol, self.interval, missing + 1)
            .await
        {
            Ok(candles) => candles,
            Err(e) => {
                tracing::warn!(
                    symbol = %self.symbol,
                    interval = %self.interval,
                    error = %e,
                    "Failed to fetch missing candles"
                );
                return;
            }
        };
        let Some((_, closed)) = candles.split_last() else {
            return;
        };

        let mut admitted = 0;
        for candle in closed {
            if !self.try_admit(*candle) {
                continue;
            }
            admitted += 1;

            let mut control = self.control();
            let extends = control
                .last_confirmed
                .is_some_and(|last| last.is_followed_by(candle, self.interval));
            if extends {
                let update = CandleStreamUpdate {
                    candle: *candle,
                    confirmed: true,
                    interval: self.interval,
                };
                self.broadcast(&control, update);
                control.last_confirmed = Some(*candle);
            }
        }

        if admitted > 0 {
            tracing::info!(
                symbol = %self.symbol,
                interval = %self.interval,
                admitted,
                "Backfilled missing candles"
            );
        }
    }

    async fn catch_up(self: Arc<Self>) {
        tokio::select! {
            _ = self.token.cancelled() => return,
            _ = sleep(CATCH_UP_DELAY) => {}
        }

        match self.provider.fetch_candles(&self.symbol, self.interval, 2).await {
            Ok(candles) if candles.len() >= 2 => {
                self.try_admit(candles[0]);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(
                    symbol = %self.symbol,
                    interval = %self.interval,
                    error = %e,
                    "Catch-up fetch failed"
                );
            }
        }
    }

    fn teardown(&self) {
        self.buffer.close();

        let mut control = self.control();
        let dropped = control.subscribers.len();
        control.subscribers.clear();

        tracing::info!(
            symbol = %self.symbol,
            interval = %self.interval,
            subscribers = dropped,
            "Candle sync stopped"
        );
    }
}

/// Keeps a gap-free window of candles for one symbol/interval and fans out
/// live updates to subscribers
///
/// Two background loops run after [`start_sync`](Self::start_sync): a stream
/// processor that broadcasts every update and buffers confirmed bars, and a
/// checker that backfills candles the stream missed. Cancelling the token
/// stops both, closes the buffer and closes every subscriber channel.
///
/// Delivery to subscribers is at-most-once: a full subscriber channel drops
/// the update rather than stalling the synchronizer.
#[derive(Clone)]
pub struct CandleSynchronizer {
    inner: Arc<SyncInner>,
}

impl CandleSynchronizer {
    /// Create an idle synchronizer
    ///
    /// Must be called from within a Tokio runtime. A `buffer_size` below 2 is
    /// raised to 2.
    pub fn new(
        symbol: impl Into<String>,
        interval: Interval,
        buffer_size: usize,
        provider: Arc<dyn MarketDataProvider>,
        token: CancellationToken,
    ) -> Self {
        let buffer_size = buffer_size.max(2);

        Self {
            inner: Arc::new(SyncInner {
                symbol: symbol.into(),
                interval,
                buffer_size,
                provider,
                token,
                started: AtomicBool::new(false),
                buffer: BoundedCircularBuffer::new(buffer_size),
                cursor: Mutex::new(None),
                control: Mutex::new(ControlPlane::default()),
            }),
        }
    }

    /// Attach the live stream, seed history and launch the background loops
    ///
    /// The newest historical candle is not buffered: it is usually the
    /// still-open bar and would race with the first confirmed stream update.
    pub async fn start_sync(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        match self.seed().await {
            Ok(stream) => {
                let supervisor = Arc::clone(inner);
                tokio::spawn(async move {
                    let mut loops = JoinSet::new();
                    loops.spawn(Arc::clone(&supervisor).process_stream(stream));
                    loops.spawn(Arc::clone(&supervisor).check_missing());

                    while let Some(result) = loops.join_next().await {
                        if let Err(e) = result {
                            tracing::error!(
                                symbol = %supervisor.symbol,
                                interval = %supervisor.interval,
                                error = %e,
                                "Candle sync loop failed"
                            );
                        }
                    }
                    supervisor.teardown();
                });

                tokio::spawn(Arc::clone(inner).catch_up());

                tracing::info!(
                    symbol = %inner.symbol,
                    interval = %inner.interval,
                    buffered = inner.buffer.len(),
                    "Candle sync started"
                );
                Ok(())
            }
            Err(e) => {
                inner.started.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    async fn seed(&self) -> Result<mpsc::Receiver<CandleStreamUpdate>> {
        let inner = &self.inner;

        let stream = inner
            .provider
            .open_stream(inner.token.clone(), &inner.symbol, inner.interval)
            .await
            .map_err(Error::Provider)?;

        let history = inner
            .provider
            .fetch_candles(&inner.symbol, inner.interval, inner.buffer_size)
            .await
            .map_err(Error::Provider)?;

        let Some((_, seed)) = history.split_last() else {
            return Err(Error::EmptyHistory {
                symbol: inner.symbol.clone(),
                interval: inner.interval.to_string(),
            });
        };

        let mut cursor = inner.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        inner.buffer.write(seed.iter().copied());
        *cursor = seed.last().copied();
        drop(cursor);

        inner.control().last_confirmed = seed.last().copied();

        Ok(stream)
    }

    /// Register a subscriber channel
    pub fn subscribe(&self, tx: mpsc::Sender<CandleStreamUpdate>) -> SubscriptionHandle {
        let done = CancellationToken::new();
        let id = Uuid::new_v4();

        // Teardown closes the buffer before clearing the registry; checking
        // under the registry lock keeps late inserts from surviving it
        let mut control = self.inner.control();
        if self.inner.buffer.is_closed() {
            // Dropping `tx` here closes the channel right away
            done.cancel();
            return SubscriptionHandle { done };
        }
        control.subscribers.insert(
            id,
            Subscriber {
                tx,
                done: done.clone(),
            },
        );
        drop(control);

        tracing::debug!(
            symbol = %self.inner.symbol,
            interval = %self.inner.interval,
            subscriber = %id,
            "New subscriber"
        );

        SubscriptionHandle { done }
    }

    /// Buffer `candle` if it is exactly the next bar, within jitter
    ///
    /// Anything else (duplicate, stale, or past a gap) is rejected silently.
    pub fn try_admit(&self, candle: Candle) -> bool {
        self.inner.try_admit(candle)
    }

    /// Number of buffered candles whose close is more than one interval old
    ///
    /// Scans newest to oldest and stops at the first fresh candle.
    pub fn count_missing(&self, now_ms: i64) -> usize {
        self.inner.count_missing(now_ms)
    }

    /// Newest `limit` buffered candles, oldest first (all when `None`)
    pub fn candles(&self, limit: Option<usize>) -> Vec<Candle> {
        self.inner.buffer.read(limit)
    }

    /// Wait until every admitted candle has reached the buffer
    pub async fn flush(&self) {
        self.inner.buffer.flush().await;
    }

    pub fn last_confirmed(&self) -> Option<Candle> {
        self.inner.control().last_confirmed
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.control().subscribers.len()
    }

    pub fn symbol(&self) -> &str {
        &self.inner.symbol
    }

    pub fn interval(&self) -> Interval {
        self.inner.interval
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
            && !self.inner.token.is_cancelled()
            && !self.inner.buffer.is_closed()
    }

    /// Stop the background loops
    ///
    /// Teardown runs once both loops have exited. A synchronizer that was
    /// never started is torn down immediately.
    pub fn shutdown(&self) {
        self.inner.token.cancel();
        if !self.inner.started.load(Ordering::Acquire) {
            self.inner.teardown();
        }
    }

    #[cfg(test)]
    async fn backfill(&self) {
        self.inner.backfill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::time::timeout;

    const I: Interval = Interval::M1;

    struct MockProvider {
        candles: Mutex<Vec<Candle>>,
        stream_tx: Mutex<Option<mpsc::Sender<CandleStreamUpdate>>>,
    }

    impl MockProvider {
        fn new(candles: Vec<Candle>) -> Arc<Self> {
            Arc::new(Self {
                candles: Mutex::new(candles),
                stream_tx: Mutex::new(None),
            })
        }

        fn set_candles(&self, candles: Vec<Candle>) {
            *self.candles.lock().unwrap() = candles;
        }

        fn stream(&self) -> mpsc::Sender<CandleStreamUpdate> {
            self.stream_tx.lock().unwrap().clone().expect("stream not opened")
        }
    }

    #[async_trait]
    impl MarketDataProvider for MockProvider {
        async fn open_stream(
            &self,
            _token: CancellationToken,
            _symbol: &str,
            _interval: Interval,
        ) -> anyhow::Result<mpsc::Receiver<CandleStreamUpdate>> {
            let (tx, rx) = mpsc::channel(256);
            *self.stream_tx.lock().unwrap() = Some(tx);
            Ok(rx)
        }

        async fn fetch_candles(
            &self,
            _symbol: &str,
            _interval: Interval,
            limit: usize,
        ) -> anyhow::Result<Vec<Candle>> {
            let candles = self.candles.lock().unwrap();
            let start = candles.len().saturating_sub(limit);
            Ok(candles[start..].to_vec())
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

    /// Bars from `first` to `last` inclusive, counted in intervals from `open`
    fn bars(open: i64, first: i64, last: i64) -> Vec<Candle> {
        (first..=last).map(|k| bar(open + k * I.as_millis())).collect()
    }

    fn current_open() -> i64 {
        let now = Utc::now().timestamp_millis();
        now - now.rem_euclid(I.as_millis())
    }

    fn update(candle: Candle, confirmed: bool) -> CandleStreamUpdate {
        CandleStreamUpdate {
            candle,
            confirmed,
            interval: I,
        }
    }

    async fn started(provider: Arc<MockProvider>, size: usize) -> CandleSynchronizer {
        let sync = CandleSynchronizer::new("BTCUSDT", I, size, provider, CancellationToken::new());
        sync.start_sync().await.unwrap();
        sync
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within 1s");
    }

    #[tokio::test]
    async fn test_start_sync_seeds_all_but_last() {
        let open = current_open();
        let provider = MockProvider::new(bars(open, -9, 0));
        let sync = started(provider, 100).await;

        let candles = sync.candles(None);
        assert_eq!(candles.len(), 9);
        assert_eq!(candles.last().unwrap().time, open - I.as_millis());
        assert_eq!(sync.last_confirmed().unwrap().time, open - I.as_millis());
        assert!(sync.is_running());

        sync.shutdown();
    }

    #[tokio::test]
    async fn test_start_sync_empty_history_errors() {
        let provider = MockProvider::new(Vec::new());
        let sync = CandleSynchronizer::new("BTCUSDT", I, 10, provider, CancellationToken::new());

        let result = sync.start_sync().await;
        assert!(matches!(result, Err(Error::EmptyHistory { .. })));
        assert!(!sync.is_running());
    }

    #[tokio::test]
    async fn test_try_admit_accepts_only_next_bar() {
        let open = current_open();
        let provider = MockProvider::new(bars(open, -9, 0));
        let sync = started(provider, 100).await;

        let step = I.as_millis();
        assert!(!sync.try_admit(bar(open - step)), "duplicate");
        assert!(!sync.try_admit(bar(open - 2 * step)), "stale");
        assert!(!sync.try_admit(bar(open + step)), "gap");
        assert!(sync.try_admit(bar(open + 5)), "jittered next bar");
        assert!(!sync.try_admit(bar(open)), "too close to admitted bar");

        sync.flush().await;
        let candles = sync.candles(None);
        assert_eq!(candles.len(), 10);
        assert_eq!(candles.last().unwrap().time, open + 5);

        sync.shutdown();
    }

    #[tokio::test]
    async fn test_stream_updates_broadcast_and_buffer() {
        let open = current_open();
        let provider = MockProvider::new(bars(open, -9, 0));
        let sync = started(provider.clone(), 100).await;

        let (tx, mut rx) = mpsc::channel(16);
        let _handle = sync.subscribe(tx);

        let stream = provider.stream();
        let other_interval = CandleStreamUpdate {
            candle: bar(open),
            confirmed: true,
            interval: Interval::M5,
        };
        stream.send(other_interval).await.unwrap();
        stream.send(update(bar(open), false)).await.unwrap();
        stream.send(update(bar(open), true)).await.unwrap();

        let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(!first.confirmed);
        assert_eq!(first.interval, I);
        let second = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(second.confirmed);

        eventually(|| sync.last_confirmed().map(|c| c.time) == Some(open)).await;
        sync.flush().await;
        let candles = sync.candles(None);
        assert_eq!(candles.len(), 10);
        assert_eq!(candles.last().unwrap().time, open);

        sync.shutdown();
    }

    #[tokio::test]
    async fn test_duplicate_confirmed_delivery_buffers_once() {
        let open = current_open();
        let provider = MockProvider::new(bars(open, -9, 0));
        let sync = started(provider.clone(), 100).await;

        let (tx, mut rx) = mpsc::channel(16);
        let _handle = sync.subscribe(tx);

        let stream = provider.stream();
        stream.send(update(bar(open), true)).await.unwrap();
        stream.send(update(bar(open), true)).await.unwrap();

        for _ in 0..2 {
            timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        }
        sleep(Duration::from_millis(50)).await;
        sync.flush().await;

        let candles = sync.candles(None);
        assert_eq!(candles.iter().filter(|c| c.time == open).count(), 1);
        for pair in candles.windows(2) {
            assert!(pair[0].is_followed_by(&pair[1], I));
        }

        sync.shutdown();
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_channel() {
        let open = current_open();
        let provider = MockProvider::new(bars(open, -9, 0));
        let sync = started(provider.clone(), 100).await;

        let (tx, mut rx) = mpsc::channel(16);
        let handle = sync.subscribe(tx);
        assert_eq!(sync.subscriber_count(), 1);

        handle.unsubscribe();
        provider.stream().send(update(bar(open), false)).await.unwrap();

        let received = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(received.is_none(), "no sends after unsubscribe");
        eventually(|| sync.subscriber_count() == 0).await;

        sync.shutdown();
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_others() {
        let open = current_open();
        let provider = MockProvider::new(bars(open, -9, 0));
        let sync = started(provider.clone(), 100).await;

        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        slow_tx.try_send(update(bar(0), false)).unwrap();
        let _slow = sync.subscribe(slow_tx);

        let (fast_tx, mut fast_rx) = mpsc::channel(200);
        let _fast = sync.subscribe(fast_tx);

        let stream = provider.stream();
        for _ in 0..100 {
            stream.send(update(bar(open), false)).await.unwrap();
        }

        timeout(Duration::from_secs(2), async {
            for _ in 0..100 {
                fast_rx.recv().await.unwrap();
            }
        })
        .await
        .expect("fast subscriber starved");

        // Only the pre-filled message is there; the rest were dropped
        assert_eq!(slow_rx.recv().await.unwrap().candle.time, 0);
        assert!(slow_rx.try_recv().is_err());

        sync.shutdown();
    }

    #[tokio::test]
    async fn test_count_missing_detects_stale_tail() {
        let open = current_open();
        let now = Utc::now().timestamp_millis();

        let fresh = started(MockProvider::new(bars(open, -9, 0)), 100).await;
        assert_eq!(fresh.count_missing(now), 0);

        let stale = started(MockProvider::new(bars(open, -20, -5)), 100).await;
        assert_eq!(stale.candles(None).len(), 15);
        assert_eq!(stale.count_missing(now), 14);

        // Evaluated as of the last buffered bar's close, nothing is missing
        let as_of = open - 5 * I.as_millis();
        assert_eq!(stale.count_missing(as_of), 0);

        fresh.shutdown();
        stale.shutdown();
    }

    #[tokio::test]
    async fn test_backfill_fills_gap_and_broadcasts() {
        let open = current_open();
        let provider = MockProvider::new(bars(open, -20, -5));
        let sync = started(provider.clone(), 100).await;

        let (tx, mut rx) = mpsc::channel(16);
        let _handle = sync.subscribe(tx);

        provider.set_candles(bars(open, -20, 0));
        sync.backfill().await;
        sync.flush().await;

        let candles = sync.candles(None);
        assert_eq!(candles.len(), 20);
        assert_eq!(candles.first().unwrap().time, open - 20 * I.as_millis());
        assert_eq!(candles.last().unwrap().time, open - I.as_millis());
        for pair in candles.windows(2) {
            assert!(pair[0].is_followed_by(&pair[1], I));
        }

        for k in (1..=5).rev() {
            let update = rx.try_recv().unwrap();
            assert!(update.confirmed);
            assert_eq!(update.candle.time, open - k * I.as_millis());
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(sync.last_confirmed().unwrap().time, open - I.as_millis());

        sync.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_catch_up_admits_bar_closed_after_seeding() {
        let open = current_open();
        let provider = MockProvider::new(bars(open, -9, 0));
        let sync = started(provider.clone(), 100).await;
        assert_eq!(sync.candles(None).len(), 9);

        // The open bar closes and a new one opens; no stream update follows
        provider.set_candles(bars(open, -9, 1));

        sleep(CATCH_UP_DELAY - Duration::from_millis(100)).await;
        sync.flush().await;
        assert_eq!(sync.candles(None).len(), 9);

        sleep(Duration::from_millis(200)).await;
        sync.flush().await;
        let candles = sync.candles(None);
        assert_eq!(candles.len(), 10);
        assert_eq!(candles.last().unwrap().time, open);

        sync.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_catch_up_ignores_short_response() {
        let open = current_open();
        let provider = MockProvider::new(bars(open, -9, 0));
        let sync = started(provider.clone(), 100).await;

        // A lone candle could be the open bar, so nothing is admitted
        provider.set_candles(vec![bar(open)]);

        sleep(CATCH_UP_DELAY + Duration::from_millis(100)).await;
        sync.flush().await;
        let candles = sync.candles(None);
        assert_eq!(candles.len(), 9);
        assert_eq!(candles.last().unwrap().time, open - I.as_millis());

        sync.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_checker_backfills_on_tick() {
        let open = current_open();
        let provider = MockProvider::new(bars(open, -20, -5));
        let sync = started(provider.clone(), 100).await;

        let (tx, mut rx) = mpsc::channel(16);
        let _handle = sync.subscribe(tx);
        provider.set_candles(bars(open, -20, 0));

        // Nothing runs before the first tick at a tenth of the interval
        let tick = Duration::from_millis((I.as_millis() / 10) as u64);
        sleep(tick - Duration::from_millis(100)).await;
        sync.flush().await;
        assert_eq!(sync.candles(None).len(), 15);
        assert!(rx.try_recv().is_err());

        sleep(Duration::from_millis(200)).await;
        sync.flush().await;
        let candles = sync.candles(None);
        assert_eq!(candles.len(), 20);
        assert_eq!(candles.last().unwrap().time, open - I.as_millis());
        for pair in candles.windows(2) {
            assert!(pair[0].is_followed_by(&pair[1], I));
        }

        for k in (1..=5).rev() {
            let update = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
            assert!(update.confirmed);
            assert_eq!(update.candle.time, open - k * I.as_millis());
        }
        assert_eq!(sync.last_confirmed().unwrap().time, open - I.as_millis());
        assert_eq!(sync.count_missing(Utc::now().timestamp_millis()), 0);

        sync.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_subscribe_racing_shutdown_always_closes() {
        for _ in 0..50 {
            let open = current_open();
            let sync = started(MockProvider::new(bars(open, -9, 0)), 100).await;

            let racer = sync.clone();
            let subscribers = tokio::spawn(async move {
                let mut held = Vec::new();
                for _ in 0..20 {
                    let (tx, rx) = mpsc::channel::<CandleStreamUpdate>(1);
                    held.push((racer.subscribe(tx), rx));
                    tokio::task::yield_now().await;
                }
                held
            });
            tokio::task::yield_now().await;
            sync.shutdown();

            let held = subscribers.await.unwrap();
            for (_handle, mut rx) in held {
                let closed = timeout(Duration::from_secs(2), rx.recv()).await;
                assert!(matches!(closed, Ok(None)), "subscriber outlived teardown");
            }
        }
    }

    #[tokio::test]
    async fn test_shutdown_tears_down() {
        let open = current_open();
        let provider = MockProvider::new(bars(open, -9, 0));
        let sync = started(provider, 100).await;

        let (tx, mut rx) = mpsc::channel(16);
        let _handle = sync.subscribe(tx);

        sync.shutdown();
        sync.shutdown();

        let received = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(received.is_none());
        assert!(!sync.is_running());
        assert!(sync.candles(None).is_empty());
        assert!(!sync.try_admit(bar(open)));

        // Late subscribers get a closed channel
        let (late_tx, mut late_rx) = mpsc::channel(1);
        let late = sync.subscribe(late_tx);
        assert!(late.is_unsubscribed());
        assert!(late_rx.recv().await.is_none());
    }
}
