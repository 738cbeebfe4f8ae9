use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tokio::sync::{mpsc, oneshot};

enum Command<T> {
    Write(Vec<T>),
    Flush(oneshot::Sender<()>),
}

struct Inner<T> {
    data: RwLock<Vec<T>>,
    capacity: usize,
    overflow: usize,
    closed: AtomicBool,
    tx: Mutex<Option<mpsc::UnboundedSender<Command<T>>>>,
}

impl<T> Inner<T> {
    fn read_guard(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, Vec<T>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, items: impl IntoIterator<Item = T>) {
        let mut data = self.write_guard();
        // Checked under the lock so a racing close() cannot be undone
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        data.extend(items);

        let len = data.len();
        if len > self.capacity + self.overflow {
            data.drain(..len - self.capacity);
        }
    }
}

/// Thread-safe rolling window with a serialized asynchronous write path
///
/// Holds at most `capacity + overflow` elements. A write that crosses that
/// bound compacts the window back to the newest `capacity` elements, so the
/// cost of shifting is paid once per `overflow` appends instead of on every
/// append.
///
/// Asynchronous writes go through a single worker task, which applies them in
/// the order they were enqueued.
pub struct BoundedCircularBuffer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for BoundedCircularBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> BoundedCircularBuffer<T> {
    /// Create a buffer and spawn its write worker
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Arguments
    /// * `capacity` - Number of elements kept after compaction
    pub fn new(capacity: usize) -> Self {
        let overflow = (capacity / 10).max(10);
        let (tx, rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            data: RwLock::new(Vec::with_capacity(capacity + overflow)),
            capacity,
            overflow,
            closed: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
        });

        tokio::spawn(run_worker(Arc::downgrade(&inner), rx));

        Self { inner }
    }

    /// Append synchronously, compacting if the overflow margin is exceeded
    ///
    /// Ignored once the buffer is closed.
    pub fn write(&self, items: impl IntoIterator<Item = T>) {
        self.inner.write(items);
    }

    /// Enqueue items for the write worker
    ///
    /// Returns `false` (and drops the items) if the buffer is closed.
    pub fn async_write(&self, items: Vec<T>) -> bool {
        let tx = self.inner.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) => tx.send(Command::Write(items)).is_ok(),
            None => false,
        }
    }

    /// Wait until every async write enqueued before this call has been applied
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let tx = self.inner.tx.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(tx) = tx.as_ref() else {
                return;
            };
            if tx.send(Command::Flush(ack_tx)).is_err() {
                return;
            }
        }
        let _ = ack_rx.await;
    }

    /// Copy of the newest `limit` elements, oldest first (all when `None`)
    pub fn read(&self, limit: Option<usize>) -> Vec<T> {
        let data = self.inner.read_guard();
        let len = data.len();
        let limit = limit.unwrap_or(len).min(len);
        data[len - limit..].to_vec()
    }

    /// Element at `index`; negative indices count from the end
    ///
    /// Out-of-range indices are clamped to the first or last element. Returns
    /// `None` only when the buffer is empty.
    pub fn read_at(&self, index: isize) -> Option<T> {
        let data = self.inner.read_guard();
        let len = data.len() as isize;
        if len == 0 {
            return None;
        }
        let idx = if index < 0 { len + index } else { index };
        let idx = idx.clamp(0, len - 1) as usize;
        Some(data[idx].clone())
    }

    /// Run `f` against the backing storage while holding the write lock
    ///
    /// For multi-step scans that must not interleave with writes.
    pub fn with_lock<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        let data = self.inner.write_guard();
        f(&data)
    }

    pub fn len(&self) -> usize {
        self.inner.read_guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn overflow(&self) -> usize {
        self.inner.overflow
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop the write worker and release storage
    ///
    /// Safe to call more than once; only the first call has an effect.
    pub fn close(&self) {
        let mut data = self.inner.write_guard();
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        *data = Vec::new();
    }
}

async fn run_worker<T>(inner: Weak<Inner<T>>, mut rx: mpsc::UnboundedReceiver<Command<T>>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Write(items) => match inner.upgrade() {
                Some(inner) => inner.write(items),
                None => break,
            },
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}
