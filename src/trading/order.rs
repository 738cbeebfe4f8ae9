use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Plain copy of an order's fields
///
/// This is the shape exchanged with the trading client (JSON, camelCase) and
/// the persistence sink.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrderSnapshot {
    /// Exchange-assigned id, empty until placed
    pub id: String,
    pub symbol: String,
    /// Signed quantity: positive buys, negative sells
    pub qty: f64,
    /// Limit price; `None` for market orders
    pub price: Option<f64>,
    pub avg_price: f64,
    pub exec_qty: f64,
    pub exec_value: f64,
    pub fee: f64,
    /// Epoch milliseconds
    pub created_at: i64,
    /// Epoch milliseconds
    pub updated_at: i64,
    pub is_closed: bool,
}

impl OrderSnapshot {
    pub fn side(&self) -> OrderSide {
        if self.qty < 0.0 {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        }
    }

    pub fn is_market(&self) -> bool {
        self.price.is_none()
    }
}

/// Live order record shared between a strategy and the execution engine
///
/// Every access goes through the internal lock. Use [`snapshot`](Self::snapshot)
/// to hand the current state to another task.
#[derive(Debug, Default)]
pub struct Order {
    state: Mutex<OrderSnapshot>,
}

impl Order {
    pub fn new(symbol: impl Into<String>, qty: f64, price: Option<f64>) -> Self {
        Self::from_snapshot(OrderSnapshot {
            symbol: symbol.into(),
            qty,
            price,
            created_at: Utc::now().timestamp_millis(),
            ..Default::default()
        })
    }

    pub fn from_snapshot(snapshot: OrderSnapshot) -> Self {
        Self {
            state: Mutex::new(snapshot),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OrderSnapshot> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> String {
        self.lock().id.clone()
    }

    pub fn set_id(&self, id: impl Into<String>) {
        self.lock().id = id.into();
    }

    pub fn has_id(&self) -> bool {
        !self.lock().id.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_closed
    }

    /// Overwrite every field with `update` in one critical section
    pub fn replace(&self, update: &OrderSnapshot) {
        self.lock().clone_from(update);
    }

    /// Deep copy taken under the lock
    pub fn snapshot(&self) -> OrderSnapshot {
        self.lock().clone()
    }

    /// Run `f` with exclusive access to the fields
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut OrderSnapshot) -> R) -> R {
        f(&mut self.lock())
    }
}

impl Clone for Order {
    fn clone(&self) -> Self {
        Self::from_snapshot(self.snapshot())
    }
}

/// Reply sent to the originating strategy on each lifecycle transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderUpdate {
    pub link_id: String,
    pub order: OrderSnapshot,
}

/// Point-in-time copy of a request, used for logging and persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequestSnapshot {
    pub link_id: String,
    pub tag: String,
    pub order: OrderSnapshot,
}

/// Envelope handed from a strategy to the execution engine
#[derive(Debug)]
pub struct OrderRequest {
    /// Client-generated correlation id, stable across retries
    pub link_id: String,
    /// Identifier of the originating strategy
    pub tag: String,
    pub order: Arc<Order>,
    /// Wait before the first placement attempt
    pub delay: Duration,
    /// How long to wait for the order to close before cancelling it
    pub close_timeout: Duration,
    pub reply: Option<mpsc::Sender<OrderUpdate>>,
}

impl OrderRequest {
    pub fn new(tag: impl Into<String>, order: Arc<Order>) -> Self {
        Self {
            link_id: Uuid::new_v4().to_string(),
            tag: tag.into(),
            order,
            delay: Duration::ZERO,
            close_timeout: Duration::ZERO,
            reply: None,
        }
    }

    pub fn with_link_id(mut self, link_id: impl Into<String>) -> Self {
        self.link_id = link_id.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    pub fn with_reply(mut self, reply: mpsc::Sender<OrderUpdate>) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn snapshot(&self) -> OrderRequestSnapshot {
        OrderRequestSnapshot {
            link_id: self.link_id.clone(),
            tag: self.tag.clone(),
            order: self.order.snapshot(),
        }
    }
}
