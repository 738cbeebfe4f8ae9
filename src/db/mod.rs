pub mod sqlite;

use async_trait::async_trait;

use crate::trading::OrderRequestSnapshot;
use crate::Result;

pub use sqlite::SqliteOrderStore;

/// Destination for order lifecycle snapshots
///
/// The execution engine logs failures and never retries.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Record a new request (replacing any row with the same link id)
    async fn insert(&self, request: &OrderRequestSnapshot) -> Result<()>;

    /// Record the exchange-assigned id
    async fn update_id(&self, request: &OrderRequestSnapshot) -> Result<()>;

    /// Record the full current state
    async fn update(&self, request: &OrderRequestSnapshot) -> Result<()>;
}
