use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;

use super::PersistenceSink;
use crate::trading::{OrderRequestSnapshot, OrderSnapshot};
use crate::Result;

/// SQLite-backed order history, keyed by link id
///
/// Opened explicitly and handed to the execution engine; call
/// [`close`](Self::close) on shutdown.
#[derive(Clone)]
pub struct SqliteOrderStore {
    pool: SqlitePool,
}

impl SqliteOrderStore {
    /// Open (creating if missing) and migrate the database
    ///
    /// # Arguments
    /// * `database_url` - e.g. `sqlite://orders.db` or `sqlite::memory:`
    pub async fn open(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // Every connection to an in-memory database is a separate database
        let in_memory = database_url.contains(":memory:");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options.connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Opened order store at {}", database_url);

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("Order store closed");
    }

    /// Requests updated within the last `period`, newest first
    pub async fn order_requests_since(
        &self,
        period: Duration,
    ) -> Result<Vec<OrderRequestSnapshot>> {
        let boundary = Utc::now().timestamp_millis() - period.as_millis() as i64;

        let rows = sqlx::query(
            r#"
            SELECT link_id, tag, id, symbol, qty, price, avg_price, exec_qty,
                   exec_value, fee, is_closed, created_at, updated_at
            FROM orders
            WHERE updated_at >= ?
            ORDER BY updated_at DESC
            "#,
        )
        .bind(boundary)
        .fetch_all(&self.pool)
        .await?;

        let requests = rows
            .iter()
            .map(request_from_row)
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;

        tracing::debug!("Loaded {} order requests from SQLite", requests.len());

        Ok(requests)
    }

    /// Single request by link id
    pub async fn order_request(&self, link_id: &str) -> Result<Option<OrderRequestSnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT link_id, tag, id, symbol, qty, price, avg_price, exec_qty,
                   exec_value, fee, is_closed, created_at, updated_at
            FROM orders
            WHERE link_id = ?
            "#,
        )
        .bind(link_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(request_from_row).transpose()?)
    }
}

fn request_from_row(row: &SqliteRow) -> std::result::Result<OrderRequestSnapshot, sqlx::Error> {
    Ok(OrderRequestSnapshot {
        link_id: row.try_get("link_id")?,
        tag: row.try_get("tag")?,
        order: OrderSnapshot {
            id: row.try_get("id")?,
            symbol: row.try_get("symbol")?,
            qty: row.try_get("qty")?,
            price: row.try_get("price")?,
            avg_price: row.try_get("avg_price")?,
            exec_qty: row.try_get("exec_qty")?,
            exec_value: row.try_get("exec_value")?,
            fee: row.try_get("fee")?,
            is_closed: row.try_get("is_closed")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        },
    })
}

#[async_trait]
impl PersistenceSink for SqliteOrderStore {
    async fn insert(&self, request: &OrderRequestSnapshot) -> Result<()> {
        let order = &request.order;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO orders (
                link_id, tag, id, symbol, qty, price, avg_price, exec_qty,
                exec_value, fee, is_closed, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&request.link_id)
        .bind(&request.tag)
        .bind(&order.id)
        .bind(&order.symbol)
        .bind(order.qty)
        .bind(order.price)
        .bind(order.avg_price)
        .bind(order.exec_qty)
        .bind(order.exec_value)
        .bind(order.fee)
        .bind(order.is_closed)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(link_id = %request.link_id, "Inserted order request");

        Ok(())
    }

    async fn update_id(&self, request: &OrderRequestSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE orders
            SET id = ?, updated_at = ?
            WHERE link_id = ?
            "#,
        )
        .bind(&request.order.id)
        .bind(Utc::now().timestamp_millis())
        .bind(&request.link_id)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            link_id = %request.link_id,
            order_id = %request.order.id,
            "Updated order id"
        );

        Ok(())
    }

    async fn update(&self, request: &OrderRequestSnapshot) -> Result<()> {
        let order = &request.order;

        sqlx::query(
            r#"
            UPDATE orders
            SET tag = ?, id = ?, symbol = ?, qty = ?, price = ?, avg_price = ?,
                exec_qty = ?, exec_value = ?, fee = ?, is_closed = ?,
                created_at = ?, updated_at = ?
            WHERE link_id = ?
            "#,
        )
        .bind(&request.tag)
        .bind(&order.id)
        .bind(&order.symbol)
        .bind(order.qty)
        .bind(order.price)
        .bind(order.avg_price)
        .bind(order.exec_qty)
        .bind(order.exec_value)
        .bind(order.fee)
        .bind(order.is_closed)
        .bind(order.created_at)
        .bind(order.updated_at)
        .bind(&request.link_id)
        .execute(&self.pool)
        .await?;

        tracing::debug!(link_id = %request.link_id, "Updated order");

        Ok(())
    }
}
