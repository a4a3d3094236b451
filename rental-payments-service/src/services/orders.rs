//! Read-only access to rental orders.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use tokio::sync::RwLock;
use tracing::instrument;
use uuid::Uuid;

use crate::models::Order;
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{StoreError, StoreResult};

#[async_trait]
pub trait OrderSource: Send + Sync {
    async fn get_order(&self, order_id: Uuid) -> StoreResult<Option<Order>>;
}

/// Reads the rental app's `orders` table.
#[derive(Clone)]
pub struct PgOrderSource {
    pool: PgPool,
}

impl PgOrderSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderSource for PgOrderSource {
    #[instrument(skip(self), fields(order_id = %order_id))]
    async fn get_order(&self, order_id: Uuid) -> StoreResult<Option<Order>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_order"])
            .start_timer();

        let order = sqlx::query_as::<_, Order>(
            r#"
            SELECT id, order_number, first_name, last_name, email, phone, address, city, state, zip,
                dumpster_size, quoted_price, final_price, scheduled_delivery_date, scheduled_pickup_date
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Database)?;

        timer.observe_duration();

        Ok(order)
    }
}

/// In-process order source for the memory mode and tests.
#[derive(Default)]
pub struct MemoryOrderSource {
    orders: RwLock<HashMap<Uuid, Order>>,
}

impl MemoryOrderSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, order: Order) {
        self.orders.write().await.insert(order.id, order);
    }
}

#[async_trait]
impl OrderSource for MemoryOrderSource {
    async fn get_order(&self, order_id: Uuid) -> StoreResult<Option<Order>> {
        Ok(self.orders.read().await.get(&order_id).cloned())
    }
}
