use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{BoxStream, StreamExt};
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use scylla::response::query_result::QueryResult;
use scylla::value::{CqlValue, Row};
use std::sync::Arc;
use uuid::Uuid;
use anyhow::{Context, Result};

use crate::domain::order::{CompletedBy, CustomerId, Order, OrderId, OrderLine, OrderStatus, PaymentStatus, WorkerId};
use super::{Expected, OrderPatch, OrderStore, OwnerExpectation, PaymentStatusWriter, StoreError};

// ============================================================================
// ScyllaDB Order Store
// ============================================================================
//
// Conditional updates are lightweight transactions:
//
//   UPDATE orders SET ... WHERE id = ? IF status = ? [AND owner = ...]
//
// Paxos decides a single winner among racing writers; the `[applied]`
// column of the response tells us whether we were it.
//
// ============================================================================

const ORDER_COLUMNS: &str = "id, customer_id, status, payment_status, owner, claimed_by, ready_at, \
     completed_by, items, total_price_cents, version, created_at, updated_at";

type OrderRow = (
    Uuid,
    Uuid,
    String,
    String,
    Option<Uuid>,
    Option<Uuid>,
    Option<DateTime<Utc>>,
    Option<String>,
    String,
    i64,
    i64,
    DateTime<Utc>,
    DateTime<Utc>,
);

fn backend<E: Into<anyhow::Error>>(error: E) -> StoreError {
    StoreError::Backend(error.into())
}

pub struct ScyllaOrderStore {
    session: Arc<Session>,
}

impl ScyllaOrderStore {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Connect, create the keyspace/table if needed and switch to it
    pub async fn connect(node: &str, keyspace: &str) -> Result<Self> {
        tracing::info!(node = %node, keyspace = %keyspace, "Connecting to ScyllaDB...");
        let session: Session = SessionBuilder::new()
            .known_node(node)
            .build()
            .await
            .with_context(|| format!("failed to connect to ScyllaDB at {}", node))?;

        let store = Self::new(Arc::new(session));
        store.ensure_schema(keyspace).await?;
        Ok(store)
    }

    pub async fn ensure_schema(&self, keyspace: &str) -> Result<()> {
        self.session
            .query_unpaged(
                format!(
                    "CREATE KEYSPACE IF NOT EXISTS {} WITH REPLICATION = \
                     {{'class': 'SimpleStrategy', 'replication_factor': 1}}",
                    keyspace
                ),
                &[],
            )
            .await?;

        self.session.use_keyspace(keyspace, false).await?;

        self.session
            .query_unpaged(
                "CREATE TABLE IF NOT EXISTS orders (
                    id uuid PRIMARY KEY,
                    customer_id uuid,
                    status text,
                    payment_status text,
                    owner uuid,
                    claimed_by uuid,
                    ready_at timestamp,
                    completed_by text,
                    items text,
                    total_price_cents bigint,
                    version bigint,
                    created_at timestamp,
                    updated_at timestamp
                )",
                &[],
            )
            .await?;

        self.session
            .query_unpaged("CREATE INDEX IF NOT EXISTS orders_by_status ON orders (status)", &[])
            .await?;

        tracing::info!(keyspace = %keyspace, "✅ Order schema ready");
        Ok(())
    }

    async fn run_conditional_update(
        &self,
        id: OrderId,
        expected: Expected,
        patch: &OrderPatch,
    ) -> Result<QueryResult> {
        let owner_clause = match expected.owner {
            OwnerExpectation::Any => "",
            OwnerExpectation::Unset => " AND owner = null",
            OwnerExpectation::Held(_) => " AND owner = ?",
        };
        let statement = format!(
            "UPDATE orders SET status = ?, owner = ?, claimed_by = ?, ready_at = ?, completed_by = ?, version = ?, updated_at = ? \
             WHERE id = ? IF status = ?{}",
            owner_clause
        );

        let assignments = (
            patch.status.as_str(),
            patch.owner.map(|w| w.as_uuid()),
            patch.claimed_by.map(|w| w.as_uuid()),
            patch.ready_at,
            patch.completed_by.map(|c| c.encode()),
            patch.version,
            patch.updated_at,
            id.as_uuid(),
            expected.status.as_str(),
        );

        let result = match expected.owner {
            OwnerExpectation::Held(worker) => {
                let (status, owner, claimed_by, ready_at, completed_by, version, updated_at, id, expected_status) =
                    assignments;
                self.session
                    .query_unpaged(
                        statement,
                        (
                            status,
                            owner,
                            claimed_by,
                            ready_at,
                            completed_by,
                            version,
                            updated_at,
                            id,
                            expected_status,
                            worker.as_uuid(),
                        ),
                    )
                    .await?
            }
            _ => self.session.query_unpaged(statement, assignments).await?,
        };

        Ok(result)
    }
}

/// First column of an LWT response
fn was_applied(result: QueryResult) -> Result<bool> {
    let rows = result.into_rows_result()?;
    let row: Row = rows.first_row()?;
    match row.columns.first() {
        Some(Some(CqlValue::Boolean(applied))) => Ok(*applied),
        other => anyhow::bail!("Unexpected LWT response column: {:?}", other),
    }
}

pub(crate) fn order_from_row(row: OrderRow) -> Result<Order> {
    let (
        id,
        customer_id,
        status,
        payment_status,
        owner,
        claimed_by,
        ready_at,
        completed_by,
        items,
        total_price_cents,
        version,
        created_at,
        updated_at,
    ) = row;

    let status = OrderStatus::parse(&status)
        .with_context(|| format!("order {} has unknown status '{}'", id, status))?;
    let payment_status = PaymentStatus::parse(&payment_status)
        .with_context(|| format!("order {} has unknown payment status '{}'", id, payment_status))?;
    let completed_by = match completed_by {
        Some(raw) => Some(
            CompletedBy::decode(&raw)
                .with_context(|| format!("order {} has malformed completed_by '{}'", id, raw))?,
        ),
        None => None,
    };
    let items: Vec<OrderLine> = serde_json::from_str(&items)
        .with_context(|| format!("order {} has malformed items", id))?;

    Ok(Order {
        id: OrderId(id),
        customer_id: CustomerId(customer_id),
        version,
        status,
        owner: owner.map(WorkerId),
        claimed_by: claimed_by.map(WorkerId),
        ready_at,
        completed_by,
        payment_status,
        items,
        total_price_cents,
        created_at,
        updated_at,
    })
}

#[async_trait]
impl OrderStore for ScyllaOrderStore {
    async fn insert(&self, order: &Order) -> Result<(), StoreError> {
        let items = serde_json::to_string(&order.items).map_err(backend)?;
        let result = self
            .session
            .query_unpaged(
                format!("INSERT INTO orders ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) IF NOT EXISTS", ORDER_COLUMNS),
                (
                    order.id.as_uuid(),
                    order.customer_id.as_uuid(),
                    order.status.as_str(),
                    order.payment_status.as_str(),
                    order.owner.map(|w| w.as_uuid()),
                    order.claimed_by.map(|w| w.as_uuid()),
                    order.ready_at,
                    order.completed_by.map(|c| c.encode()),
                    items,
                    order.total_price_cents,
                    order.version,
                    order.created_at,
                    order.updated_at,
                ),
            )
            .await
            .map_err(backend)?;

        if !was_applied(result)? {
            return Err(backend(anyhow::anyhow!("Order {} already exists", order.id)));
        }

        tracing::debug!(order_id = %order.id, "Inserted order");
        Ok(())
    }

    async fn get_by_id(&self, id: OrderId) -> Result<Order, StoreError> {
        let result = self
            .session
            .query_unpaged(format!("SELECT {} FROM orders WHERE id = ?", ORDER_COLUMNS), (id.as_uuid(),))
            .await
            .map_err(backend)?;

        let rows = result.into_rows_result().map_err(backend)?;
        match rows.maybe_first_row::<OrderRow>().map_err(backend)? {
            Some(row) => Ok(order_from_row(row)?),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn conditional_update(
        &self,
        id: OrderId,
        expected: Expected,
        patch: &OrderPatch,
    ) -> Result<Order, StoreError> {
        let result = self.run_conditional_update(id, expected, patch).await?;

        if !was_applied(result)? {
            let current = self.get_by_id(id).await?;
            tracing::debug!(
                order_id = %id,
                expected_status = %expected.status,
                current_status = %current.status,
                "LWT not applied"
            );
            return Err(StoreError::Conflict { current: Box::new(current) });
        }

        // Re-read for the immutable columns; the lifecycle fields are ours
        let mut order = self.get_by_id(id).await?;
        patch.apply_to(&mut order);
        Ok(order)
    }

    async fn scan_by_status(
        &self,
        status: OrderStatus,
    ) -> Result<BoxStream<'static, Result<Order, StoreError>>, StoreError> {
        let pager = self
            .session
            .query_iter(format!("SELECT {} FROM orders WHERE status = ?", ORDER_COLUMNS), (status.as_str(),))
            .await
            .map_err(backend)?;

        let rows = pager.rows_stream::<OrderRow>().map_err(backend)?;

        Ok(rows
            .map(|row| row.map_err(backend).and_then(|row| order_from_row(row).map_err(StoreError::Backend)))
            .boxed())
    }
}

#[async_trait]
impl PaymentStatusWriter for ScyllaOrderStore {
    async fn record_payment(&self, id: OrderId, status: PaymentStatus) -> Result<(), StoreError> {
        let result = self
            .session
            .query_unpaged(
                "UPDATE orders SET payment_status = ? WHERE id = ? IF EXISTS",
                (status.as_str(), id.as_uuid()),
            )
            .await
            .map_err(backend)?;

        if !was_applied(result)? {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
//
// Query execution needs a live cluster; these cover row mapping.
//
// ============================================================================
