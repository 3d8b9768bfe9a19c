use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::domain::order::{Order, OrderId, OrderStatus, PaymentStatus};
use super::{Expected, OrderPatch, OrderStore, PaymentStatusWriter, StoreError};

// ============================================================================
// In-Memory Order Store
// ============================================================================
//
// The check and the write of `conditional_update` happen under a single
// write guard, which gives the same atomicity as a storage-side CAS.
// Used by tests and by the demo binary when no cluster is configured.
//
// ============================================================================

#[derive(Default)]
pub struct InMemoryOrderStore {
    orders: RwLock<HashMap<OrderId, Order>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.orders.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.orders.read().await.is_empty()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn insert(&self, order: &Order) -> Result<(), StoreError> {
        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.id) {
            return Err(StoreError::Backend(anyhow::anyhow!("Order {} already exists", order.id)));
        }
        orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: OrderId) -> Result<Order, StoreError> {
        self.orders
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn conditional_update(
        &self,
        id: OrderId,
        expected: Expected,
        patch: &OrderPatch,
    ) -> Result<Order, StoreError> {
        let mut orders = self.orders.write().await;
        let order = orders.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if !expected.matches(order) {
            tracing::debug!(
                order_id = %id,
                expected_status = %expected.status,
                current_status = %order.status,
                "Conditional update rejected"
            );
            return Err(StoreError::Conflict { current: Box::new(order.clone()) });
        }

        patch.apply_to(order);
        Ok(order.clone())
    }

    async fn scan_by_status(
        &self,
        status: OrderStatus,
    ) -> Result<BoxStream<'static, Result<Order, StoreError>>, StoreError> {
        let matching: Vec<Result<Order, StoreError>> = self
            .orders
            .read()
            .await
            .values()
            .filter(|order| order.status == status)
            .cloned()
            .map(Ok)
            .collect();

        Ok(stream::iter(matching).boxed())
    }
}

#[async_trait]
impl PaymentStatusWriter for InMemoryOrderStore {
    async fn record_payment(&self, id: OrderId, status: PaymentStatus) -> Result<(), StoreError> {
        let mut orders = self.orders.write().await;
        let order = orders.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        order.payment_status = status;
        Ok(())
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{transition, Actor, CustomerId, OrderLine, WorkerId};
    use crate::store::OwnerExpectation;
    use chrono::Utc;
    use futures_util::TryStreamExt;
    use std::sync::Arc;
    use uuid::Uuid;

    fn order() -> Order {
        Order::place(CustomerId::new(), vec![OrderLine::new(Uuid::new_v4(), 1, 300)], Utc::now()).unwrap()
    }

    fn claim_patch(order: &Order, worker: WorkerId) -> OrderPatch {
        let next = transition(order, OrderStatus::Cooking, &Actor::Kitchen(worker), Utc::now()).unwrap();
        OrderPatch::from_order(&next)
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = InMemoryOrderStore::new();
        let order = order();
        store.insert(&order).await.unwrap();

        assert_eq!(store.get_by_id(order.id).await.unwrap(), order);
        assert!(matches!(store.get_by_id(OrderId::new()).await, Err(StoreError::NotFound(_))));
        assert!(store.insert(&order).await.is_err());
    }

    #[tokio::test]
    async fn test_conditional_update_applies_when_expected_matches() {
        let store = InMemoryOrderStore::new();
        let order = order();
        store.insert(&order).await.unwrap();
        let worker = WorkerId::new();

        let updated = store
            .conditional_update(
                order.id,
                Expected::new(OrderStatus::Pending, OwnerExpectation::Unset),
                &claim_patch(&order, worker),
            )
            .await
            .unwrap();

        assert_eq!(updated.status, OrderStatus::Cooking);
        assert_eq!(updated.owner, Some(worker));
        assert_eq!(updated.version, 2);
    }

    #[tokio::test]
    async fn test_conditional_update_conflict_reports_current() {
        let store = InMemoryOrderStore::new();
        let order = order();
        store.insert(&order).await.unwrap();
        let first = WorkerId::new();
        let expected = Expected::new(OrderStatus::Pending, OwnerExpectation::Unset);

        store.conditional_update(order.id, expected, &claim_patch(&order, first)).await.unwrap();
        let err = store
            .conditional_update(order.id, expected, &claim_patch(&order, WorkerId::new()))
            .await
            .unwrap_err();

        match err {
            StoreError::Conflict { current } => assert_eq!(current.owner, Some(first)),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_updates_single_winner() {
        let store = Arc::new(InMemoryOrderStore::new());
        let order = order();
        store.insert(&order).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                store
                    .conditional_update(
                        order.id,
                        Expected::new(OrderStatus::Pending, OwnerExpectation::Unset),
                        &claim_patch(&order, WorkerId::new()),
                    )
                    .await
                    .is_ok()
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_scan_by_status() {
        let store = InMemoryOrderStore::new();
        let a = order();
        let b = order();
        store.insert(&a).await.unwrap();
        store.insert(&b).await.unwrap();
        store
            .conditional_update(
                b.id,
                Expected::new(OrderStatus::Pending, OwnerExpectation::Unset),
                &claim_patch(&b, WorkerId::new()),
            )
            .await
            .unwrap();

        let pending: Vec<Order> = store
            .scan_by_status(OrderStatus::Pending)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, a.id);
    }

    #[tokio::test]
    async fn test_record_payment_leaves_lifecycle_untouched() {
        let store = InMemoryOrderStore::new();
        let order = order();
        store.insert(&order).await.unwrap();

        store.record_payment(order.id, PaymentStatus::Paid).await.unwrap();

        let stored = store.get_by_id(order.id).await.unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::Paid);
        assert_eq!(stored.status, OrderStatus::Pending);
        assert_eq!(stored.version, order.version);
    }
}
