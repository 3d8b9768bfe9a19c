use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;

use crate::domain::order::{CompletedBy, Order, OrderId, OrderStatus, PaymentStatus, WorkerId};

// ============================================================================
// Order Store - durable order records with conditional updates
// ============================================================================
//
// Every write to status / owner / ready_at goes through
// `conditional_update`, keyed on the status (and owner) the writer expects.
// That check-and-set is the only serialization point for racing callers.
//
// ============================================================================

mod memory;
mod scylla_store;

pub use memory::InMemoryOrderStore;
pub use scylla_store::ScyllaOrderStore;

/// Owner precondition of a conditional update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerExpectation {
    Any,
    Unset,
    Held(WorkerId),
}

impl OwnerExpectation {
    pub fn matches(&self, owner: Option<WorkerId>) -> bool {
        match self {
            OwnerExpectation::Any => true,
            OwnerExpectation::Unset => owner.is_none(),
            OwnerExpectation::Held(worker) => owner == Some(*worker),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expected {
    pub status: OrderStatus,
    pub owner: OwnerExpectation,
}

impl Expected {
    pub fn new(status: OrderStatus, owner: OwnerExpectation) -> Self {
        Self { status, owner }
    }

    pub fn matches(&self, order: &Order) -> bool {
        order.status == self.status && self.owner.matches(order.owner)
    }
}

/// Lifecycle fields written by a transition
#[derive(Debug, Clone, PartialEq)]
pub struct OrderPatch {
    pub status: OrderStatus,
    pub owner: Option<WorkerId>,
    pub claimed_by: Option<WorkerId>,
    pub ready_at: Option<DateTime<Utc>>,
    pub completed_by: Option<CompletedBy>,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl OrderPatch {
    pub fn from_order(next: &Order) -> Self {
        Self {
            status: next.status,
            owner: next.owner,
            claimed_by: next.claimed_by,
            ready_at: next.ready_at,
            completed_by: next.completed_by,
            version: next.version,
            updated_at: next.updated_at,
        }
    }

    pub fn apply_to(&self, order: &mut Order) {
        order.status = self.status;
        order.owner = self.owner;
        order.claimed_by = self.claimed_by;
        order.ready_at = self.ready_at;
        order.completed_by = self.completed_by;
        order.version = self.version;
        order.updated_at = self.updated_at;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The precondition did not hold; `current` is the record as observed
    #[error("Conditional update conflict (current status: {})", .current.status)]
    Conflict { current: Box<Order> },

    #[error("Order not found: {0}")]
    NotFound(OrderId),

    #[error("Store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert(&self, order: &Order) -> Result<(), StoreError>;

    async fn get_by_id(&self, id: OrderId) -> Result<Order, StoreError>;

    /// Atomically apply `patch` iff the stored order matches `expected`
    async fn conditional_update(
        &self,
        id: OrderId,
        expected: Expected,
        patch: &OrderPatch,
    ) -> Result<Order, StoreError>;

    async fn scan_by_status(
        &self,
        status: OrderStatus,
    ) -> Result<BoxStream<'static, Result<Order, StoreError>>, StoreError>;
}

/// The payment collaborator's write path. Fulfillment never calls it.
#[async_trait]
pub trait PaymentStatusWriter: Send + Sync {
    async fn record_payment(&self, id: OrderId, status: PaymentStatus) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_expectation() {
        let worker = WorkerId::new();
        assert!(OwnerExpectation::Any.matches(None));
        assert!(OwnerExpectation::Any.matches(Some(worker)));
        assert!(OwnerExpectation::Unset.matches(None));
        assert!(!OwnerExpectation::Unset.matches(Some(worker)));
        assert!(OwnerExpectation::Held(worker).matches(Some(worker)));
        assert!(!OwnerExpectation::Held(worker).matches(Some(WorkerId::new())));
        assert!(!OwnerExpectation::Held(worker).matches(None));
    }
}
