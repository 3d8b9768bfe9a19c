use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

use super::value_objects::{CompletedBy, CustomerId, OrderId, OrderLine, OrderStatus, PaymentStatus, WorkerId};
use super::errors::FulfillmentError;

// ============================================================================
// Order - the record the coordinator moves through its lifecycle
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    // Identity
    pub id: OrderId,
    pub customer_id: CustomerId,
    /// Commit sequence: 1 at placement, +1 per accepted transition
    pub version: i64,

    // Lifecycle (mutated only through the state machine)
    pub status: OrderStatus,
    pub owner: Option<WorkerId>,
    /// Worker whose claim won; unlike `owner` it survives completion
    pub claimed_by: Option<WorkerId>,
    pub ready_at: Option<DateTime<Utc>>,
    pub completed_by: Option<CompletedBy>,

    // Owned by the payment collaborator
    pub payment_status: PaymentStatus,

    // Immutable contents
    pub items: Vec<OrderLine>,
    pub total_price_cents: i64,

    // Audit Trail
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Build a new `pending` order, validating items and computing the total
    pub fn place(
        customer_id: CustomerId,
        items: Vec<OrderLine>,
        now: DateTime<Utc>,
    ) -> Result<Self, FulfillmentError> {
        let total_price_cents = Self::validate_items(&items)?;

        Ok(Self {
            id: OrderId::new(),
            customer_id,
            version: 1,
            status: OrderStatus::Pending,
            owner: None,
            claimed_by: None,
            ready_at: None,
            completed_by: None,
            payment_status: PaymentStatus::Pending,
            items,
            total_price_cents,
            created_at: now,
            updated_at: now,
        })
    }

    /// Validate business rules on items, returning the order total
    fn validate_items(items: &[OrderLine]) -> Result<i64, FulfillmentError> {
        if items.is_empty() {
            return Err(FulfillmentError::EmptyItems);
        }

        let mut total: i64 = 0;
        for item in items {
            if item.quantity <= 0 {
                return Err(FulfillmentError::InvalidQuantity(item.quantity));
            }
            if item.unit_price_cents < 0 {
                return Err(FulfillmentError::InvalidPrice(item.unit_price_cents));
            }
            total = item
                .line_total_cents()
                .and_then(|line| total.checked_add(line))
                .ok_or(FulfillmentError::PriceOverflow)?;
        }

        Ok(total)
    }

    pub fn is_owned_by(&self, worker: WorkerId) -> bool {
        self.owner == Some(worker)
    }

    /// Whether `worker` won the claim, whatever the order's status now
    pub fn was_claimed_by(&self, worker: WorkerId) -> bool {
        self.claimed_by == Some(worker)
    }

    /// `owner` set iff cooking/ready and always the claim winner,
    /// `ready_at` set iff ready, `completed_by` set iff completed.
    pub fn invariants_hold(&self) -> bool {
        let claimed = matches!(
            self.status,
            OrderStatus::Cooking | OrderStatus::Ready | OrderStatus::Completed
        );
        self.owner.is_some() == self.status.is_owned()
            && self.claimed_by.is_some() == claimed
            && (self.owner.is_none() || self.owner == self.claimed_by)
            && self.ready_at.is_some() == (self.status == OrderStatus::Ready)
            && self.completed_by.is_some() == (self.status == OrderStatus::Completed)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
