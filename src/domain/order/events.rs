use serde::{Deserialize, Serialize};

use crate::events::DomainEvent;
use super::aggregate::Order;
use super::value_objects::{CustomerId, OrderId, OrderStatus, WorkerId};

// ============================================================================
// Order Events - pushed to customers and kitchen staff
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// New work for the kitchen
    OrderPlaced,
    OrderClaimed,
    OrderReady,
    OrderCompleted,
    OrderCancelled,
    /// A customer rated a completed order poorly
    LowRatingAlert,
}

impl EventKind {
    /// Event emitted when an order enters `status`
    pub fn for_status(status: OrderStatus) -> Self {
        match status {
            OrderStatus::Pending => EventKind::OrderPlaced,
            OrderStatus::Cooking => EventKind::OrderClaimed,
            OrderStatus::Ready => EventKind::OrderReady,
            OrderStatus::Completed => EventKind::OrderCompleted,
            OrderStatus::Cancelled => EventKind::OrderCancelled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::OrderPlaced => "order-placed",
            EventKind::OrderClaimed => "order-claimed",
            EventKind::OrderReady => "order-ready",
            EventKind::OrderCompleted => "order-completed",
            EventKind::OrderCancelled => "order-cancelled",
            EventKind::LowRatingAlert => "low-rating-alert",
        }
    }

    pub fn notifies_customer(&self) -> bool {
        matches!(
            self,
            EventKind::OrderClaimed
                | EventKind::OrderReady
                | EventKind::OrderCompleted
                | EventKind::OrderCancelled
        )
    }

    pub fn notifies_kitchen(&self) -> bool {
        matches!(
            self,
            EventKind::OrderPlaced
                | EventKind::OrderClaimed
                | EventKind::OrderCancelled
                | EventKind::LowRatingAlert
        )
    }

    /// The final event an order can produce
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::OrderCompleted | EventKind::OrderCancelled)
    }
}

/// Who a notification is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum RecipientScope {
    Customer(CustomerId),
    KitchenStaff,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub kind: EventKind,
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub status: OrderStatus,
    pub owner: Option<WorkerId>,
    pub detail: Option<String>,
}

impl DomainEvent for OrderEvent {
    fn event_type() -> &'static str { "OrderEvent" }
}

impl OrderEvent {
    /// Event describing `order` as just committed
    pub fn from_order(order: &Order) -> Self {
        Self {
            kind: EventKind::for_status(order.status),
            order_id: order.id,
            customer_id: order.customer_id,
            status: order.status,
            owner: order.owner,
            detail: None,
        }
    }

    pub fn low_rating(order: &Order, rating: u8, comment: Option<String>) -> Self {
        let detail = match comment {
            Some(comment) => format!("rating {}: {}", rating, comment),
            None => format!("rating {}", rating),
        };
        Self {
            kind: EventKind::LowRatingAlert,
            order_id: order.id,
            customer_id: order.customer_id,
            status: order.status,
            owner: order.owner,
            detail: Some(detail),
        }
    }

    pub fn recipients(&self) -> Vec<RecipientScope> {
        let mut scopes = Vec::with_capacity(2);
        if self.kind.notifies_customer() {
            scopes.push(RecipientScope::Customer(self.customer_id));
        }
        if self.kind.notifies_kitchen() {
            scopes.push(RecipientScope::KitchenStaff);
        }
        scopes
    }
}
