use super::value_objects::{OrderId, OrderStatus, WorkerId};

// ============================================================================
// Fulfillment Rejections
// ============================================================================
//
// Every variant is terminal for the caller: nothing is retried automatically
// and no rejected operation leaves a partial mutation behind.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum FulfillmentError {
    #[error("Illegal transition: {from} -> {to}")]
    IllegalTransition { from: OrderStatus, to: OrderStatus },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Order {order_id} was already claimed by {owner}")]
    AlreadyClaimed { order_id: OrderId, owner: WorkerId },

    #[error("Order {order_id} is no longer available (status: {status})")]
    NotClaimable { order_id: OrderId, status: OrderStatus },

    #[error("Order not found: {0}")]
    NotFound(OrderId),

    #[error("Order items cannot be empty")]
    EmptyItems,

    #[error("Invalid item quantity: {0}")]
    InvalidQuantity(i32),

    #[error("Invalid unit price: {0}")]
    InvalidPrice(i64),

    #[error("Order total overflows")]
    PriceOverflow,

    #[error("Rating must be between 1 and 5, got {0}")]
    InvalidRating(u8),

    #[error("Order {0} has been paid and can no longer be cancelled")]
    PaidOrderNotCancellable(OrderId),

    #[error("Order storage failure: {0}")]
    Storage(#[source] anyhow::Error),
}

impl FulfillmentError {
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        FulfillmentError::Unauthorized(reason.into())
    }

    /// Short label used for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            FulfillmentError::IllegalTransition { .. } => "illegal_transition",
            FulfillmentError::Unauthorized(_) => "unauthorized",
            FulfillmentError::AlreadyClaimed { .. } => "already_claimed",
            FulfillmentError::NotClaimable { .. } => "not_claimable",
            FulfillmentError::NotFound(_) => "not_found",
            FulfillmentError::EmptyItems
            | FulfillmentError::InvalidQuantity(_)
            | FulfillmentError::InvalidPrice(_)
            | FulfillmentError::PriceOverflow => "invalid_items",
            FulfillmentError::InvalidRating(_) => "invalid_rating",
            FulfillmentError::PaidOrderNotCancellable(_) => "paid",
            FulfillmentError::Storage(_) => "storage",
        }
    }
}
