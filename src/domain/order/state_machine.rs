use chrono::{DateTime, Utc};

use super::aggregate::Order;
use super::errors::FulfillmentError;
use super::value_objects::{Actor, CompletedBy, OrderStatus};

// ============================================================================
// Order State Machine - pure transition validation
// ============================================================================
//
//   pending ──claim──▶ cooking ──mark ready──▶ ready ──complete──▶ completed
//      │
//      └──cancel──▶ cancelled
//
// No storage access here: `transition` returns the next snapshot and the
// caller commits it with a conditional update.
//
// ============================================================================

/// Legal edges of the order lifecycle
pub const LEGAL_EDGES: [(OrderStatus, OrderStatus); 4] = [
    (OrderStatus::Pending, OrderStatus::Cooking),
    (OrderStatus::Cooking, OrderStatus::Ready),
    (OrderStatus::Ready, OrderStatus::Completed),
    (OrderStatus::Pending, OrderStatus::Cancelled),
];

pub fn is_legal(from: OrderStatus, to: OrderStatus) -> bool {
    LEGAL_EDGES.contains(&(from, to))
}

/// Validate `order.status -> requested` for `actor` and return the new state.
pub fn transition(
    order: &Order,
    requested: OrderStatus,
    actor: &Actor,
    now: DateTime<Utc>,
) -> Result<Order, FulfillmentError> {
    use OrderStatus::*;

    if !is_legal(order.status, requested) {
        return Err(FulfillmentError::IllegalTransition {
            from: order.status,
            to: requested,
        });
    }

    let mut next = order.clone();

    match (order.status, requested) {
        (Pending, Cooking) => {
            let Actor::Kitchen(worker) = actor else {
                return Err(FulfillmentError::unauthorized("only kitchen staff can claim orders"));
            };
            next.owner = Some(*worker);
            next.claimed_by = Some(*worker);
        }
        (Cooking, Ready) => {
            let Actor::Kitchen(worker) = actor else {
                return Err(FulfillmentError::unauthorized("only kitchen staff can mark orders ready"));
            };
            if !order.is_owned_by(*worker) {
                return Err(FulfillmentError::unauthorized("order is claimed by another worker"));
            }
            next.ready_at = Some(now);
        }
        (Ready, Completed) => {
            let completed_by = match actor {
                Actor::System => CompletedBy::System,
                Actor::Kitchen(worker) if order.is_owned_by(*worker) => CompletedBy::Worker(*worker),
                Actor::Kitchen(_) => {
                    return Err(FulfillmentError::unauthorized("order is claimed by another worker"));
                }
                Actor::Customer(_) => {
                    return Err(FulfillmentError::unauthorized("customers cannot complete orders"));
                }
            };
            next.owner = None;
            next.ready_at = None;
            next.completed_by = Some(completed_by);
        }
        (Pending, Cancelled) => {
            match actor {
                Actor::Customer(customer) if *customer == order.customer_id => {}
                _ => {
                    return Err(FulfillmentError::unauthorized("only the ordering customer can cancel"));
                }
            }
            next.owner = None;
            next.ready_at = None;
        }
        _ => unreachable!("edge checked against LEGAL_EDGES"),
    }

    next.status = requested;
    next.version = order.version + 1;
    next.updated_at = now;

    Ok(next)
}

// ============================================================================
// Unit Tests
// ============================================================================
