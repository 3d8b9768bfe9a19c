use std::sync::Arc;

use crate::domain::order::{Actor, FulfillmentError, Order, OrderId, OrderStatus, WorkerId};
use crate::metrics::Metrics;
use crate::store::OwnerExpectation;
use super::committer::{CommitRejection, TransitionCommitter};

// ============================================================================
// Claim Arbiter - pending -> cooking, one winner per order
// ============================================================================
//
// The claim is a single conditional update on `status = pending AND owner
// IS NULL`. The read before it only feeds validation; the race itself is
// settled by the store. This is the only path that ever sets `owner`.
//
// ============================================================================

pub struct ClaimArbiter {
    committer: Arc<TransitionCommitter>,
    metrics: Arc<Metrics>,
}

impl ClaimArbiter {
    pub fn new(committer: Arc<TransitionCommitter>, metrics: Arc<Metrics>) -> Self {
        Self { committer, metrics }
    }

    pub async fn claim(&self, order_id: OrderId, worker: WorkerId) -> Result<Order, FulfillmentError> {
        let result = self.try_claim(order_id, worker).await;

        match &result {
            Ok(order) => {
                self.metrics.record_claim("won");
                tracing::info!(order_id = %order.id, worker_id = %worker, "🍳 Order claimed");
            }
            Err(err) => {
                self.metrics.record_claim(err.reason());
                tracing::info!(order_id = %order_id, worker_id = %worker, error = %err, "Claim rejected");
            }
        }

        result
    }

    async fn try_claim(&self, order_id: OrderId, worker: WorkerId) -> Result<Order, FulfillmentError> {
        let current = self.committer.load(order_id).await?;

        match self
            .committer
            .commit(&current, OrderStatus::Cooking, &Actor::Kitchen(worker), OwnerExpectation::Unset)
            .await
        {
            Ok(order) => Ok(order),
            Err(CommitRejection::Conflict(latest)) => Err(lost_claim(order_id, &latest)),
            // Already out of pending when we read it
            Err(CommitRejection::Rejected(FulfillmentError::IllegalTransition { .. })) => {
                Err(lost_claim(order_id, &current))
            }
            Err(CommitRejection::Rejected(err)) => Err(err),
        }
    }
}

/// Name the winner if someone holds the order, otherwise it simply left
/// `pending` (cancelled, or already finished)
fn lost_claim(order_id: OrderId, current: &Order) -> FulfillmentError {
    match current.owner {
        Some(owner) if current.status.is_owned() => FulfillmentError::AlreadyClaimed { order_id, owner },
        _ => FulfillmentError::NotClaimable {
            order_id,
            status: current.status,
        },
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
