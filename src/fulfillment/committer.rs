use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::domain::order::{transition, Actor, FulfillmentError, Order, OrderId, OrderStatus};
use crate::events::EventPublisher;
use crate::metrics::Metrics;
use crate::store::{Expected, OrderPatch, OrderStore, OwnerExpectation, StoreError};

// ============================================================================
// Transition Committer - validate, conditionally write, then publish
// ============================================================================
//
// Shared by the coordinator operations and by the ready-timeout scheduler,
// so a manual completion and a timer firing go through the very same
// conditional update. Publishing happens only after the write is applied
// and never influences its outcome.
//
// ============================================================================

/// Why a commit did not apply
#[derive(Debug)]
pub enum CommitRejection {
    /// Validation or storage failure
    Rejected(FulfillmentError),
    /// The stored order no longer matched the snapshot; carries the record
    /// as observed by the store
    Conflict(Box<Order>),
}

/// What a fired ready timer ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoCompletion {
    Completed,
    /// Someone completed the order first, or it left `ready` another way
    Superseded,
    Failed,
}

impl AutoCompletion {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoCompletion::Completed => "completed",
            AutoCompletion::Superseded => "superseded",
            AutoCompletion::Failed => "failed",
        }
    }
}

/// Map a non-conflict store failure onto the rejection callers see
pub(crate) fn storage_failure(err: StoreError) -> FulfillmentError {
    match err {
        StoreError::NotFound(id) => FulfillmentError::NotFound(id),
        StoreError::Backend(err) => FulfillmentError::Storage(err),
        StoreError::Conflict { current } => FulfillmentError::Storage(anyhow::anyhow!(
            "unexpected conflict on order {} (status: {})",
            current.id,
            current.status
        )),
    }
}

fn detached_failure(err: tokio::task::JoinError) -> FulfillmentError {
    FulfillmentError::Storage(anyhow::anyhow!("commit task failed: {}", err))
}

// Timestamps round-trip through storage at millisecond precision
fn same_instant(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.timestamp_millis() == b.timestamp_millis()
}

pub struct TransitionCommitter {
    store: Arc<dyn OrderStore>,
    publisher: EventPublisher,
    metrics: Arc<Metrics>,
}

impl TransitionCommitter {
    pub fn new(store: Arc<dyn OrderStore>, publisher: EventPublisher, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            publisher,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn OrderStore> {
        &self.store
    }

    pub async fn load(&self, order_id: OrderId) -> Result<Order, FulfillmentError> {
        self.store.get_by_id(order_id).await.map_err(storage_failure)
    }

    /// Insert a freshly placed order and publish `order-placed`.
    ///
    /// Runs detached from the caller like `commit`, so the first event of
    /// the stream cannot go missing.
    pub async fn place(&self, order: Order) -> Result<Order, FulfillmentError> {
        let store = self.store.clone();
        let publisher = self.publisher.clone();

        let task = tokio::spawn(async move {
            // Start the stream before the insert: a claim can commit and
            // publish before this task reaches its own publish
            publisher.begin_stream(order.id, order.version).await;

            if let Err(err) = store.insert(&order).await {
                publisher.end_stream(order.id).await;
                return Err(storage_failure(err));
            }

            tracing::info!(
                order_id = %order.id,
                customer_id = %order.customer_id,
                items = order.items.len(),
                total_price_cents = order.total_price_cents,
                "📝 Order placed"
            );

            publisher.publish_transition(&order).await;
            Ok::<Order, FulfillmentError>(order)
        });

        task.await.map_err(detached_failure)?
    }

    /// Move `current` to `requested` on behalf of `actor`.
    ///
    /// The write is conditioned on the snapshot's status plus `owner`, so a
    /// concurrent change between the read and this call surfaces as
    /// `CommitRejection::Conflict` instead of being overwritten.
    ///
    /// The conditional update and the publish of its event run on a spawned
    /// task. Dropping the returned future does not abandon an applied write
    /// before its event is out; the per-order stream would stall on the gap.
    pub async fn commit(
        &self,
        current: &Order,
        requested: OrderStatus,
        actor: &Actor,
        owner: OwnerExpectation,
    ) -> Result<Order, CommitRejection> {
        let next = transition(current, requested, actor, Utc::now()).map_err(CommitRejection::Rejected)?;

        let expected = Expected::new(current.status, owner);
        let from = current.status;
        let actor = *actor;
        let store = self.store.clone();
        let publisher = self.publisher.clone();
        let metrics = self.metrics.clone();

        let task = tokio::spawn(async move {
            let committed = store
                .conditional_update(next.id, expected, &OrderPatch::from_order(&next))
                .await
                .map_err(|err| match err {
                    StoreError::Conflict { current } => CommitRejection::Conflict(current),
                    other => CommitRejection::Rejected(storage_failure(other)),
                })?;

            metrics.record_transition(from.as_str(), committed.status.as_str());
            tracing::info!(
                order_id = %committed.id,
                from = %from,
                to = %committed.status,
                actor = %actor,
                version = committed.version,
                "✅ Order transition committed"
            );

            publisher.publish_transition(&committed).await;
            Ok::<Order, CommitRejection>(committed)
        });

        task.await
            .map_err(|err| CommitRejection::Rejected(detached_failure(err)))?
    }

    /// System completion for an order whose ready timer elapsed.
    ///
    /// A lost race is the expected outcome whenever a human got there
    /// first, so it is only logged at debug level.
    pub async fn complete_expired(&self, order_id: OrderId, ready_at: DateTime<Utc>) -> AutoCompletion {
        let outcome = self.try_complete_expired(order_id, ready_at).await;
        self.metrics.record_auto_completion(outcome.as_str());
        outcome
    }

    async fn try_complete_expired(&self, order_id: OrderId, ready_at: DateTime<Utc>) -> AutoCompletion {
        let current = match self.store.get_by_id(order_id).await {
            Ok(order) => order,
            Err(StoreError::NotFound(_)) => {
                tracing::warn!(order_id = %order_id, "Ready timer fired for an unknown order");
                return AutoCompletion::Failed;
            }
            Err(err) => {
                tracing::error!(order_id = %order_id, error = %err, "Failed to load order for auto-completion");
                return AutoCompletion::Failed;
            }
        };

        let still_waiting = current.status == OrderStatus::Ready
            && current.ready_at.map(|at| same_instant(at, ready_at)).unwrap_or(false);
        if !still_waiting {
            tracing::debug!(
                order_id = %order_id,
                status = %current.status,
                "Ready timer superseded"
            );
            return AutoCompletion::Superseded;
        }

        match self
            .commit(&current, OrderStatus::Completed, &Actor::System, OwnerExpectation::Any)
            .await
        {
            Ok(order) => {
                tracing::info!(order_id = %order.id, "⏰ Order auto-completed after grace period");
                AutoCompletion::Completed
            }
            Err(CommitRejection::Conflict(latest)) => {
                tracing::debug!(
                    order_id = %order_id,
                    status = %latest.status,
                    "Auto-completion lost the race to a manual transition"
                );
                AutoCompletion::Superseded
            }
            Err(CommitRejection::Rejected(err)) => {
                tracing::error!(order_id = %order_id, error = %err, "❌ Auto-completion failed");
                AutoCompletion::Failed
            }
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
