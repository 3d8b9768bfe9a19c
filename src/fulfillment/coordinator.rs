use chrono::Utc;
use futures_util::TryStreamExt;
use std::sync::Arc;

use crate::actors::ReadyTimeoutScheduler;
use crate::config::FulfillmentConfig;
use crate::domain::order::{
    transition, Actor, CustomerId, FulfillmentError, Order, OrderId, OrderLine, OrderStatus, PaymentStatus, WorkerId,
};
use crate::events::EventPublisher;
use crate::metrics::Metrics;
use crate::store::{OrderStore, OwnerExpectation};
use super::arbiter::ClaimArbiter;
use super::committer::{storage_failure, CommitRejection, TransitionCommitter};

// ============================================================================
// Fulfillment Coordinator - the caller-facing API
// ============================================================================
//
// Each operation is validate -> conditional update -> publish. No lock is
// held across an operation; racing callers are serialized only by the
// store's conditional update, and a lost race is reported as the typed
// rejection the caller would have seen had it arrived second.
//
// ============================================================================

/// Ratings at or below this raise a kitchen alert
pub const LOW_RATING_THRESHOLD: u8 = 2;

pub struct FulfillmentCoordinator {
    committer: Arc<TransitionCommitter>,
    arbiter: ClaimArbiter,
    scheduler: ReadyTimeoutScheduler,
    publisher: EventPublisher,
    metrics: Arc<Metrics>,
    allow_cancel_after_payment: bool,
}

impl FulfillmentCoordinator {
    /// Wire the components and re-arm timers for orders left in `ready`
    pub async fn start(
        config: &FulfillmentConfig,
        store: Arc<dyn OrderStore>,
        publisher: EventPublisher,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        let committer = Arc::new(TransitionCommitter::new(store.clone(), publisher.clone(), metrics.clone()));
        let arbiter = ClaimArbiter::new(committer.clone(), metrics.clone());
        let scheduler = ReadyTimeoutScheduler::spawn(committer.clone(), config.ready_grace_period, metrics.clone());

        let recovered = scheduler.recover(store.as_ref()).await?;

        tracing::info!(
            grace_secs = config.ready_grace_period.as_secs(),
            allow_cancel_after_payment = config.allow_cancel_after_payment,
            recovered_timers = recovered,
            "🚀 Fulfillment coordinator started"
        );

        Ok(Self {
            committer,
            arbiter,
            scheduler,
            publisher,
            metrics,
            allow_cancel_after_payment: config.allow_cancel_after_payment,
        })
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub async fn armed_timers(&self) -> usize {
        self.scheduler.armed_count().await
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        tracing::info!("Fulfillment coordinator stopped");
    }

    fn reject(&self, operation: &str, order_id: Option<OrderId>, err: FulfillmentError) -> FulfillmentError {
        self.metrics.record_rejection(operation, err.reason());
        match &err {
            FulfillmentError::Storage(_) => {
                tracing::error!(operation, order_id = ?order_id, error = %err, "❌ Operation failed");
            }
            _ => {
                tracing::debug!(operation, order_id = ?order_id, error = %err, "Operation rejected");
            }
        }
        err
    }

    /// Explain why a conditional update lost: re-run validation against the
    /// order as it is now
    fn revalidate(latest: &Order, requested: OrderStatus, actor: &Actor) -> FulfillmentError {
        match transition(latest, requested, actor, Utc::now()) {
            Err(err) => err,
            Ok(_) => FulfillmentError::IllegalTransition {
                from: latest.status,
                to: requested,
            },
        }
    }

    /// Repeating a completion is a no-op only for the worker who held the
    /// order or the system
    fn ensure_may_complete(completed: &Order, actor: &Actor) -> Result<(), FulfillmentError> {
        match actor {
            Actor::System => Ok(()),
            Actor::Kitchen(worker) if completed.was_claimed_by(*worker) => Ok(()),
            Actor::Kitchen(_) => Err(FulfillmentError::unauthorized("order was held by another worker")),
            Actor::Customer(_) => Err(FulfillmentError::unauthorized("customers cannot complete orders")),
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    pub async fn place_order(&self, customer: CustomerId, items: Vec<OrderLine>) -> Result<Order, FulfillmentError> {
        let order = Order::place(customer, items, Utc::now()).map_err(|err| self.reject("place_order", None, err))?;
        let order_id = order.id;

        self.committer
            .place(order)
            .await
            .map_err(|err| self.reject("place_order", Some(order_id), err))
    }

    pub async fn claim(&self, order_id: OrderId, worker: WorkerId) -> Result<Order, FulfillmentError> {
        self.arbiter
            .claim(order_id, worker)
            .await
            .map_err(|err| self.reject("claim", Some(order_id), err))
    }

    pub async fn mark_ready(&self, order_id: OrderId, worker: WorkerId) -> Result<Order, FulfillmentError> {
        self.try_mark_ready(order_id, worker)
            .await
            .map_err(|err| self.reject("mark_ready", Some(order_id), err))
    }

    async fn try_mark_ready(&self, order_id: OrderId, worker: WorkerId) -> Result<Order, FulfillmentError> {
        let current = self.committer.load(order_id).await?;
        let actor = Actor::Kitchen(worker);

        let order = match self
            .committer
            .commit(&current, OrderStatus::Ready, &actor, OwnerExpectation::Held(worker))
            .await
        {
            Ok(order) => order,
            Err(CommitRejection::Conflict(latest)) => return Err(Self::revalidate(&latest, OrderStatus::Ready, &actor)),
            Err(CommitRejection::Rejected(err)) => return Err(err),
        };

        match order.ready_at {
            Some(ready_at) => self.scheduler.arm(order.id, ready_at).await,
            None => tracing::error!(order_id = %order.id, "Ready order committed without ready_at"),
        }

        Ok(order)
    }

    /// Complete a ready order. Completing an order that is already
    /// `completed` returns the completed snapshot without a second event.
    pub async fn complete(&self, order_id: OrderId, actor: &Actor) -> Result<Order, FulfillmentError> {
        self.try_complete(order_id, actor)
            .await
            .map_err(|err| self.reject("complete", Some(order_id), err))
    }

    async fn try_complete(&self, order_id: OrderId, actor: &Actor) -> Result<Order, FulfillmentError> {
        if let Actor::Customer(_) = actor {
            return Err(FulfillmentError::unauthorized("customers cannot complete orders"));
        }

        let current = self.committer.load(order_id).await?;
        if current.status == OrderStatus::Completed {
            Self::ensure_may_complete(&current, actor)?;
            tracing::debug!(order_id = %order_id, actor = %actor, "Order already completed");
            return Ok(current);
        }

        let owner = match actor {
            Actor::Kitchen(worker) => OwnerExpectation::Held(*worker),
            _ => OwnerExpectation::Any,
        };

        match self.committer.commit(&current, OrderStatus::Completed, actor, owner).await {
            Ok(order) => {
                self.scheduler.disarm(order.id).await;
                Ok(order)
            }
            Err(CommitRejection::Conflict(latest)) if latest.status == OrderStatus::Completed => {
                Self::ensure_may_complete(&latest, actor)?;
                tracing::info!(
                    order_id = %order_id,
                    completed_by = ?latest.completed_by,
                    "Order was completed concurrently"
                );
                self.scheduler.disarm(order_id).await;
                Ok(*latest)
            }
            Err(CommitRejection::Conflict(latest)) => Err(Self::revalidate(&latest, OrderStatus::Completed, actor)),
            Err(CommitRejection::Rejected(err)) => Err(err),
        }
    }

    pub async fn cancel(&self, order_id: OrderId, customer: CustomerId) -> Result<Order, FulfillmentError> {
        self.try_cancel(order_id, customer)
            .await
            .map_err(|err| self.reject("cancel", Some(order_id), err))
    }

    async fn try_cancel(&self, order_id: OrderId, customer: CustomerId) -> Result<Order, FulfillmentError> {
        let current = self.committer.load(order_id).await?;
        let actor = Actor::Customer(customer);

        let cancellable_but_paid = current.status == OrderStatus::Pending
            && current.customer_id == customer
            && current.payment_status == PaymentStatus::Paid;
        if cancellable_but_paid && !self.allow_cancel_after_payment {
            return Err(FulfillmentError::PaidOrderNotCancellable(order_id));
        }

        match self
            .committer
            .commit(&current, OrderStatus::Cancelled, &actor, OwnerExpectation::Unset)
            .await
        {
            Ok(order) => {
                tracing::info!(order_id = %order_id, customer_id = %customer, "🚫 Order cancelled");
                Ok(order)
            }
            Err(CommitRejection::Conflict(latest)) => Err(Self::revalidate(&latest, OrderStatus::Cancelled, &actor)),
            Err(CommitRejection::Rejected(err)) => Err(err),
        }
    }

    /// Read-only snapshot for the ordering customer, kitchen staff, or the
    /// system
    pub async fn get_order(&self, order_id: OrderId, actor: &Actor) -> Result<Order, FulfillmentError> {
        let order = self
            .committer
            .load(order_id)
            .await
            .map_err(|err| self.reject("get_order", Some(order_id), err))?;

        match actor {
            Actor::Customer(customer) if *customer != order.customer_id => Err(self.reject(
                "get_order",
                Some(order_id),
                FulfillmentError::unauthorized("order belongs to another customer"),
            )),
            _ => Ok(order),
        }
    }

    /// Pending orders, oldest first
    pub async fn kitchen_queue(&self, actor: &Actor) -> Result<Vec<Order>, FulfillmentError> {
        if let Actor::Customer(_) = actor {
            return Err(self.reject(
                "kitchen_queue",
                None,
                FulfillmentError::unauthorized("only kitchen staff can list pending orders"),
            ));
        }

        let mut pending: Vec<Order> = self
            .committer
            .store()
            .scan_by_status(OrderStatus::Pending)
            .await
            .map_err(storage_failure)
            .map_err(|err| self.reject("kitchen_queue", None, err))?
            .try_collect()
            .await
            .map_err(|err| self.reject("kitchen_queue", None, storage_failure(err)))?;

        pending.sort_by_key(|order| order.created_at);
        Ok(pending)
    }

    /// Customer feedback on a completed order; poor ratings alert the kitchen
    pub async fn rate_order(
        &self,
        order_id: OrderId,
        customer: CustomerId,
        rating: u8,
        comment: Option<String>,
    ) -> Result<(), FulfillmentError> {
        self.try_rate_order(order_id, customer, rating, comment)
            .await
            .map_err(|err| self.reject("rate_order", Some(order_id), err))
    }

    async fn try_rate_order(
        &self,
        order_id: OrderId,
        customer: CustomerId,
        rating: u8,
        comment: Option<String>,
    ) -> Result<(), FulfillmentError> {
        if !(1..=5).contains(&rating) {
            return Err(FulfillmentError::InvalidRating(rating));
        }

        let order = self.committer.load(order_id).await?;
        if order.customer_id != customer {
            return Err(FulfillmentError::unauthorized("only the ordering customer can rate an order"));
        }
        if order.status != OrderStatus::Completed {
            return Err(FulfillmentError::IllegalTransition {
                from: order.status,
                to: OrderStatus::Completed,
            });
        }

        tracing::info!(order_id = %order_id, rating, "Order rated");
        if rating <= LOW_RATING_THRESHOLD {
            tracing::warn!(order_id = %order_id, rating, "⚠️ Low rating, alerting kitchen");
            self.publisher.publish_low_rating_alert(&order, rating, comment).await;
        }
        Ok(())
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{CompletedBy, EventKind};
    use crate::store::{InMemoryOrderStore, PaymentStatusWriter};
    use std::time::Duration;
    use uuid::Uuid;

    const GRACE: Duration = Duration::from_secs(180);

    struct Harness {
        coordinator: FulfillmentCoordinator,
        store: Arc<InMemoryOrderStore>,
        metrics: Arc<Metrics>,
    }

    async fn harness_with(config: FulfillmentConfig) -> Harness {
        let metrics = Arc::new(Metrics::new().unwrap());
        let store = Arc::new(InMemoryOrderStore::new());
        let publisher = EventPublisher::new(config.subscriber_buffer, metrics.clone());
        let coordinator = FulfillmentCoordinator::start(&config, store.clone(), publisher, metrics.clone())
            .await
            .unwrap();
        Harness {
            coordinator,
            store,
            metrics,
        }
    }

    async fn harness() -> Harness {
        harness_with(FulfillmentConfig {
            ready_grace_period: GRACE,
            ..FulfillmentConfig::default()
        })
        .await
    }

    fn item_a_times_two() -> Vec<OrderLine> {
        vec![OrderLine::new(Uuid::new_v4(), 2, 1250)]
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn kinds(notifications: Vec<crate::events::OrderNotification>) -> Vec<EventKind> {
        notifications.into_iter().map(|n| n.event_data.kind).collect()
    }

    #[tokio::test]
    async fn test_happy_path() {
        let h = harness().await;
        let alice = CustomerId::new();
        let bob = WorkerId::new();
        let mut alice_feed = h.coordinator.publisher().subscribe_customer(alice).await;
        let mut kitchen_feed = h.coordinator.publisher().subscribe_kitchen().await;

        let order = h.coordinator.place_order(alice, item_a_times_two()).await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.total_price_cents, 2500);

        let cooking = h.coordinator.claim(order.id, bob).await.unwrap();
        assert_eq!(cooking.status, OrderStatus::Cooking);
        assert_eq!(cooking.owner, Some(bob));

        let ready = h.coordinator.mark_ready(order.id, bob).await.unwrap();
        assert_eq!(ready.status, OrderStatus::Ready);
        assert!(ready.ready_at.is_some());
        assert_eq!(h.coordinator.armed_timers().await, 1);

        let completed = h.coordinator.complete(order.id, &Actor::Kitchen(bob)).await.unwrap();
        assert_eq!(completed.status, OrderStatus::Completed);
        assert_eq!(completed.owner, None);
        assert_eq!(completed.completed_by, Some(CompletedBy::Worker(bob)));
        assert_eq!(h.coordinator.armed_timers().await, 0);

        assert_eq!(
            kinds(alice_feed.drain()),
            vec![EventKind::OrderClaimed, EventKind::OrderReady, EventKind::OrderCompleted]
        );
        assert_eq!(
            kinds(kitchen_feed.drain()),
            vec![EventKind::OrderPlaced, EventKind::OrderClaimed]
        );
    }

    #[tokio::test]
    async fn test_place_order_rejects_empty_items() {
        let h = harness().await;
        let err = h.coordinator.place_order(CustomerId::new(), vec![]).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::EmptyItems));
        assert!(h.store.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_claim_race_names_the_winner() {
        let h = Arc::new(harness().await);
        let order_id = h.coordinator.place_order(CustomerId::new(), item_a_times_two()).await.unwrap().id;
        let (bob, carol) = (WorkerId::new(), WorkerId::new());

        let (first, second) = tokio::join!(
            {
                let h = h.clone();
                async move { h.coordinator.claim(order_id, bob).await }
            },
            {
                let h = h.clone();
                async move { h.coordinator.claim(order_id, carol).await }
            }
        );

        let (winner, loser_err) = match (first, second) {
            (Ok(won), Err(err)) | (Err(err), Ok(won)) => (won, err),
            other => panic!("expected exactly one winner, got {other:?}"),
        };
        match loser_err {
            FulfillmentError::AlreadyClaimed { owner, .. } => assert_eq!(Some(owner), winner.owner),
            other => panic!("unexpected rejection: {other}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_racing_claims_lets_exactly_one_mutation_win() {
        let h = Arc::new(harness().await);
        let alice = CustomerId::new();
        let order_id = h.coordinator.place_order(alice, item_a_times_two()).await.unwrap().id;

        let cancel = {
            let h = h.clone();
            tokio::spawn(async move { h.coordinator.cancel(order_id, alice).await })
        };
        let claims: Vec<_> = (0..8)
            .map(|_| {
                let h = h.clone();
                tokio::spawn(async move { h.coordinator.claim(order_id, WorkerId::new()).await })
            })
            .collect();

        let cancel = cancel.await.unwrap();
        let mut claim_results = Vec::new();
        for claim in claims {
            claim_results.push(claim.await.unwrap());
        }

        let claim_wins = claim_results.iter().filter(|result| result.is_ok()).count();
        assert_eq!(claim_wins + usize::from(cancel.is_ok()), 1);

        for result in &claim_results {
            match result {
                Ok(_) => {}
                Err(FulfillmentError::AlreadyClaimed { .. }) | Err(FulfillmentError::NotClaimable { .. }) => {}
                Err(other) => panic!("unexpected claim rejection: {other}"),
            }
        }

        let stored = h.store.get_by_id(order_id).await.unwrap();
        assert!(stored.invariants_hold());
        match cancel {
            Ok(_) => {
                assert_eq!(stored.status, OrderStatus::Cancelled);
                assert!(claim_results
                    .iter()
                    .all(|result| matches!(result, Err(FulfillmentError::NotClaimable { .. }))));
            }
            Err(err) => {
                assert!(matches!(
                    err,
                    FulfillmentError::IllegalTransition {
                        from: OrderStatus::Cooking,
                        to: OrderStatus::Cancelled
                    }
                ));
                assert_eq!(stored.status, OrderStatus::Cooking);
            }
        }
    }

    #[tokio::test]
    async fn test_cancellation_window() {
        let h = harness().await;
        let alice = CustomerId::new();

        let first = h.coordinator.place_order(alice, item_a_times_two()).await.unwrap();
        let cancelled = h.coordinator.cancel(first.id, alice).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);

        let second = h.coordinator.place_order(alice, item_a_times_two()).await.unwrap();
        h.coordinator.claim(second.id, WorkerId::new()).await.unwrap();
        let err = h.coordinator.cancel(second.id, alice).await.unwrap_err();
        assert!(matches!(
            err,
            FulfillmentError::IllegalTransition {
                from: OrderStatus::Cooking,
                to: OrderStatus::Cancelled
            }
        ));
    }

    #[tokio::test]
    async fn test_only_the_ordering_customer_can_cancel() {
        let h = harness().await;
        let order = h.coordinator.place_order(CustomerId::new(), item_a_times_two()).await.unwrap();

        let err = h.coordinator.cancel(order.id, CustomerId::new()).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::Unauthorized(_)));
        assert_eq!(h.store.get_by_id(order.id).await.unwrap().status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_paid_order_cancellation_follows_policy() {
        let lenient = harness().await;
        let alice = CustomerId::new();
        let order = lenient.coordinator.place_order(alice, item_a_times_two()).await.unwrap();
        lenient.store.record_payment(order.id, PaymentStatus::Paid).await.unwrap();
        assert!(lenient.coordinator.cancel(order.id, alice).await.is_ok());

        let strict = harness_with(FulfillmentConfig {
            allow_cancel_after_payment: false,
            ..FulfillmentConfig::default()
        })
        .await;
        let order = strict.coordinator.place_order(alice, item_a_times_two()).await.unwrap();
        strict.store.record_payment(order.id, PaymentStatus::Paid).await.unwrap();
        let err = strict.coordinator.cancel(order.id, alice).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::PaidOrderNotCancellable(id) if id == order.id));
    }

    #[tokio::test]
    async fn test_mark_ready_requires_the_owner() {
        let h = harness().await;
        let order = h.coordinator.place_order(CustomerId::new(), item_a_times_two()).await.unwrap();
        h.coordinator.claim(order.id, WorkerId::new()).await.unwrap();

        let err = h.coordinator.mark_ready(order.id, WorkerId::new()).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::Unauthorized(_)));
        assert_eq!(h.coordinator.armed_timers().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_complete_after_grace_period() {
        let h = harness().await;
        let alice = CustomerId::new();
        let bob = WorkerId::new();
        let mut alice_feed = h.coordinator.publisher().subscribe_customer(alice).await;

        let order = h.coordinator.place_order(alice, item_a_times_two()).await.unwrap();
        h.coordinator.claim(order.id, bob).await.unwrap();
        h.coordinator.mark_ready(order.id, bob).await.unwrap();

        tokio::time::advance(GRACE - Duration::from_secs(1)).await;
        settle().await;
        let snapshot = h.coordinator.get_order(order.id, &Actor::Customer(alice)).await.unwrap();
        assert_eq!(snapshot.status, OrderStatus::Ready);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;

        let snapshot = h.coordinator.get_order(order.id, &Actor::Customer(alice)).await.unwrap();
        assert_eq!(snapshot.status, OrderStatus::Completed);
        assert_eq!(snapshot.completed_by, Some(CompletedBy::System));
        assert_eq!(snapshot.owner, None);
        assert_eq!(
            kinds(alice_feed.drain()),
            vec![EventKind::OrderClaimed, EventKind::OrderReady, EventKind::OrderCompleted]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_complete_after_timer_is_idempotent() {
        let h = harness().await;
        let alice = CustomerId::new();
        let bob = WorkerId::new();
        let mut alice_feed = h.coordinator.publisher().subscribe_customer(alice).await;

        let order = h.coordinator.place_order(alice, item_a_times_two()).await.unwrap();
        h.coordinator.claim(order.id, bob).await.unwrap();
        h.coordinator.mark_ready(order.id, bob).await.unwrap();

        tokio::time::advance(GRACE + Duration::from_secs(1)).await;
        settle().await;

        let completed = h.coordinator.complete(order.id, &Actor::Kitchen(bob)).await.unwrap();
        assert_eq!(completed.status, OrderStatus::Completed);
        assert_eq!(completed.completed_by, Some(CompletedBy::System));

        let completions = kinds(alice_feed.drain())
            .into_iter()
            .filter(|kind| *kind == EventKind::OrderCompleted)
            .count();
        assert_eq!(completions, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_manual_and_system_completion_race_applies_once() {
        let h = Arc::new(harness().await);
        let alice = CustomerId::new();
        let bob = WorkerId::new();
        let mut alice_feed = h.coordinator.publisher().subscribe_customer(alice).await;

        let order_id = h.coordinator.place_order(alice, item_a_times_two()).await.unwrap().id;
        h.coordinator.claim(order_id, bob).await.unwrap();
        h.coordinator.mark_ready(order_id, bob).await.unwrap();

        let (manual, system) = tokio::join!(
            {
                let h = h.clone();
                async move { h.coordinator.complete(order_id, &Actor::Kitchen(bob)).await }
            },
            {
                let h = h.clone();
                async move { h.coordinator.complete(order_id, &Actor::System).await }
            }
        );

        assert_eq!(manual.unwrap().status, OrderStatus::Completed);
        assert_eq!(system.unwrap().status, OrderStatus::Completed);

        let completions = kinds(alice_feed.drain())
            .into_iter()
            .filter(|kind| *kind == EventKind::OrderCompleted)
            .count();
        assert_eq!(completions, 1);
        assert!(h.store.get_by_id(order_id).await.unwrap().invariants_hold());
    }

    #[tokio::test]
    async fn test_owner_invariant_holds_through_lifecycle() {
        let h = harness().await;
        let alice = CustomerId::new();
        let bob = WorkerId::new();
        let order = h.coordinator.place_order(alice, item_a_times_two()).await.unwrap();
        assert!(order.invariants_hold());

        h.coordinator.claim(order.id, bob).await.unwrap();
        assert!(h.store.get_by_id(order.id).await.unwrap().invariants_hold());

        assert!(h.coordinator.claim(order.id, WorkerId::new()).await.is_err());
        assert!(h.store.get_by_id(order.id).await.unwrap().invariants_hold());

        h.coordinator.mark_ready(order.id, bob).await.unwrap();
        assert!(h.store.get_by_id(order.id).await.unwrap().invariants_hold());

        assert!(h.coordinator.cancel(order.id, alice).await.is_err());
        assert!(h.store.get_by_id(order.id).await.unwrap().invariants_hold());

        h.coordinator.complete(order.id, &Actor::Kitchen(bob)).await.unwrap();
        let completed = h.store.get_by_id(order.id).await.unwrap();
        assert!(completed.invariants_hold());
        assert_eq!(completed.owner, None);
    }

    #[tokio::test]
    async fn test_get_order_authorization() {
        let h = harness().await;
        let alice = CustomerId::new();
        let order = h.coordinator.place_order(alice, item_a_times_two()).await.unwrap();

        assert!(h.coordinator.get_order(order.id, &Actor::Customer(alice)).await.is_ok());
        assert!(h.coordinator.get_order(order.id, &Actor::Kitchen(WorkerId::new())).await.is_ok());
        assert!(h.coordinator.get_order(order.id, &Actor::System).await.is_ok());

        let err = h
            .coordinator
            .get_order(order.id, &Actor::Customer(CustomerId::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, FulfillmentError::Unauthorized(_)));

        let err = h.coordinator.get_order(OrderId::new(), &Actor::System).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_kitchen_queue_lists_pending_orders() {
        let h = harness().await;
        let alice = CustomerId::new();
        let first = h.coordinator.place_order(alice, item_a_times_two()).await.unwrap();
        let second = h.coordinator.place_order(alice, item_a_times_two()).await.unwrap();
        let third = h.coordinator.place_order(alice, item_a_times_two()).await.unwrap();
        h.coordinator.claim(second.id, WorkerId::new()).await.unwrap();

        let queue = h.coordinator.kitchen_queue(&Actor::Kitchen(WorkerId::new())).await.unwrap();
        let ids: Vec<OrderId> = queue.iter().map(|order| order.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&first.id) && ids.contains(&third.id));

        let err = h.coordinator.kitchen_queue(&Actor::Customer(alice)).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_repeat_completion_only_for_the_holder_or_system() {
        let h = harness().await;
        let (bob, stranger) = (WorkerId::new(), WorkerId::new());
        let order = h.coordinator.place_order(CustomerId::new(), item_a_times_two()).await.unwrap();
        h.coordinator.claim(order.id, bob).await.unwrap();
        h.coordinator.mark_ready(order.id, bob).await.unwrap();
        h.coordinator.complete(order.id, &Actor::Kitchen(bob)).await.unwrap();

        let err = h.coordinator.complete(order.id, &Actor::Kitchen(stranger)).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::Unauthorized(_)));

        let again = h.coordinator.complete(order.id, &Actor::Kitchen(bob)).await.unwrap();
        assert_eq!(again.completed_by, Some(CompletedBy::Worker(bob)));
        assert_eq!(again.claimed_by, Some(bob));
        assert!(h.coordinator.complete(order.id, &Actor::System).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_holder_cannot_complete_an_auto_completed_order() {
        let h = harness().await;
        let (bob, stranger) = (WorkerId::new(), WorkerId::new());
        let order = h.coordinator.place_order(CustomerId::new(), item_a_times_two()).await.unwrap();
        h.coordinator.claim(order.id, bob).await.unwrap();
        h.coordinator.mark_ready(order.id, bob).await.unwrap();

        tokio::time::advance(GRACE + Duration::from_secs(1)).await;
        settle().await;

        let err = h.coordinator.complete(order.id, &Actor::Kitchen(stranger)).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::Unauthorized(_)));
        let own = h.coordinator.complete(order.id, &Actor::Kitchen(bob)).await.unwrap();
        assert_eq!(own.completed_by, Some(CompletedBy::System));
    }

    /// Applies every conditional update at once but acknowledges it late
    struct SlowAckStore {
        inner: InMemoryOrderStore,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl OrderStore for SlowAckStore {
        async fn insert(&self, order: &Order) -> Result<(), crate::store::StoreError> {
            self.inner.insert(order).await
        }

        async fn get_by_id(&self, id: OrderId) -> Result<Order, crate::store::StoreError> {
            self.inner.get_by_id(id).await
        }

        async fn conditional_update(
            &self,
            id: OrderId,
            expected: crate::store::Expected,
            patch: &crate::store::OrderPatch,
        ) -> Result<Order, crate::store::StoreError> {
            let result = self.inner.conditional_update(id, expected, patch).await;
            tokio::time::sleep(self.delay).await;
            result
        }

        async fn scan_by_status(
            &self,
            status: OrderStatus,
        ) -> Result<
            futures_util::stream::BoxStream<'static, Result<Order, crate::store::StoreError>>,
            crate::store::StoreError,
        > {
            self.inner.scan_by_status(status).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_claim_still_publishes_its_event() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let store = Arc::new(SlowAckStore {
            inner: InMemoryOrderStore::new(),
            delay: Duration::from_millis(200),
        });
        let config = FulfillmentConfig {
            ready_grace_period: GRACE,
            ..FulfillmentConfig::default()
        };
        let publisher = EventPublisher::new(16, metrics.clone());
        let coordinator = FulfillmentCoordinator::start(&config, store.clone(), publisher.clone(), metrics)
            .await
            .unwrap();
        let alice = CustomerId::new();
        let bob = WorkerId::new();
        let mut alice_feed = publisher.subscribe_customer(alice).await;

        let order = coordinator.place_order(alice, item_a_times_two()).await.unwrap();

        // The caller gives up after the write is applied but before it is acknowledged
        let abandoned = tokio::time::timeout(Duration::from_millis(20), coordinator.claim(order.id, bob)).await;
        assert!(abandoned.is_err());
        assert_eq!(store.get_by_id(order.id).await.unwrap().status, OrderStatus::Cooking);

        coordinator.mark_ready(order.id, bob).await.unwrap();
        coordinator.complete(order.id, &Actor::Kitchen(bob)).await.unwrap();
        settle().await;

        assert_eq!(
            kinds(alice_feed.drain()),
            vec![EventKind::OrderClaimed, EventKind::OrderReady, EventKind::OrderCompleted]
        );
        assert_eq!(publisher.tracked_streams().await, 0);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_customer_cannot_complete() {
        let h = harness().await;
        let alice = CustomerId::new();
        let order = h.coordinator.place_order(alice, item_a_times_two()).await.unwrap();

        let err = h.coordinator.complete(order.id, &Actor::Customer(alice)).await.unwrap_err();
        assert!(matches!(err, FulfillmentError::Unauthorized(_)));
        assert_eq!(h.metrics.order_rejections.with_label_values(&["complete", "unauthorized"]).get(), 1);
    }

    #[tokio::test]
    async fn test_low_rating_alerts_kitchen() {
        let h = harness().await;
        let alice = CustomerId::new();
        let bob = WorkerId::new();
        let mut kitchen_feed = h.coordinator.publisher().subscribe_kitchen().await;

        let order = h.coordinator.place_order(alice, item_a_times_two()).await.unwrap();
        assert!(matches!(
            h.coordinator.rate_order(order.id, alice, 1, None).await,
            Err(FulfillmentError::IllegalTransition { .. })
        ));

        h.coordinator.claim(order.id, bob).await.unwrap();
        h.coordinator.mark_ready(order.id, bob).await.unwrap();
        h.coordinator.complete(order.id, &Actor::Kitchen(bob)).await.unwrap();
        kitchen_feed.drain();

        h.coordinator.rate_order(order.id, alice, 5, None).await.unwrap();
        assert!(kitchen_feed.try_recv().is_none());

        h.coordinator
            .rate_order(order.id, alice, 2, Some("burnt".to_string()))
            .await
            .unwrap();
        assert_eq!(kitchen_feed.try_recv().unwrap().event_data.kind, EventKind::LowRatingAlert);

        assert!(matches!(
            h.coordinator.rate_order(order.id, alice, 9, None).await,
            Err(FulfillmentError::InvalidRating(9))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_recovers_overdue_ready_orders() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let store = Arc::new(InMemoryOrderStore::new());
        let config = FulfillmentConfig {
            ready_grace_period: GRACE,
            ..FulfillmentConfig::default()
        };
        let bob = WorkerId::new();

        let first = FulfillmentCoordinator::start(
            &config,
            store.clone(),
            EventPublisher::new(16, metrics.clone()),
            metrics.clone(),
        )
        .await
        .unwrap();
        let order = first.place_order(CustomerId::new(), item_a_times_two()).await.unwrap();
        first.claim(order.id, bob).await.unwrap();
        first.mark_ready(order.id, bob).await.unwrap();
        first.shutdown().await;

        // Down for longer than the grace period
        tokio::time::advance(GRACE * 2).await;
        settle().await;
        assert_eq!(store.get_by_id(order.id).await.unwrap().status, OrderStatus::Ready);

        let mut overdue = store.get_by_id(order.id).await.unwrap();
        overdue.ready_at = Some(Utc::now() - chrono::Duration::seconds(GRACE.as_secs() as i64 * 2));
        store
            .conditional_update(
                order.id,
                crate::store::Expected::new(OrderStatus::Ready, OwnerExpectation::Any),
                &crate::store::OrderPatch::from_order(&overdue),
            )
            .await
            .unwrap();

        let second = FulfillmentCoordinator::start(
            &config,
            store.clone(),
            EventPublisher::new(16, metrics.clone()),
            metrics,
        )
        .await
        .unwrap();
        settle().await;

        let stored = store.get_by_id(order.id).await.unwrap();
        assert_eq!(stored.status, OrderStatus::Completed);
        assert_eq!(stored.completed_by, Some(CompletedBy::System));
        second.shutdown().await;
    }
}
