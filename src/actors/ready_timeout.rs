use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use kameo::error::Infallible;
use kameo::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::domain::order::{OrderId, OrderStatus};
use crate::fulfillment::TransitionCommitter;
use crate::metrics::Metrics;
use crate::store::{OrderStore, StoreError};

// ============================================================================
// Ready-Timeout Scheduler Actor
// ============================================================================
//
// Keeps one timer per order in `ready`, keyed by (order id, ready_at).
// When a timer elapses the actor hands the order to the committer's system
// completion, which races manual completion on the same conditional update.
//
// The timer set is derived state: `recover` rebuilds it from the store's
// `ready_at` column after a restart.
//
// ============================================================================

struct ArmedTimer {
    ready_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

pub struct ReadyTimeoutActor {
    committer: Arc<TransitionCommitter>,
    metrics: Arc<Metrics>,
    grace: Duration,
    timers: HashMap<OrderId, ArmedTimer>,
    myself: Option<WeakActorRef<Self>>,
}

impl ReadyTimeoutActor {
    pub fn new(committer: Arc<TransitionCommitter>, grace: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            committer,
            metrics,
            grace,
            timers: HashMap::new(),
            myself: None,
        }
    }

    /// Time left until `ready_at + grace`, zero when already past due
    fn remaining(&self, ready_at: DateTime<Utc>) -> Duration {
        let elapsed = (Utc::now() - ready_at).to_std().unwrap_or(Duration::ZERO);
        self.grace.saturating_sub(elapsed)
    }

    fn clear(&mut self, order_id: OrderId) -> bool {
        let removed = match self.timers.remove(&order_id) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        };
        self.metrics.set_armed_timers(self.timers.len());
        removed
    }
}

impl Actor for ReadyTimeoutActor {
    type Args = Self;
    type Error = Infallible;

    async fn on_start(mut state: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        tracing::info!(grace_secs = state.grace.as_secs(), "ReadyTimeoutActor started");
        state.myself = Some(actor_ref.downgrade());
        Ok(state)
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug)]
pub struct Arm {
    pub order_id: OrderId,
    pub ready_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Disarm {
    pub order_id: OrderId,
}

/// Sent by a timer task to its own actor
#[derive(Debug)]
pub struct Fired {
    pub order_id: OrderId,
    pub ready_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ArmedCount;

#[derive(Debug)]
pub struct DisarmAll;

// ============================================================================
// Message Handlers
// ============================================================================

impl Message<Arm> for ReadyTimeoutActor {
    type Reply = ();

    async fn handle(&mut self, msg: Arm, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let Some(myself) = self.myself.clone() else {
            tracing::error!(order_id = %msg.order_id, "Ready timer requested before actor start");
            return;
        };

        // Re-arming replaces the previous timer
        if let Some(previous) = self.timers.remove(&msg.order_id) {
            previous.handle.abort();
        }

        let delay = self.remaining(msg.ready_at);
        let Arm { order_id, ready_at } = msg;

        // Deadline is fixed here, not when the task first runs
        let elapsed = tokio::time::sleep(delay);
        let handle = tokio::spawn(async move {
            elapsed.await;
            if let Some(actor) = myself.upgrade() {
                if let Err(err) = actor.tell(Fired { order_id, ready_at }).await {
                    tracing::warn!(order_id = %order_id, error = ?err, "Ready timer could not reach scheduler");
                }
            }
        });

        self.timers.insert(order_id, ArmedTimer { ready_at, handle });
        self.metrics.set_armed_timers(self.timers.len());

        tracing::debug!(
            order_id = %order_id,
            delay_ms = delay.as_millis() as u64,
            "⏲️ Ready timer armed"
        );
    }
}

impl Message<Disarm> for ReadyTimeoutActor {
    type Reply = bool;

    async fn handle(&mut self, msg: Disarm, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let removed = self.clear(msg.order_id);
        if removed {
            tracing::debug!(order_id = %msg.order_id, "Ready timer disarmed");
        }
        removed
    }
}

impl Message<Fired> for ReadyTimeoutActor {
    type Reply = ();

    async fn handle(&mut self, msg: Fired, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let current = matches!(
            self.timers.get(&msg.order_id),
            Some(timer) if timer.ready_at == msg.ready_at
        );
        if !current {
            tracing::debug!(order_id = %msg.order_id, "Ignoring fire from a replaced timer");
            return;
        }

        // Drop the entry without aborting; the firing task is finishing anyway
        self.timers.remove(&msg.order_id);
        self.metrics.set_armed_timers(self.timers.len());

        tracing::debug!(order_id = %msg.order_id, "Ready grace period elapsed");

        // Keep the mailbox responsive while the store round-trips
        let committer = self.committer.clone();
        tokio::spawn(async move {
            committer.complete_expired(msg.order_id, msg.ready_at).await;
        });
    }
}

impl Message<ArmedCount> for ReadyTimeoutActor {
    type Reply = usize;

    async fn handle(&mut self, _msg: ArmedCount, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.timers.len()
    }
}

impl Message<DisarmAll> for ReadyTimeoutActor {
    type Reply = usize;

    async fn handle(&mut self, _msg: DisarmAll, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let count = self.timers.len();
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
        self.metrics.set_armed_timers(0);
        count
    }
}

// ============================================================================
// Scheduler handle
// ============================================================================

#[derive(Clone)]
pub struct ReadyTimeoutScheduler {
    actor: ActorRef<ReadyTimeoutActor>,
    grace: Duration,
}

impl ReadyTimeoutScheduler {
    pub fn spawn(committer: Arc<TransitionCommitter>, grace: Duration, metrics: Arc<Metrics>) -> Self {
        let actor = ReadyTimeoutActor::spawn(ReadyTimeoutActor::new(committer, grace, metrics));
        Self { actor, grace }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace
    }

    /// Returns once the timer is in place
    pub async fn arm(&self, order_id: OrderId, ready_at: DateTime<Utc>) {
        if let Err(err) = self.actor.ask(Arm { order_id, ready_at }).await {
            tracing::error!(order_id = %order_id, error = ?err, "Failed to arm ready timer");
        }
    }

    /// Returns whether a timer was still armed
    pub async fn disarm(&self, order_id: OrderId) -> bool {
        match self.actor.ask(Disarm { order_id }).await {
            Ok(removed) => removed,
            Err(err) => {
                tracing::error!(order_id = %order_id, error = ?err, "Failed to disarm ready timer");
                false
            }
        }
    }

    pub async fn armed_count(&self) -> usize {
        self.actor.ask(ArmedCount).await.unwrap_or(0)
    }

    /// Re-arm a timer for every order currently in `ready`. Orders already
    /// past their grace period fire immediately.
    pub async fn recover(&self, store: &dyn OrderStore) -> Result<usize, StoreError> {
        let mut ready = store.scan_by_status(OrderStatus::Ready).await?;
        let mut recovered = 0;

        while let Some(order) = ready.try_next().await? {
            match order.ready_at {
                Some(ready_at) => {
                    self.arm(order.id, ready_at).await;
                    recovered += 1;
                }
                None => {
                    tracing::warn!(order_id = %order.id, "Order in ready without ready_at, skipping");
                }
            }
        }

        tracing::info!(recovered, "🔄 Ready timers recovered from store");
        Ok(recovered)
    }

    pub async fn shutdown(&self) {
        let cancelled = self.actor.ask(DisarmAll).await.unwrap_or(0);
        if let Err(err) = self.actor.stop_gracefully().await {
            tracing::warn!(error = ?err, "Ready-timeout scheduler already stopped");
        }
        tracing::info!(cancelled, "Ready-timeout scheduler stopped");
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
