use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::domain::order::{CustomerId, EventKind, Order, OrderEvent, OrderId, RecipientScope};
use crate::metrics::Metrics;
use super::envelope::{DomainEvent, EventEnvelope};

// ============================================================================
// Event Publisher - fans committed transitions out to subscribers
// ============================================================================
//
// Delivery is best-effort and never feeds back into the state change that
// produced the event. Per order, subscribers see events in commit order
// (`sequence_number`); across orders there is no ordering.
//
// ============================================================================

pub type OrderNotification = EventEnvelope<OrderEvent>;

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Events queued per external sink while it is slow or retrying
pub const DEFAULT_SINK_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Receiving end of a customer or kitchen channel
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub scope: RecipientScope,
    receiver: mpsc::Receiver<OrderNotification>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<OrderNotification> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<OrderNotification> {
        self.receiver.try_recv().ok()
    }

    /// Everything currently queued, without waiting
    pub fn drain(&mut self) -> Vec<OrderNotification> {
        let mut out = Vec::new();
        while let Ok(notification) = self.receiver.try_recv() {
            out.push(notification);
        }
        out
    }
}

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<OrderNotification>,
}

// ============================================================================
// Per-order sequencer
// ============================================================================

struct Cursor {
    next: i64,
    held: BTreeMap<i64, OrderNotification>,
}

#[derive(Debug, PartialEq)]
enum Admission {
    /// Deliver these, in order
    Deliver(Vec<OrderNotification>),
    /// Ahead of a gap; waiting for earlier sequences
    Held,
    /// Already past this sequence
    Stale,
}

#[derive(Default)]
struct Sequencer {
    cursors: HashMap<Uuid, Cursor>,
}

impl Sequencer {
    fn begin(&mut self, aggregate_id: Uuid, first_sequence: i64) {
        self.cursors.entry(aggregate_id).or_insert(Cursor {
            next: first_sequence,
            held: BTreeMap::new(),
        });
    }

    fn forget(&mut self, aggregate_id: Uuid) {
        self.cursors.remove(&aggregate_id);
    }

    fn admit(&mut self, notification: OrderNotification) -> Admission {
        let aggregate_id = notification.aggregate_id;
        let sequence = notification.sequence_number;

        // First sighting (e.g. an order placed before a restart)
        let cursor = self.cursors.entry(aggregate_id).or_insert(Cursor {
            next: sequence,
            held: BTreeMap::new(),
        });

        if sequence < cursor.next {
            return Admission::Stale;
        }
        if sequence > cursor.next {
            cursor.held.insert(sequence, notification);
            return Admission::Held;
        }

        let mut ready = vec![notification];
        cursor.next += 1;
        while let Some(held) = cursor.held.remove(&cursor.next) {
            ready.push(held);
            cursor.next += 1;
        }

        let finished = cursor.held.is_empty()
            && ready.last().map(|n| n.event_data.kind.is_terminal()).unwrap_or(false);
        if finished {
            self.cursors.remove(&aggregate_id);
        }

        Admission::Deliver(ready)
    }

    fn tracked(&self) -> usize {
        self.cursors.len()
    }
}

// ============================================================================
// Publisher
// ============================================================================

#[derive(Default)]
struct Registry {
    customers: HashMap<CustomerId, Vec<Subscriber>>,
    kitchen: Vec<Subscriber>,
    sequencer: Sequencer,
}

struct Inner {
    registry: Mutex<Registry>,
    buffer: usize,
    next_id: AtomicU64,
    sinks: Vec<mpsc::Sender<OrderNotification>>,
    metrics: Arc<Metrics>,
}

#[derive(Clone)]
pub struct EventPublisher {
    inner: Arc<Inner>,
}

impl EventPublisher {
    pub fn new(buffer: usize, metrics: Arc<Metrics>) -> Self {
        Self::with_sinks(buffer, metrics, Vec::new())
    }

    /// `sinks` receive every delivered notification in delivery order; a
    /// sink whose queue is full misses the event
    pub fn with_sinks(
        buffer: usize,
        metrics: Arc<Metrics>,
        sinks: Vec<mpsc::Sender<OrderNotification>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                buffer: buffer.max(1),
                next_id: AtomicU64::new(1),
                sinks,
                metrics,
            }),
        }
    }

    pub async fn subscribe_customer(&self, customer_id: CustomerId) -> Subscription {
        let (subscriber, subscription) = self.channel(RecipientScope::Customer(customer_id));
        let mut registry = self.inner.registry.lock().await;
        registry.customers.entry(customer_id).or_default().push(subscriber);

        tracing::debug!(customer_id = %customer_id, subscriber = subscription.id.0, "Customer subscribed");
        subscription
    }

    pub async fn subscribe_kitchen(&self) -> Subscription {
        let (subscriber, subscription) = self.channel(RecipientScope::KitchenStaff);
        let mut registry = self.inner.registry.lock().await;
        registry.kitchen.push(subscriber);

        tracing::debug!(subscriber = subscription.id.0, "Kitchen staff subscribed");
        subscription
    }

    fn channel(&self, scope: RecipientScope) -> (Subscriber, Subscription) {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, receiver) = mpsc::channel(self.inner.buffer);
        (Subscriber { id, tx }, Subscription { id, scope, receiver })
    }

    /// Start ordering an order's stream at `first_sequence`, before the
    /// first commit can race its own publication.
    pub async fn begin_stream(&self, order_id: OrderId, first_sequence: i64) {
        let mut registry = self.inner.registry.lock().await;
        registry.sequencer.begin(order_id.as_uuid(), first_sequence);
    }

    pub async fn end_stream(&self, order_id: OrderId) {
        let mut registry = self.inner.registry.lock().await;
        registry.sequencer.forget(order_id.as_uuid());
    }

    /// Publish the event for a just-committed order state
    pub async fn publish_transition(&self, order: &Order) {
        let event = OrderEvent::from_order(order);
        let notification = EventEnvelope::new(
            order.id.as_uuid(),
            order.version,
            OrderEvent::event_type(),
            event,
        );
        self.publish(notification).await;
    }

    /// Publish an already-built lifecycle notification
    pub async fn publish(&self, notification: OrderNotification) {
        let mut registry = self.inner.registry.lock().await;

        match registry.sequencer.admit(notification) {
            Admission::Deliver(ready) => {
                for notification in ready {
                    self.deliver(&mut registry, notification);
                }
            }
            Admission::Held => {
                tracing::debug!("Holding event until earlier events for the order arrive");
            }
            Admission::Stale => {
                self.inner.metrics.record_event_dropped("stale");
                tracing::warn!("Dropping stale event: a later event for the order was already delivered");
            }
        }
    }

    /// Alerts sit outside the order lifecycle, so they skip sequencing.
    pub async fn publish_low_rating_alert(&self, order: &Order, rating: u8, comment: Option<String>) {
        let event = OrderEvent::low_rating(order, rating, comment);
        let notification = EventEnvelope::new(
            order.id.as_uuid(),
            order.version,
            OrderEvent::event_type(),
            event,
        );

        let mut registry = self.inner.registry.lock().await;
        self.deliver(&mut registry, notification);
    }

    fn deliver(&self, registry: &mut Registry, notification: OrderNotification) {
        let kind = notification.event_data.kind;
        let mut delivered = 0usize;

        for scope in notification.event_data.recipients() {
            let subscribers = match scope {
                RecipientScope::Customer(customer_id) => registry.customers.get_mut(&customer_id),
                RecipientScope::KitchenStaff => Some(&mut registry.kitchen),
            };
            if let Some(subscribers) = subscribers {
                delivered += self.push(subscribers, &notification);
            }
        }
        registry.customers.retain(|_, subscribers| !subscribers.is_empty());

        for sink in &self.inner.sinks {
            match sink.try_send(notification.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.inner.metrics.record_event_dropped("sink_full");
                    tracing::warn!(
                        order_id = %notification.aggregate_id,
                        sequence = notification.sequence_number,
                        "Sink queue full, dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    self.inner.metrics.record_event_dropped("sink_closed");
                }
            }
        }

        self.inner.metrics.record_event_published(kind.as_str());
        tracing::debug!(
            order_id = %notification.aggregate_id,
            kind = kind.as_str(),
            sequence = notification.sequence_number,
            delivered,
            "Published order event"
        );
    }

    fn push(&self, subscribers: &mut Vec<Subscriber>, notification: &OrderNotification) -> usize {
        let mut delivered = 0;
        subscribers.retain(|subscriber| match subscriber.tx.try_send(notification.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                self.inner.metrics.record_event_dropped("subscriber_full");
                tracing::warn!(subscriber = subscriber.id.0, "Subscriber queue full, dropping push");
                true
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(subscriber = subscriber.id.0, "Subscriber disconnected, pruning");
                false
            }
        });
        delivered
    }

    pub async fn subscriber_count(&self) -> usize {
        let registry = self.inner.registry.lock().await;
        registry.kitchen.len() + registry.customers.values().map(Vec::len).sum::<usize>()
    }

    pub async fn tracked_streams(&self) -> usize {
        self.inner.registry.lock().await.sequencer.tracked()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
