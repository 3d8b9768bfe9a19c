// ============================================================================
// Event Delivery
// ============================================================================
//
// Envelope + publisher. Subscribers are per-customer channels and one
// shared kitchen-staff channel; connection lifecycle belongs to whoever
// holds the `Subscription`.
//
// ============================================================================

mod envelope;
mod publisher;

pub use envelope::{DomainEvent, EventEnvelope, serialize_event};
pub use publisher::{
    EventPublisher, OrderNotification, Subscription, SubscriberId, DEFAULT_SINK_BUFFER, DEFAULT_SUBSCRIBER_BUFFER,
};
