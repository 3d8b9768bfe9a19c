// ============================================================================
// Order Domain - Fulfillment Rules for Orders
// ============================================================================
//
// - Value objects (ids, OrderStatus, PaymentStatus, OrderLine, Actor)
// - Order record
// - State machine (legal edges + actor authority)
// - Events pushed to subscribers
// - Errors (FulfillmentError)
//
// Nothing in here touches storage or the network.
//
// ============================================================================

pub mod value_objects;
pub mod aggregate;
pub mod state_machine;
pub mod events;
pub mod errors;

// Re-export for convenience
pub use value_objects::*;
pub use aggregate::*;
pub use state_machine::{transition, is_legal, LEGAL_EDGES};
pub use events::*;
pub use errors::*;
