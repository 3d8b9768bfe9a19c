// ============================================================================
// Actors Module
// ============================================================================
//
// Actor-based infrastructure for timer bookkeeping.
//
// - ready_timeout - one kameo actor owning every armed ready timer
//
// Note: Order rules stay in domain::order and fulfillment. Actors only own
//       state that must be mutated from many tasks (the timer set).
//
// ============================================================================

mod ready_timeout;

pub use ready_timeout::{ReadyTimeoutActor, ReadyTimeoutScheduler};
