// ============================================================================
// Fulfillment - validation, atomic commit and publication of transitions
// ============================================================================
//
// - committer   - transition -> conditional update -> publish
// - arbiter     - race-safe claims (pending -> cooking)
// - coordinator - the caller-facing operations
//
// ============================================================================

mod arbiter;
mod committer;
mod coordinator;

pub use arbiter::ClaimArbiter;
pub use committer::{AutoCompletion, CommitRejection, TransitionCommitter};
pub use coordinator::{FulfillmentCoordinator, LOW_RATING_THRESHOLD};
