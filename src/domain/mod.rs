// ============================================================================
// Domain Layer
// ============================================================================
//
// Business rules only. Storage, timers and delivery live in `store`,
// `actors` and `events`.
//
// ============================================================================

pub mod order;
