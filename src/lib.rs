// ============================================================================
// Kitchen Fulfillment
// ============================================================================
//
// Coordinates restaurant orders from placement through claim, preparation
// and completion:
//
// - domain::order - order record, state machine, events, rejections
// - store         - order store with conditional updates (memory, ScyllaDB)
// - fulfillment   - committer, claim arbiter, coordinator facade
// - actors        - ready-timeout scheduler (kameo)
// - events        - per-customer / kitchen fan-out with per-order ordering
// - messaging     - external event sinks (Redpanda)
// - metrics       - prometheus registry and HTTP endpoint
//
// ============================================================================

pub mod actors;
pub mod config;
pub mod domain;
pub mod events;
pub mod fulfillment;
pub mod messaging;
pub mod metrics;
pub mod store;
pub mod utils;

pub use config::FulfillmentConfig;
pub use fulfillment::FulfillmentCoordinator;
