mod redpanda;
mod sink;

pub use redpanda::{RedpandaClient, RedpandaSink};
pub use sink::{join_forwarders, spawn_sink_forwarder, EventSink};
