use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use kitchen_fulfillment::config::{FulfillmentConfig, StoreBackend};
use kitchen_fulfillment::domain::order::{Actor, CustomerId, OrderLine, WorkerId};
use kitchen_fulfillment::events::EventPublisher;
use kitchen_fulfillment::fulfillment::FulfillmentCoordinator;
use kitchen_fulfillment::messaging::{join_forwarders, spawn_sink_forwarder, RedpandaClient, RedpandaSink};
use kitchen_fulfillment::metrics::{self, Metrics};
use kitchen_fulfillment::store::{InMemoryOrderStore, OrderStore, ScyllaOrderStore};
use kitchen_fulfillment::utils::RetryConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO level, can be overridden with RUST_LOG env var
    // Example: RUST_LOG=debug cargo run
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,kitchen_fulfillment=debug")),
        )
        .init();

    tracing::info!("🚀 Starting kitchen fulfillment coordinator");

    let config = FulfillmentConfig::from_env()?;
    tracing::info!(?config, "Configuration loaded");

    // === 1. Metrics ===
    let metrics = Arc::new(Metrics::new()?);
    tracing::info!("📊 Metrics registry created with {} metrics", metrics.registry().gather().len());

    if config.metrics_port != 0 {
        let registry = Arc::new(metrics.registry().clone());
        let port = config.metrics_port;
        // actix-web wants its own system; keep it off the tokio runtime
        std::thread::spawn(move || {
            let result = actix_web::rt::System::new().block_on(metrics::start_metrics_server(registry, port));
            if let Err(e) = result {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    }

    // === 2. Order store ===
    let store: Arc<dyn OrderStore> = match config.store {
        StoreBackend::Memory => {
            tracing::info!("Using in-memory order store");
            Arc::new(InMemoryOrderStore::new())
        }
        StoreBackend::Scylla => {
            Arc::new(ScyllaOrderStore::connect(&config.scylla_node, &config.scylla_keyspace).await?)
        }
    };

    // === 3. Event publisher (+ optional Redpanda sink) ===
    let mut sinks = Vec::new();
    let mut forwarders = Vec::new();
    if let Some(brokers) = &config.redpanda_brokers {
        let client = Arc::new(RedpandaClient::new(brokers, metrics.clone())?);
        let sink = Arc::new(RedpandaSink::new(client, config.events_topic.clone()));
        let (tx, handle) = spawn_sink_forwarder(sink, metrics.clone(), RetryConfig::aggressive(), config.sink_buffer);
        sinks.push(tx);
        forwarders.push(handle);
        tracing::info!(brokers = %brokers, topic = %config.events_topic, "Forwarding order events to Redpanda");
    }
    let publisher = EventPublisher::with_sinks(config.subscriber_buffer, metrics.clone(), sinks);

    // === 4. Coordinator (recovers ready timers) ===
    let coordinator = FulfillmentCoordinator::start(&config, store, publisher.clone(), metrics.clone()).await?;

    // === 5. Demonstrate the order lifecycle ===
    let alice = CustomerId::new();
    let bob = WorkerId::new();
    let carol = WorkerId::new();

    let mut alice_feed = publisher.subscribe_customer(alice).await;
    let mut kitchen_feed = publisher.subscribe_kitchen().await;

    let items = vec![
        OrderLine::new(Uuid::new_v4(), 2, 1250),
        OrderLine::new(Uuid::new_v4(), 1, 450).with_instructions("no onions"),
    ];
    let order = coordinator.place_order(alice, items.clone()).await?;

    // Two chefs race for the same ticket
    let (bob_claim, carol_claim) = tokio::join!(coordinator.claim(order.id, bob), coordinator.claim(order.id, carol));
    let owner = match (bob_claim, carol_claim) {
        (Ok(claimed), Err(lost)) | (Err(lost), Ok(claimed)) => {
            tracing::info!(reason = %lost, "Losing chef told the order was taken");
            claimed.owner.unwrap_or(bob)
        }
        (Ok(claimed), Ok(_)) => claimed.owner.unwrap_or(bob),
        (Err(first), Err(second)) => anyhow::bail!("no chef could claim the order: {first}; {second}"),
    };

    coordinator.mark_ready(order.id, owner).await?;
    let completed = coordinator.complete(order.id, &Actor::Kitchen(owner)).await?;
    tracing::info!(order_id = %completed.id, completed_by = ?completed.completed_by, "🎉 Order handed over");

    for notification in alice_feed.drain() {
        tracing::info!(kind = notification.event_data.kind.as_str(), "Customer notified");
    }
    for notification in kitchen_feed.drain() {
        tracing::info!(kind = notification.event_data.kind.as_str(), "Kitchen notified");
    }

    // A second order nobody picks up after it is ready
    if config.ready_grace_period <= Duration::from_secs(30) {
        let order = coordinator.place_order(alice, items).await?;
        coordinator.claim(order.id, bob).await?;
        coordinator.mark_ready(order.id, bob).await?;
        tracing::info!(grace_secs = config.ready_grace_period.as_secs(), "⏳ Waiting for auto-completion");

        tokio::time::sleep(config.ready_grace_period + Duration::from_secs(1)).await;
        let snapshot = coordinator.get_order(order.id, &Actor::Customer(alice)).await?;
        tracing::info!(status = %snapshot.status, completed_by = ?snapshot.completed_by, "Auto-complete result");
    } else {
        tracing::info!("Skipping auto-complete demo (set KITCHEN_READY_GRACE_SECS <= 30 to run it)");
    }

    coordinator.shutdown().await;
    drop(coordinator);
    drop(publisher);
    let total = forwarders.len();
    let drained = join_forwarders(forwarders, Duration::from_secs(10)).await;
    if drained < total {
        tracing::warn!(drained, total, "Not every event sink forwarder drained cleanly");
    }

    tracing::info!("🎉 Demo complete!");
    Ok(())
}
