use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::OrderNotification;
use crate::metrics::Metrics;
use crate::utils::{retry_with_backoff, RetryConfig, RetryResult};

// ============================================================================
// External event sinks
// ============================================================================
//
// The publisher hands each delivered notification to a bounded channel;
// one forwarder task per sink drains it in order and retries failures with
// backoff. While a sink is stuck retrying, the publisher drops what no
// longer fits and counts it. A notification that still fails is logged and
// skipped: the order store remains the source of truth.
//
// ============================================================================

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Label used in logs and metrics
    fn name(&self) -> &'static str;

    async fn deliver(&self, notification: &OrderNotification) -> Result<()>;
}

/// Spawn the forwarder for `sink` with a queue of `capacity` events; pass
/// the sender to `EventPublisher::with_sinks`. The task ends once every
/// sender is dropped.
pub fn spawn_sink_forwarder(
    sink: Arc<dyn EventSink>,
    metrics: Arc<Metrics>,
    retry: RetryConfig,
    capacity: usize,
) -> (mpsc::Sender<OrderNotification>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<OrderNotification>(capacity.max(1));

    let handle = tokio::spawn(async move {
        let name = sink.name();
        tracing::info!(sink = name, "📤 Event sink forwarder started");

        while let Some(notification) = rx.recv().await {
            let result = retry_with_backoff(&retry, name, |attempt| {
                if attempt > 1 {
                    metrics.record_retry_attempt(name, attempt);
                }
                let sink = sink.clone();
                let notification = notification.clone();
                async move { sink.deliver(&notification).await }
            })
            .await;

            if result.attempts() > 1 {
                metrics.record_retry_outcome(name, matches!(result, RetryResult::Success { .. }));
            }

            match result {
                RetryResult::Success { .. } => {
                    metrics.record_sink_delivery(name, true);
                }
                RetryResult::Failed { error, attempts } => {
                    metrics.record_sink_delivery(name, false);
                    tracing::error!(
                        sink = name,
                        order_id = %notification.aggregate_id,
                        sequence = notification.sequence_number,
                        attempts,
                        error = %error,
                        "❌ Dropping event after exhausting sink retries"
                    );
                }
            }
        }

        tracing::info!(sink = name, "Event sink forwarder stopped");
    });

    (tx, handle)
}

/// Wait for forwarders to drain after their senders are dropped. Returns
/// how many finished cleanly within `timeout` each.
pub async fn join_forwarders(handles: Vec<JoinHandle<()>>, timeout: Duration) -> usize {
    let mut drained = 0;
    for handle in handles {
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => drained += 1,
            Ok(Err(e)) => tracing::error!(error = %e, "Event sink forwarder failed during shutdown"),
            Err(_) => tracing::warn!(
                timeout_secs = timeout.as_secs(),
                "Timed out waiting for event sink forwarder to drain"
            ),
        }
    }
    drained
}
