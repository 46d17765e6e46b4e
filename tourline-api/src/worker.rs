use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tourline_core::repository::{EventPublisher, OutboxStore};
use tourline_core::CoreResult;
use tourline_shared::EventEnvelope;
use tracing::{error, info};

use crate::metrics::ApiMetrics;

/// Publisher used when no event bus is configured.
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, envelope: &EventEnvelope) -> CoreResult<()> {
        info!(
            "Event {} for booking {}: {}",
            envelope.event_type, envelope.booking_id, envelope.payload
        );
        Ok(())
    }
}

/// Moves committed outbox events to the event bus, oldest first. Delivery is
/// at-least-once: an event is marked only after a successful publish.
pub struct OutboxDispatcher {
    outbox: Arc<dyn OutboxStore>,
    publisher: Arc<dyn EventPublisher>,
    metrics: Arc<ApiMetrics>,
    batch_size: usize,
    poll_interval: Duration,
}

impl OutboxDispatcher {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        publisher: Arc<dyn EventPublisher>,
        metrics: Arc<ApiMetrics>,
        batch_size: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            outbox,
            publisher,
            metrics,
            batch_size,
            poll_interval,
        }
    }

    /// Publish one batch. Stops at the first failure so per-booking order is
    /// preserved; the rest is retried on the next poll.
    pub async fn dispatch_once(&self) -> CoreResult<usize> {
        let pending = self.outbox.pending_events(self.batch_size).await?;
        let mut dispatched = Vec::with_capacity(pending.len());

        for envelope in &pending {
            if let Err(e) = self.publisher.publish(envelope).await {
                error!(
                    "Failed to publish {} {} for booking {}: {}",
                    envelope.event_type, envelope.id, envelope.booking_id, e
                );
                break;
            }
            dispatched.push(envelope.id);
        }

        if !dispatched.is_empty() {
            self.outbox.mark_dispatched(&dispatched, Utc::now()).await?;
            self.metrics
                .outbox_events_dispatched_total
                .inc_by(dispatched.len() as u64);
        }
        Ok(dispatched.len())
    }

    pub async fn run(self) {
        info!("Outbox dispatcher started (batch {}, every {:?})", self.batch_size, self.poll_interval);

        loop {
            match self.dispatch_once().await {
                // A full batch means there is likely more waiting.
                Ok(n) if n > 0 && n == self.batch_size => continue,
                Ok(_) => {}
                Err(e) => error!("Outbox dispatch failed: {}", e),
            }
            sleep(self.poll_interval).await;
        }
    }
}
