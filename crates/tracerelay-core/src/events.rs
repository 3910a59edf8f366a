//! Delivery outcome events.
//!
//! The orchestrator publishes one event per state change it applies.
//! Subscribers (logging sinks, metrics, audit trails) react without the
//! orchestrator knowing about them.
//!
//! ```text
//! ┌──────────────┐  DeliveryEvent   ┌───────────────────────┐
//! │ Orchestrator │ ───────────────▶ │ MulticastEventHandler │ ──▶ subscribers
//! └──────────────┘                  └───────────────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{DeliveryId, DestinationId, OrgId, TraceId};

/// Events emitted by the delivery orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeliveryEvent {
    /// The adapter accepted the trace.
    Succeeded(DeliverySucceededEvent),

    /// An attempt failed and a retry was scheduled.
    RetryScheduled(DeliveryRetryScheduledEvent),

    /// The record reached `failed`.
    Failed(DeliveryFailedEvent),

    /// The destination rate limit was saturated; the record was deferred.
    Deferred(DeliveryDeferredEvent),

    /// The record was cancelled.
    Cancelled(DeliveryCancelledEvent),
}

impl DeliveryEvent {
    /// Delivery record the event refers to.
    pub fn delivery_id(&self) -> DeliveryId {
        match self {
            Self::Succeeded(e) => e.delivery_id,
            Self::RetryScheduled(e) => e.delivery_id,
            Self::Failed(e) => e.delivery_id,
            Self::Deferred(e) => e.delivery_id,
            Self::Cancelled(e) => e.delivery_id,
        }
    }
}

/// Emitted when an adapter reports success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverySucceededEvent {
    /// Delivered record.
    pub delivery_id: DeliveryId,
    /// Delivered trace.
    pub trace_id: TraceId,
    /// Receiving destination.
    pub destination_id: DestinationId,
    /// Owning organization.
    pub org_id: OrgId,
    /// Provider key of the adapter used.
    pub provider_type: String,
    /// 1-based number of the attempt that succeeded.
    pub attempt_number: u32,
    /// When the delivery succeeded.
    pub delivered_at: DateTime<Utc>,
}

/// Emitted when an attempt fails with retries remaining.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRetryScheduledEvent {
    /// Affected record.
    pub delivery_id: DeliveryId,
    /// Trace being delivered.
    pub trace_id: TraceId,
    /// Target destination.
    pub destination_id: DestinationId,
    /// Failed attempts so far.
    pub attempts: u32,
    /// When the next attempt is due.
    pub next_retry_at: DateTime<Utc>,
    /// Error reported by the failed attempt.
    pub error_message: String,
}

/// Emitted when a record reaches `failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryFailedEvent {
    /// Failed record.
    pub delivery_id: DeliveryId,
    /// Trace that could not be delivered.
    pub trace_id: TraceId,
    /// Target destination.
    pub destination_id: DestinationId,
    /// Failed attempts in total.
    pub attempts: u32,
    /// When the record failed.
    pub failed_at: DateTime<Utc>,
    /// Final error message.
    pub error_message: String,
}

/// Emitted when the rate limiter defers a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryDeferredEvent {
    /// Deferred record.
    pub delivery_id: DeliveryId,
    /// Rate-limited destination.
    pub destination_id: DestinationId,
    /// When the record becomes due again.
    pub next_retry_at: DateTime<Utc>,
}

/// Emitted when a record is cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryCancelledEvent {
    /// Cancelled record.
    pub delivery_id: DeliveryId,
    /// When it was cancelled.
    pub cancelled_at: DateTime<Utc>,
    /// Recorded reason.
    pub reason: String,
}

/// Trait for handling delivery events.
///
/// Handlers must not block delivery processing. Failures inside a handler
/// are logged by the handler itself and never propagated.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles a delivery event.
    async fn handle_event(&self, event: DeliveryEvent);
}

/// Event handler that discards all events.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op event handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: DeliveryEvent) {}
}

/// Forwards events to every registered subscriber concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a new multicast handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        futures::future::join_all(futures).await;
    }
}

/// Subscriber that writes each event to the tracing log.
#[derive(Debug, Default)]
pub struct TracingEventHandler;

#[async_trait::async_trait]
impl EventHandler for TracingEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        match &event {
            DeliveryEvent::Succeeded(e) => tracing::info!(
                delivery_id = %e.delivery_id,
                trace_id = %e.trace_id,
                destination_id = %e.destination_id,
                provider = %e.provider_type,
                attempt = e.attempt_number,
                "trace delivered"
            ),
            DeliveryEvent::RetryScheduled(e) => tracing::warn!(
                delivery_id = %e.delivery_id,
                destination_id = %e.destination_id,
                attempts = e.attempts,
                next_retry_at = %e.next_retry_at,
                error = %e.error_message,
                "delivery attempt failed, retry scheduled"
            ),
            DeliveryEvent::Failed(e) => tracing::error!(
                delivery_id = %e.delivery_id,
                destination_id = %e.destination_id,
                attempts = e.attempts,
                error = %e.error_message,
                "delivery failed permanently"
            ),
            DeliveryEvent::Deferred(e) => tracing::debug!(
                delivery_id = %e.delivery_id,
                destination_id = %e.destination_id,
                next_retry_at = %e.next_retry_at,
                "delivery deferred by rate limit"
            ),
            DeliveryEvent::Cancelled(e) => tracing::info!(
                delivery_id = %e.delivery_id,
                reason = %e.reason,
                "delivery cancelled"
            ),
        }
    }
}
