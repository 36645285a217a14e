//! Delivery lifecycle events and handler traits.
//!
//! The delivery worker and retry scheduler publish events as attempts start,
//! resolve, get rescheduled or are given up on. Subscribers observe them
//! without the pipeline knowing who is listening.
//!
//! ```text
//! ┌─────────────────┐   AttemptStarted / AttemptResolved   ┌──────────────────────┐
//! │ DeliveryWorker  │ ───────────────────────────────────▶ │ MulticastEventHandler │
//! └─────────────────┘                                      └──────────────────────┘
//! ┌─────────────────┐   RetryScheduled / GaveUp                      │
//! │ RetryScheduler  │ ──────────────────────────────────────────────▶ │
//! └─────────────────┘                                                ▼
//!                                                     TracingEventHandler, test spies, ...
//! ```

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::{DeliveryRecordId, EndpointId, TransportErrorCode};

/// Events emitted by the delivery pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeliveryEvent {
    /// A POST is about to be sent.
    AttemptStarted(AttemptStartedEvent),

    /// An attempt finished and was classified.
    AttemptResolved(AttemptResolvedEvent),

    /// A retry was enqueued with a delay.
    RetryScheduled(RetryScheduledEvent),

    /// The retry budget is exhausted.
    GaveUp(GaveUpEvent),
}

impl DeliveryEvent {
    /// Delivery record the event refers to.
    pub fn record_id(&self) -> DeliveryRecordId {
        match self {
            Self::AttemptStarted(e) => e.record_id,
            Self::AttemptResolved(e) => e.record_id,
            Self::RetryScheduled(e) => e.record_id,
            Self::GaveUp(e) => e.record_id,
        }
    }
}

/// Emitted just before the HTTP request goes out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptStartedEvent {
    /// Record being delivered.
    pub record_id: DeliveryRecordId,
    /// Target endpoint.
    pub endpoint_id: EndpointId,
    /// Destination URL at the time of the attempt.
    pub endpoint_url: String,
    /// Event type being delivered.
    pub event_type: String,
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// When the attempt began.
    pub started_at: DateTime<Utc>,
}

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// 2xx response.
    Delivered,
    /// Transient failure, retry requested.
    RetryRequested,
    /// Endpoint disabled; no retry.
    EndpointDisabled,
    /// Endpoint deleted; no retry.
    EndpointDeleted,
    /// Terminal failure with the endpoint left untouched.
    Abandoned,
}

impl Resolution {
    /// Returns whether the scheduler will be asked for another attempt.
    pub const fn wants_retry(&self) -> bool {
        matches!(self, Self::RetryRequested)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Delivered => "delivered",
            Self::RetryRequested => "retry_requested",
            Self::EndpointDisabled => "endpoint_disabled",
            Self::EndpointDeleted => "endpoint_deleted",
            Self::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

/// Emitted after the response has been recorded and classified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptResolvedEvent {
    /// Record that was attempted.
    pub record_id: DeliveryRecordId,
    /// Target endpoint.
    pub endpoint_id: EndpointId,
    /// Destination URL.
    pub endpoint_url: String,
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// Classification result.
    pub resolution: Resolution,
    /// Name of the rule that produced the resolution.
    pub rule: String,
    /// HTTP status if a response arrived.
    pub response_status: Option<u16>,
    /// Transport failure code if no response arrived.
    pub error_code: Option<TransportErrorCode>,
    /// Wall time spent on the request.
    pub duration: Duration,
    /// When the attempt was resolved.
    pub resolved_at: DateTime<Utc>,
}

/// Emitted when a follow-up attempt is enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryScheduledEvent {
    /// Record to retry.
    pub record_id: DeliveryRecordId,
    /// Attempt number of the scheduled attempt.
    pub next_attempt: u32,
    /// Delay before the scheduled attempt runs.
    pub delay: Duration,
    /// When the retry was scheduled.
    pub scheduled_at: DateTime<Utc>,
}

/// Emitted when no further attempts will be made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaveUpEvent {
    /// Record that is abandoned.
    pub record_id: DeliveryRecordId,
    /// Number of attempts made.
    pub attempts: u32,
    /// Why the scheduler stopped.
    pub reason: String,
    /// When the decision was made.
    pub gave_up_at: DateTime<Utc>,
}

/// Subscriber side of the event stream.
///
/// Handlers must not block delivery and must swallow their own failures.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles a delivery event.
    async fn handle_event(&self, event: DeliveryEvent);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: DeliveryEvent) {}
}

/// Writes every event to the tracing subscriber as a structured log line.
#[derive(Debug, Default)]
pub struct TracingEventHandler;

#[async_trait::async_trait]
impl EventHandler for TracingEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        match event {
            DeliveryEvent::AttemptStarted(e) => info!(
                record_id = %e.record_id,
                endpoint_id = %e.endpoint_id,
                event_type = %e.event_type,
                attempt = e.attempt_number,
                "delivery attempt started"
            ),
            DeliveryEvent::AttemptResolved(e) => info!(
                record_id = %e.record_id,
                endpoint_id = %e.endpoint_id,
                attempt = e.attempt_number,
                resolution = %e.resolution,
                rule = %e.rule,
                status = ?e.response_status,
                error_code = ?e.error_code,
                duration_ms = u64::try_from(e.duration.as_millis()).unwrap_or(u64::MAX),
                "delivery attempt resolved"
            ),
            DeliveryEvent::RetryScheduled(e) => info!(
                record_id = %e.record_id,
                next_attempt = e.next_attempt,
                delay_secs = e.delay.as_secs(),
                "delivery retry scheduled"
            ),
            DeliveryEvent::GaveUp(e) => warn!(
                record_id = %e.record_id,
                attempts = e.attempts,
                reason = %e.reason,
                "delivery abandoned"
            ),
        }
    }
}

/// Fans every event out to all registered subscribers concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a multicast handler with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        let deliveries = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move { handler.handle_event(event).await }
        });

        futures::future::join_all(deliveries).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    struct CountingHandler {
        seen: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EventHandler for CountingHandler {
        async fn handle_event(&self, _event: DeliveryEvent) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn gave_up() -> DeliveryEvent {
        DeliveryEvent::GaveUp(GaveUpEvent {
            record_id: DeliveryRecordId::new(),
            attempts: 10,
            reason: "maximum attempts reached".to_string(),
            gave_up_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn multicast_reaches_every_subscriber() {
        let first = Arc::new(CountingHandler::default());
        let second = Arc::new(CountingHandler::default());

        let mut multicast = MulticastEventHandler::new();
        multicast.add_subscriber(first.clone());
        multicast.add_subscriber(second.clone());
        multicast.add_subscriber(Arc::new(TracingEventHandler));
        assert_eq!(multicast.subscriber_count(), 3);

        multicast.handle_event(gave_up()).await;

        assert_eq!(first.seen.load(Ordering::SeqCst), 1);
        assert_eq!(second.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_multicast_is_a_no_op() {
        MulticastEventHandler::new().handle_event(gave_up()).await;
        NoOpEventHandler.handle_event(gave_up()).await;
    }

    #[test]
    fn only_retry_requested_wants_retry() {
        assert!(Resolution::RetryRequested.wants_retry());
        assert!(!Resolution::EndpointDisabled.wants_retry());
        assert!(!Resolution::Abandoned.wants_retry());
        assert_eq!(Resolution::EndpointDeleted.to_string(), "endpoint_deleted");
    }
}
