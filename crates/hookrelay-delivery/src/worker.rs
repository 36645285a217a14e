//! Per-attempt delivery state machine.
//!
//! ```text
//! LOADING ──▶ GUARD-CHECK ──▶ SENDING ──▶ CLASSIFYING ──▶ outcome
//!    │             │
//!    └─ Skipped ◀──┘
//! ```
//!
//! Missing records, missing endpoints and endpoints that no longer accept
//! the event end the attempt silently, dropping any attempt still owed to the
//! record. Otherwise the response (or transport
//! failure) is persisted before the classifier decides the outcome, and any
//! endpoint mutation happens after that.

use std::{fmt, sync::Arc};

use hookrelay_core::{
    AttemptResolvedEvent, AttemptStartedEvent, Clock, DeliveryEvent, DeliveryRecord, Endpoint,
    EndpointUpdate, EventHandler, RecordedResponse, Resolution,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    classify::{Classification, Classifier, Verdict},
    client::DeliveryClient,
    engine::EngineStats,
    error::Result,
    queue::DeliveryTask,
};

/// Why an attempt ended before sending anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// The delivery record no longer exists.
    RecordMissing,
    /// The endpoint was deleted.
    EndpointMissing,
    /// The endpoint is disabled or no longer subscribed.
    NotAccepting,
}

/// Result of one call to [`DeliveryWorker::attempt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptOutcome {
    /// Nothing was sent and no response was recorded.
    Skipped(SkipReason),
    /// The endpoint answered 2xx.
    Delivered,
    /// The endpoint was deleted.
    EndpointDeleted,
    /// Transient failure. The scheduler decides whether to try again.
    RetryRequested,
    /// The endpoint was disabled.
    EndpointDisabled,
    /// Terminal failure with the endpoint untouched.
    Abandoned,
}

impl AttemptOutcome {
    /// Whether the scheduler should be signalled.
    pub const fn wants_retry(&self) -> bool {
        matches!(self, Self::RetryRequested)
    }

    fn resolution(&self) -> Option<Resolution> {
        match self {
            Self::Skipped(_) => None,
            Self::Delivered => Some(Resolution::Delivered),
            Self::EndpointDeleted => Some(Resolution::EndpointDeleted),
            Self::RetryRequested => Some(Resolution::RetryRequested),
            Self::EndpointDisabled => Some(Resolution::EndpointDisabled),
            Self::Abandoned => Some(Resolution::Abandoned),
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped(reason) => write!(f, "skipped ({reason:?})"),
            Self::Delivered => write!(f, "delivered"),
            Self::EndpointDeleted => write!(f, "endpoint_deleted"),
            Self::RetryRequested => write!(f, "retry_requested"),
            Self::EndpointDisabled => write!(f, "endpoint_disabled"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Runs single delivery attempts.
///
/// The worker is stateless between attempts; every call reloads the record
/// and endpoint so a disable or delete between attempts takes effect.
pub struct DeliveryWorker {
    storage: Arc<dyn crate::storage::DeliveryStorage>,
    client: DeliveryClient,
    classifier: Classifier,
    event_handler: Arc<dyn EventHandler>,
    clock: Arc<dyn Clock>,
    stats: Arc<RwLock<EngineStats>>,
}

impl DeliveryWorker {
    /// Creates a worker.
    pub fn new(
        storage: Arc<dyn crate::storage::DeliveryStorage>,
        client: DeliveryClient,
        classifier: Classifier,
        event_handler: Arc<dyn EventHandler>,
        clock: Arc<dyn Clock>,
        stats: Arc<RwLock<EngineStats>>,
    ) -> Self {
        Self { storage, client, classifier, event_handler, clock, stats }
    }

    /// Runs one attempt for `task`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Database` if the record store fails. The
    /// caller treats that as a retry signal.
    pub async fn attempt(&self, task: DeliveryTask) -> Result<AttemptOutcome> {
        let Some(record) = self.storage.find_delivery_record(task.record_id).await? else {
            debug!(record_id = %task.record_id, "delivery record missing, skipping");
            return self.skipped(None, SkipReason::RecordMissing).await;
        };

        let Some(endpoint) = self.storage.find_endpoint(record.endpoint_id).await? else {
            debug!(
                record_id = %record.id,
                endpoint_id = %record.endpoint_id,
                "endpoint missing, skipping"
            );
            return self.skipped(Some(&record), SkipReason::EndpointMissing).await;
        };

        if !endpoint.accepts(&record.event_type) {
            debug!(
                record_id = %record.id,
                endpoint_id = %endpoint.id,
                enabled = endpoint.enabled,
                "endpoint no longer accepts event, skipping"
            );
            return self.skipped(Some(&record), SkipReason::NotAccepting).await;
        }

        {
            let mut stats = self.stats.write().await;
            stats.in_flight_attempts += 1;
            stats.attempts_started += 1;
        }

        let result = self.send_and_classify(task, &record, &endpoint).await;

        {
            let mut stats = self.stats.write().await;
            stats.in_flight_attempts = stats.in_flight_attempts.saturating_sub(1);
            if let Ok(outcome) = &result {
                stats.record_outcome(*outcome);
            }
        }

        result
    }

    async fn skipped(
        &self,
        record: Option<&DeliveryRecord>,
        reason: SkipReason,
    ) -> Result<AttemptOutcome> {
        if let Some(record) = record.filter(|record| record.has_pending_attempt()) {
            self.storage.settle_delivery_record(record.id, false, self.clock.now_utc()).await?;
        }
        let outcome = AttemptOutcome::Skipped(reason);
        self.stats.write().await.record_outcome(outcome);
        Ok(outcome)
    }

    async fn send_and_classify(
        &self,
        task: DeliveryTask,
        record: &DeliveryRecord,
        endpoint: &Endpoint,
    ) -> Result<AttemptOutcome> {
        self.event_handler
            .handle_event(DeliveryEvent::AttemptStarted(AttemptStartedEvent {
                record_id: record.id,
                endpoint_id: endpoint.id,
                endpoint_url: endpoint.url.clone(),
                event_type: record.event_type.clone(),
                attempt_number: task.attempt_number,
                started_at: self.clock.now_utc(),
            }))
            .await;

        let (recorded, classification, duration) =
            match self.client.post_json(&endpoint.url, &record.wire_body()).await {
                Ok(response) => (
                    response.to_recorded(),
                    self.classifier.classify_response(&endpoint.url, &response),
                    response.duration,
                ),
                Err(failure) => (
                    failure.to_recorded(),
                    self.classifier.classify_transport(failure.code),
                    failure.duration,
                ),
            };

        let still_exists =
            self.storage.record_response(record.id, recorded.clone(), self.clock.now_utc()).await?;
        if !still_exists {
            warn!(record_id = %record.id, "delivery record removed during attempt");
        }

        let outcome = self.apply_verdict(record, endpoint, &recorded, classification).await?;

        if let Some(resolution) = outcome.resolution() {
            self.event_handler
                .handle_event(DeliveryEvent::AttemptResolved(AttemptResolvedEvent {
                    record_id: record.id,
                    endpoint_id: endpoint.id,
                    endpoint_url: endpoint.url.clone(),
                    attempt_number: task.attempt_number,
                    resolution,
                    rule: classification.rule.to_string(),
                    response_status: recorded.status_code(),
                    error_code: recorded.error_code(),
                    duration,
                    resolved_at: self.clock.now_utc(),
                }))
                .await;
        }

        Ok(outcome)
    }

    async fn apply_verdict(
        &self,
        record: &DeliveryRecord,
        endpoint: &Endpoint,
        recorded: &RecordedResponse,
        classification: Classification,
    ) -> Result<AttemptOutcome> {
        let outcome = match classification.verdict {
            Verdict::Delivered => {
                info!(
                    endpoint_id = %endpoint.id,
                    record_id = %record.id,
                    url = %endpoint.url,
                    code = ?recorded.status_code(),
                    "webhook delivered"
                );
                AttemptOutcome::Delivered
            },
            Verdict::DeleteEndpoint => {
                self.storage.delete_endpoint(endpoint.id).await?;
                warn!(
                    endpoint_id = %endpoint.id,
                    record_id = %record.id,
                    url = %endpoint.url,
                    rule = classification.rule,
                    "endpoint deleted"
                );
                AttemptOutcome::EndpointDeleted
            },
            Verdict::DisableEndpoint => {
                self.storage
                    .update_endpoint(endpoint.id, EndpointUpdate::disable(), self.clock.now_utc())
                    .await?;
                warn!(
                    endpoint_id = %endpoint.id,
                    record_id = %record.id,
                    url = %endpoint.url,
                    rule = classification.rule,
                    "endpoint disabled"
                );
                AttemptOutcome::EndpointDisabled
            },
            Verdict::Retry => {
                debug!(
                    record_id = %record.id,
                    code = ?recorded.status_code(),
                    error_code = ?recorded.error_code(),
                    rule = classification.rule,
                    "attempt failed, retry requested"
                );
                AttemptOutcome::RetryRequested
            },
            Verdict::Abandon => {
                warn!(
                    endpoint_id = %endpoint.id,
                    record_id = %record.id,
                    error_code = ?recorded.error_code(),
                    rule = classification.rule,
                    "attempt abandoned"
                );
                AttemptOutcome::Abandoned
            },
        };

        Ok(outcome)
    }
}
