//! Event fan-out.
//!
//! One event becomes one delivery record and one first-attempt task per
//! enabled endpoint that subscribes to it. Validation runs before any read
//! or write, so a rejected event leaves no trace.

use std::{sync::Arc, time::Duration};

use hookrelay_core::{validation, Clock, DeliveryRecord, DeliveryRecordId, NewDeliveryRecord};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    error::Result,
    queue::{DeliveryTask, TaskQueue},
    storage::DeliveryStorage,
};

/// Fans events out to subscribed endpoints.
#[derive(Clone)]
pub struct Dispatcher {
    storage: Arc<dyn DeliveryStorage>,
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, queue, clock }
    }

    /// Dispatches an event. Returns the IDs of the records created.
    ///
    /// Records are written before their tasks are enqueued. A task that
    /// fails to enqueue is logged and left for startup recovery, since its
    /// record has no response yet.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Validation` for a blank event type or payload
    /// and `DeliveryError::Database` if endpoints cannot be listed or records
    /// cannot be written.
    pub async fn dispatch(
        &self,
        event_type: &str,
        payload: Value,
    ) -> Result<Vec<DeliveryRecordId>> {
        validation::validate_event(event_type, &payload)?;

        let endpoints = self.storage.list_enabled_endpoints().await?;
        let now = self.clock.now_utc();

        let records: Vec<DeliveryRecord> = endpoints
            .iter()
            .filter(|endpoint| endpoint.accepts(event_type))
            .map(|endpoint| {
                NewDeliveryRecord {
                    endpoint_id: endpoint.id,
                    event_type: event_type.to_string(),
                    payload: payload.clone(),
                }
                .into_record(now)
            })
            .collect();

        if records.is_empty() {
            debug!(event_type, candidates = endpoints.len(), "no subscribed endpoints");
            return Ok(Vec::new());
        }

        let ids = self.storage.create_delivery_records(records).await?;

        for id in &ids {
            if let Err(error) = self.queue.enqueue(DeliveryTask::first(*id), Duration::ZERO).await {
                warn!(record_id = %id, error = %error, "failed to enqueue first attempt");
            }
        }

        info!(event_type, records = ids.len(), "event dispatched");
        Ok(ids)
    }
}
