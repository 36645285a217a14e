//! Event capture for asserting on delivery lifecycles.
//!
//! Waiting helpers poll with a deadline so a broken test fails instead of
//! hanging CI.

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Result};
use async_trait::async_trait;
use hookrelay_core::{DeliveryEvent, DeliveryRecordId, EventHandler, Resolution};
use tokio::sync::{Notify, RwLock};

/// Event handler that keeps every event it receives.
#[derive(Debug, Clone, Default)]
pub struct RecordingEventHandler {
    events: Arc<RwLock<Vec<DeliveryEvent>>>,
    notify: Arc<Notify>,
}

impl RecordingEventHandler {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event received so far, in arrival order.
    pub async fn events(&self) -> Vec<DeliveryEvent> {
        self.events.read().await.clone()
    }

    /// Events concerning one record.
    pub async fn events_for(&self, record_id: DeliveryRecordId) -> Vec<DeliveryEvent> {
        self.events.read().await.iter().filter(|e| e.record_id() == record_id).cloned().collect()
    }

    /// Resolutions in arrival order.
    pub async fn resolutions(&self) -> Vec<Resolution> {
        self.events
            .read()
            .await
            .iter()
            .filter_map(|event| match event {
                DeliveryEvent::AttemptResolved(resolved) => Some(resolved.resolution),
                _ => None,
            })
            .collect()
    }

    /// Number of events matching `predicate`.
    pub async fn count(&self, predicate: impl Fn(&DeliveryEvent) -> bool) -> usize {
        self.events.read().await.iter().filter(|e| predicate(e)).count()
    }

    /// Waits until at least `n` events match `predicate`.
    ///
    /// # Errors
    ///
    /// Fails if the deadline passes first.
    pub async fn wait_for(
        &self,
        n: usize,
        timeout: Duration,
        predicate: impl Fn(&DeliveryEvent) -> bool,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            let seen = self.count(&predicate).await;
            if seen >= n {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                bail!("timed out after {timeout:?} with {seen} of {n} matching events");
            }
        }
    }

    /// Waits for `n` attempt resolutions of any kind.
    ///
    /// # Errors
    ///
    /// Fails if the deadline passes first.
    pub async fn wait_for_resolutions(&self, n: usize, timeout: Duration) -> Result<()> {
        self.wait_for(n, timeout, |e| matches!(e, DeliveryEvent::AttemptResolved(_))).await
    }

    /// Drops everything recorded so far.
    pub async fn clear(&self) {
        self.events.write().await.clear();
    }
}

#[async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        self.events.write().await.push(event);
        self.notify.notify_waiters();
    }
}
