//! Retry scheduler.
//!
//! Owns the attempt counter and the backoff formula. A retry signal for
//! attempt `n` either enqueues attempt `n + 1` after the policy's delay or
//! gives up, leaving the record with its last recorded response. Because a
//! retry is only enqueued after attempt `n` has finished, attempts for one
//! record never overlap.
//!
//! Both decisions are written to the record before anything is enqueued, so
//! a retry waiting out its delay survives a restart through recovery.

use std::sync::Arc;

use hookrelay_core::{Clock, DeliveryEvent, EventHandler, GaveUpEvent, RetryScheduledEvent};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{
    engine::EngineStats,
    error::Result,
    queue::{DeliveryTask, TaskQueue},
    retry::{RetryDecision, RetryPolicy},
    storage::DeliveryStorage,
};

/// Turns retry signals into persisted, delayed enqueues.
pub struct RetryScheduler {
    policy: RetryPolicy,
    storage: Arc<dyn DeliveryStorage>,
    queue: Arc<dyn TaskQueue>,
    event_handler: Arc<dyn EventHandler>,
    clock: Arc<dyn Clock>,
    stats: Arc<RwLock<EngineStats>>,
}

impl RetryScheduler {
    /// Creates a scheduler.
    pub fn new(
        policy: RetryPolicy,
        storage: Arc<dyn DeliveryStorage>,
        queue: Arc<dyn TaskQueue>,
        event_handler: Arc<dyn EventHandler>,
        clock: Arc<dyn Clock>,
        stats: Arc<RwLock<EngineStats>>,
    ) -> Self {
        Self { policy, storage, queue, event_handler, clock, stats }
    }

    /// The policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Handles a retry signal for the attempt described by `task`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::QueueUnavailable` if the follow-up task could
    /// not be enqueued. A decision that cannot be written to the record is
    /// logged and still carried out in memory.
    pub async fn on_retry_signal(&self, task: DeliveryTask) -> Result<RetryDecision> {
        let decision = self.policy.decide(task.attempt_number);
        let now = self.clock.now_utc();

        match &decision {
            RetryDecision::Retry { delay, next_attempt } => {
                let due_at = chrono::Duration::from_std(*delay)
                    .ok()
                    .and_then(|delay| now.checked_add_signed(delay))
                    .unwrap_or(now);

                let persisted =
                    self.storage.schedule_attempt(task.record_id, *next_attempt, due_at, now).await;
                match persisted {
                    Ok(true) => {},
                    Ok(false) => {
                        debug!(record_id = %task.record_id, "record removed, retry not scheduled");
                        return Ok(decision);
                    },
                    Err(error) => warn!(
                        record_id = %task.record_id,
                        error = %error,
                        "failed to persist retry, it will not survive a restart"
                    ),
                }

                let next =
                    DeliveryTask { record_id: task.record_id, attempt_number: *next_attempt };
                self.queue.enqueue(next, *delay).await?;

                self.stats.write().await.retries_scheduled += 1;
                debug!(
                    record_id = %task.record_id,
                    next_attempt,
                    delay_secs = delay.as_secs(),
                    "retry scheduled"
                );

                self.event_handler
                    .handle_event(DeliveryEvent::RetryScheduled(RetryScheduledEvent {
                        record_id: task.record_id,
                        next_attempt: *next_attempt,
                        delay: *delay,
                        scheduled_at: now,
                    }))
                    .await;
            },
            RetryDecision::GiveUp { reason } => {
                if let Err(error) =
                    self.storage.settle_delivery_record(task.record_id, true, now).await
                {
                    warn!(
                        record_id = %task.record_id,
                        error = %error,
                        "failed to mark record given up"
                    );
                }
                self.stats.write().await.gave_up += 1;
                warn!(
                    record_id = %task.record_id,
                    attempts = task.attempt_number,
                    reason = %reason,
                    "giving up on delivery"
                );

                self.event_handler
                    .handle_event(DeliveryEvent::GaveUp(GaveUpEvent {
                        record_id: task.record_id,
                        attempts: task.attempt_number,
                        reason: reason.clone(),
                        gave_up_at: now,
                    }))
                    .await;
            },
        }

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use hookrelay_core::{
        DeliveryRecordId, EndpointId, NewDeliveryRecord, NoOpEventHandler, TestClock,
    };
    use serde_json::json;

    use super::*;
    use crate::{queue::mock::RecordingQueue, storage::mock::MockDeliveryStorage};

    struct Fixture {
        scheduler: RetryScheduler,
        storage: MockDeliveryStorage,
        queue: RecordingQueue,
        clock: Arc<TestClock>,
        stats: Arc<RwLock<EngineStats>>,
    }

    fn fixture() -> Fixture {
        let storage = MockDeliveryStorage::new();
        let queue = RecordingQueue::new();
        let clock = Arc::new(TestClock::new());
        let stats = Arc::new(RwLock::new(EngineStats::default()));
        let scheduler = RetryScheduler::new(
            RetryPolicy::default(),
            Arc::new(storage.clone()),
            Arc::new(queue.clone()),
            Arc::new(NoOpEventHandler),
            clock.clone(),
            stats.clone(),
        );
        Fixture { scheduler, storage, queue, clock, stats }
    }

    async fn seeded_task(storage: &MockDeliveryStorage) -> DeliveryTask {
        let record = NewDeliveryRecord {
            endpoint_id: EndpointId::new(),
            event_type: "order.created".to_string(),
            payload: json!({"id": 1}),
        }
        .into_record(Utc::now());
        let task = DeliveryTask::first(record.id);
        storage.insert_delivery_record(record).await;
        task
    }

    #[tokio::test]
    async fn first_failure_enqueues_second_attempt_with_bounded_delay() {
        let f = fixture();
        let task = seeded_task(&f.storage).await;

        let decision = f.scheduler.on_retry_signal(task).await.unwrap();

        assert!(matches!(decision, RetryDecision::Retry { next_attempt: 2, .. }));
        let enqueued = f.queue.enqueued();
        assert_eq!(enqueued.len(), 1);
        let (next, delay) = enqueued[0];
        assert_eq!(next, task.next());
        assert!(delay > Duration::from_secs(30));
        assert!(delay <= Duration::from_secs(601));
        assert_eq!(f.stats.read().await.retries_scheduled, 1);
    }

    #[tokio::test]
    async fn scheduled_retry_is_written_to_the_record() {
        let f = fixture();
        let task = seeded_task(&f.storage).await;

        let RetryDecision::Retry { delay, .. } = f.scheduler.on_retry_signal(task).await.unwrap()
        else {
            panic!("first failure should be retried");
        };

        let record = f.storage.delivery_record(task.record_id).await.unwrap();
        let scheduled_at = f.clock.now_utc();
        assert_eq!(record.attempt_number, 2);
        assert_eq!(record.remaining_delay(scheduled_at), Some(delay));
        assert!(record.gave_up_at.is_none());
    }

    #[tokio::test]
    async fn tenth_failure_is_final_and_marked_given_up() {
        let f = fixture();
        let mut task = seeded_task(&f.storage).await;
        task.attempt_number = 10;

        let decision = f.scheduler.on_retry_signal(task).await.unwrap();

        assert!(matches!(decision, RetryDecision::GiveUp { .. }));
        assert!(f.queue.is_empty());
        assert_eq!(f.stats.read().await.gave_up, 1);

        let record = f.storage.delivery_record(task.record_id).await.unwrap();
        assert_eq!(record.gave_up_at, Some(f.clock.now_utc()));
        assert!(!record.has_pending_attempt());
    }

    #[tokio::test]
    async fn removed_record_gets_no_follow_up() {
        let f = fixture();

        let decision =
            f.scheduler.on_retry_signal(DeliveryTask::first(DeliveryRecordId::new())).await;

        assert!(matches!(decision, Ok(RetryDecision::Retry { .. })));
        assert!(f.queue.is_empty());
        assert_eq!(f.stats.read().await.retries_scheduled, 0);
    }

    #[tokio::test]
    async fn unwritable_retry_is_still_enqueued() {
        let f = fixture();
        let task = seeded_task(&f.storage).await;
        f.storage.fail_next("connection reset").await;

        f.scheduler.on_retry_signal(task).await.unwrap();

        assert_eq!(f.queue.enqueued().len(), 1);
    }

    #[tokio::test]
    async fn attempt_numbers_climb_to_ten_and_stop() {
        let f = fixture();
        let mut task = seeded_task(&f.storage).await;

        while let RetryDecision::Retry { next_attempt, .. } =
            f.scheduler.on_retry_signal(task).await.unwrap()
        {
            task.attempt_number = next_attempt;
        }

        let attempts: Vec<u32> =
            f.queue.enqueued().iter().map(|(t, _)| t.attempt_number).collect();
        assert_eq!(attempts, (2..=10).collect::<Vec<_>>());
    }
}
