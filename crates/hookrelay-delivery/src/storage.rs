//! Storage abstraction for the delivery pipeline.
//!
//! The dispatcher and worker only see [`DeliveryStorage`]. Production wraps
//! the PostgreSQL repositories from `hookrelay_core::storage`; tests use the
//! in-memory [`mock::MockDeliveryStorage`].

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use hookrelay_core::{
    error::Result,
    models::{
        DeliveryRecord, DeliveryRecordId, Endpoint, EndpointId, EndpointUpdate, RecordedResponse,
    },
    storage::Storage,
};

/// Boxed future returned by storage operations.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Record store operations required by the delivery pipeline.
///
/// Creation methods take fully built models so the caller controls IDs and
/// timestamps, and validation happens before anything reaches the store.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Persists a new endpoint.
    fn create_endpoint(&self, endpoint: Endpoint) -> StorageFuture<'_, EndpointId>;

    /// Lists every enabled endpoint.
    fn list_enabled_endpoints(&self) -> StorageFuture<'_, Vec<Endpoint>>;

    /// Finds an endpoint. `None` if it was never created or has been deleted.
    fn find_endpoint(&self, id: EndpointId) -> StorageFuture<'_, Option<Endpoint>>;

    /// Applies a partial update. `None` if the endpoint no longer exists.
    fn update_endpoint(
        &self,
        id: EndpointId,
        update: EndpointUpdate,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<Endpoint>>;

    /// Deletes an endpoint, keeping its delivery records. Returns whether it
    /// existed.
    fn delete_endpoint(&self, id: EndpointId) -> StorageFuture<'_, bool>;

    /// Persists the records produced by one fan-out.
    fn create_delivery_records(
        &self,
        records: Vec<DeliveryRecord>,
    ) -> StorageFuture<'_, Vec<DeliveryRecordId>>;

    /// Finds a delivery record.
    fn find_delivery_record(
        &self,
        id: DeliveryRecordId,
    ) -> StorageFuture<'_, Option<DeliveryRecord>>;

    /// Overwrites the latest-attempt response and clears the pending attempt.
    /// Returns whether the record existed.
    fn record_response(
        &self,
        id: DeliveryRecordId,
        response: RecordedResponse,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Persists that `attempt_number` is owed at `due_at`. Returns whether the
    /// record existed.
    fn schedule_attempt(
        &self,
        id: DeliveryRecordId,
        attempt_number: u32,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Clears the pending attempt without a response, stamping `gave_up_at`
    /// when `gave_up` is set. Returns whether the record existed.
    fn settle_delivery_record(
        &self,
        id: DeliveryRecordId,
        gave_up: bool,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Records that still owe an attempt, earliest due first.
    fn find_pending_records(&self, limit: usize) -> StorageFuture<'_, Vec<DeliveryRecord>>;

    /// Persists a single delivery record.
    fn create_delivery_record(
        &self,
        record: DeliveryRecord,
    ) -> StorageFuture<'_, DeliveryRecordId> {
        Box::pin(async move {
            let mut ids = self.create_delivery_records(vec![record]).await?;
            ids.pop().ok_or_else(|| {
                hookrelay_core::CoreError::Database("insert returned no id".to_string())
            })
        })
    }
}

/// PostgreSQL-backed storage.
pub struct PostgresDeliveryStorage {
    storage: Arc<Storage>,
}

impl PostgresDeliveryStorage {
    /// Wraps the repository container.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn create_endpoint(&self, endpoint: Endpoint) -> StorageFuture<'_, EndpointId> {
        Box::pin(async move { self.storage.endpoints.create(&endpoint).await })
    }

    fn list_enabled_endpoints(&self) -> StorageFuture<'_, Vec<Endpoint>> {
        Box::pin(async move { self.storage.endpoints.find_enabled().await })
    }

    fn find_endpoint(&self, id: EndpointId) -> StorageFuture<'_, Option<Endpoint>> {
        Box::pin(async move { self.storage.endpoints.find_by_id(id).await })
    }

    fn update_endpoint(
        &self,
        id: EndpointId,
        update: EndpointUpdate,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<Endpoint>> {
        Box::pin(async move { self.storage.endpoints.update(id, &update, now).await })
    }

    fn delete_endpoint(&self, id: EndpointId) -> StorageFuture<'_, bool> {
        Box::pin(async move { self.storage.endpoints.delete(id).await })
    }

    fn create_delivery_records(
        &self,
        records: Vec<DeliveryRecord>,
    ) -> StorageFuture<'_, Vec<DeliveryRecordId>> {
        Box::pin(async move { self.storage.delivery_records.create_batch(&records).await })
    }

    fn find_delivery_record(
        &self,
        id: DeliveryRecordId,
    ) -> StorageFuture<'_, Option<DeliveryRecord>> {
        Box::pin(async move { self.storage.delivery_records.find_by_id(id).await })
    }

    fn record_response(
        &self,
        id: DeliveryRecordId,
        response: RecordedResponse,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        Box::pin(async move {
            self.storage.delivery_records.record_response(id, &response, now).await
        })
    }

    fn schedule_attempt(
        &self,
        id: DeliveryRecordId,
        attempt_number: u32,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        Box::pin(async move {
            self.storage.delivery_records.schedule_attempt(id, attempt_number, due_at, now).await
        })
    }

    fn settle_delivery_record(
        &self,
        id: DeliveryRecordId,
        gave_up: bool,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        Box::pin(async move { self.storage.delivery_records.settle(id, gave_up, now).await })
    }

    fn find_pending_records(&self, limit: usize) -> StorageFuture<'_, Vec<DeliveryRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Box::pin(async move { self.storage.delivery_records.find_pending(limit).await })
    }
}

/// In-memory storage for tests.
pub mod mock {
    use std::collections::HashMap;

    use hookrelay_core::CoreError;
    use tokio::sync::RwLock;

    use super::*;

    #[derive(Default)]
    struct State {
        endpoints: HashMap<EndpointId, Endpoint>,
        records: HashMap<DeliveryRecordId, DeliveryRecord>,
        record_order: Vec<DeliveryRecordId>,
        fail_next: Option<String>,
    }

    /// In-memory `DeliveryStorage` with inspection helpers and error
    /// injection. Clones share state.
    #[derive(Clone, Default)]
    pub struct MockDeliveryStorage {
        state: Arc<RwLock<State>>,
    }

    impl MockDeliveryStorage {
        /// Creates empty storage.
        pub fn new() -> Self {
            Self::default()
        }

        /// Inserts or replaces an endpoint directly.
        pub async fn insert_endpoint(&self, endpoint: Endpoint) {
            self.state.write().await.endpoints.insert(endpoint.id, endpoint);
        }

        /// Inserts or replaces a delivery record directly.
        pub async fn insert_delivery_record(&self, record: DeliveryRecord) {
            let mut state = self.state.write().await;
            if !state.records.contains_key(&record.id) {
                state.record_order.push(record.id);
            }
            state.records.insert(record.id, record);
        }

        /// Current copy of an endpoint.
        pub async fn endpoint(&self, id: EndpointId) -> Option<Endpoint> {
            self.state.read().await.endpoints.get(&id).cloned()
        }

        /// Current copy of a delivery record.
        pub async fn delivery_record(&self, id: DeliveryRecordId) -> Option<DeliveryRecord> {
            self.state.read().await.records.get(&id).cloned()
        }

        /// All records for an endpoint in creation order.
        pub async fn records_for_endpoint(&self, endpoint_id: EndpointId) -> Vec<DeliveryRecord> {
            let state = self.state.read().await;
            state
                .record_order
                .iter()
                .filter_map(|id| state.records.get(id))
                .filter(|record| record.endpoint_id == endpoint_id)
                .cloned()
                .collect()
        }

        /// Total number of delivery records.
        pub async fn record_count(&self) -> usize {
            self.state.read().await.records.len()
        }

        /// Removes a delivery record, simulating external cleanup.
        pub async fn remove_delivery_record(&self, id: DeliveryRecordId) {
            let mut state = self.state.write().await;
            state.records.remove(&id);
            state.record_order.retain(|existing| *existing != id);
        }

        /// Makes the next storage call fail with a database error.
        pub async fn fail_next(&self, message: impl Into<String>) {
            self.state.write().await.fail_next = Some(message.into());
        }

        fn take_failure(state: &mut State) -> Result<()> {
            match state.fail_next.take() {
                Some(message) => Err(CoreError::Database(message)),
                None => Ok(()),
            }
        }
    }

    impl DeliveryStorage for MockDeliveryStorage {
        fn create_endpoint(&self, endpoint: Endpoint) -> StorageFuture<'_, EndpointId> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                Self::take_failure(&mut state)?;
                if state.endpoints.contains_key(&endpoint.id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "endpoint {} already exists",
                        endpoint.id
                    )));
                }
                let id = endpoint.id;
                state.endpoints.insert(id, endpoint);
                Ok(id)
            })
        }

        fn list_enabled_endpoints(&self) -> StorageFuture<'_, Vec<Endpoint>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                Self::take_failure(&mut state)?;
                let mut endpoints: Vec<Endpoint> =
                    state.endpoints.values().filter(|e| e.enabled).cloned().collect();
                endpoints.sort_by_key(|e| e.created_at);
                Ok(endpoints)
            })
        }

        fn find_endpoint(&self, id: EndpointId) -> StorageFuture<'_, Option<Endpoint>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                Self::take_failure(&mut state)?;
                Ok(state.endpoints.get(&id).cloned())
            })
        }

        fn update_endpoint(
            &self,
            id: EndpointId,
            update: EndpointUpdate,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, Option<Endpoint>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                Self::take_failure(&mut state)?;
                Ok(state.endpoints.get_mut(&id).map(|endpoint| {
                    update.apply_to(endpoint, now);
                    endpoint.clone()
                }))
            })
        }

        fn delete_endpoint(&self, id: EndpointId) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                Self::take_failure(&mut state)?;
                Ok(state.endpoints.remove(&id).is_some())
            })
        }

        fn create_delivery_records(
            &self,
            records: Vec<DeliveryRecord>,
        ) -> StorageFuture<'_, Vec<DeliveryRecordId>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                Self::take_failure(&mut state)?;
                let ids = records.iter().map(|r| r.id).collect();
                for record in records {
                    state.record_order.push(record.id);
                    state.records.insert(record.id, record);
                }
                Ok(ids)
            })
        }

        fn find_delivery_record(
            &self,
            id: DeliveryRecordId,
        ) -> StorageFuture<'_, Option<DeliveryRecord>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                Self::take_failure(&mut state)?;
                Ok(state.records.get(&id).cloned())
            })
        }

        fn record_response(
            &self,
            id: DeliveryRecordId,
            response: RecordedResponse,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                Self::take_failure(&mut state)?;
                Ok(state
                    .records
                    .get_mut(&id)
                    .map(|record| {
                        record.response = Some(response);
                        record.next_attempt_at = None;
                        record.updated_at = now;
                    })
                    .is_some())
            })
        }

        fn schedule_attempt(
            &self,
            id: DeliveryRecordId,
            attempt_number: u32,
            due_at: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                Self::take_failure(&mut state)?;
                Ok(state
                    .records
                    .get_mut(&id)
                    .map(|record| {
                        record.attempt_number = attempt_number;
                        record.next_attempt_at = Some(due_at);
                        record.updated_at = now;
                    })
                    .is_some())
            })
        }

        fn settle_delivery_record(
            &self,
            id: DeliveryRecordId,
            gave_up: bool,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                Self::take_failure(&mut state)?;
                Ok(state
                    .records
                    .get_mut(&id)
                    .map(|record| {
                        record.next_attempt_at = None;
                        if gave_up {
                            record.gave_up_at = Some(now);
                        }
                        record.updated_at = now;
                    })
                    .is_some())
            })
        }

        fn find_pending_records(&self, limit: usize) -> StorageFuture<'_, Vec<DeliveryRecord>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                Self::take_failure(&mut state)?;
                let mut pending: Vec<DeliveryRecord> = state
                    .record_order
                    .iter()
                    .filter_map(|id| state.records.get(id))
                    .filter(|record| record.has_pending_attempt())
                    .cloned()
                    .collect();
                pending.sort_by_key(|record| record.next_attempt_at);
                pending.truncate(limit);
                Ok(pending)
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use hookrelay_core::{NewDeliveryRecord, NewEndpoint, TransportErrorCode};
        use serde_json::json;

        use super::*;

        fn record_for(endpoint_id: EndpointId) -> DeliveryRecord {
            NewDeliveryRecord {
                endpoint_id,
                event_type: "order.created".to_string(),
                payload: json!({"id": 1}),
            }
            .into_record(Utc::now())
        }

        #[tokio::test]
        async fn deleting_endpoint_keeps_records() {
            let storage = MockDeliveryStorage::new();
            let endpoint =
                NewEndpoint::new("https://good.example/hook", ["*"]).into_endpoint(Utc::now());
            let endpoint_id = storage.create_endpoint(endpoint).await.unwrap();
            let record_id = storage.create_delivery_record(record_for(endpoint_id)).await.unwrap();

            assert!(storage.delete_endpoint(endpoint_id).await.unwrap());
            assert!(!storage.delete_endpoint(endpoint_id).await.unwrap());

            assert!(storage.find_endpoint(endpoint_id).await.unwrap().is_none());
            assert!(storage.find_delivery_record(record_id).await.unwrap().is_some());
        }

        #[tokio::test]
        async fn pending_records_follow_attempt_bookkeeping() {
            let storage = MockDeliveryStorage::new();
            let endpoint_id = EndpointId::new();
            let now = Utc::now();
            let retried = storage.create_delivery_record(record_for(endpoint_id)).await.unwrap();
            let fresh = storage.create_delivery_record(record_for(endpoint_id)).await.unwrap();
            let exhausted = storage.create_delivery_record(record_for(endpoint_id)).await.unwrap();

            for id in [retried, exhausted] {
                storage
                    .record_response(
                        id,
                        RecordedResponse::Transport { error: TransportErrorCode::Tls },
                        now,
                    )
                    .await
                    .unwrap();
            }
            let due = now + chrono::Duration::minutes(5);
            assert!(storage.schedule_attempt(retried, 2, due, now).await.unwrap());
            assert!(storage.settle_delivery_record(exhausted, true, now).await.unwrap());

            let pending = storage.find_pending_records(10).await.unwrap();
            assert_eq!(pending.iter().map(|r| r.id).collect::<Vec<_>>(), vec![fresh, retried]);
            assert_eq!(pending[1].attempt_number, 2);
            assert_eq!(pending[1].next_attempt_at, Some(due));

            let exhausted = storage.delivery_record(exhausted).await.unwrap();
            assert_eq!(exhausted.gave_up_at, Some(now));
            assert!(!exhausted.has_pending_attempt());
            assert!(!storage.schedule_attempt(DeliveryRecordId::new(), 2, due, now).await.unwrap());
        }

        #[tokio::test]
        async fn injected_failure_applies_once() {
            let storage = MockDeliveryStorage::new();
            storage.fail_next("connection reset").await;

            assert!(matches!(
                storage.list_enabled_endpoints().await,
                Err(CoreError::Database(message)) if message == "connection reset"
            ));
            assert!(storage.list_enabled_endpoints().await.unwrap().is_empty());
        }
    }
}
