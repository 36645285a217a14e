//! Repository for delivery records.
//!
//! A record is inserted once per (event, endpoint) pair at fan-out. After
//! that only the latest `response` and the attempt bookkeeping change:
//! `next_attempt_at` is non-null exactly while an attempt is owed, which is
//! what startup recovery scans for.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{DeliveryRecord, DeliveryRecordId, RecordedResponse},
};

/// Repository for the `webhook_deliveries` table.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a record.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create(&self, record: &DeliveryRecord) -> Result<DeliveryRecordId> {
        let mut tx = self.pool.begin().await?;
        let id = Self::insert(&mut tx, record).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Inserts several records in one transaction.
    ///
    /// # Errors
    ///
    /// Returns error if any insert fails; nothing is written in that case.
    pub async fn create_batch(&self, records: &[DeliveryRecord]) -> Result<Vec<DeliveryRecordId>> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            ids.push(Self::insert(&mut tx, record).await?);
        }
        tx.commit().await?;
        Ok(ids)
    }

    async fn insert(
        tx: &mut Transaction<'_, Postgres>,
        record: &DeliveryRecord,
    ) -> Result<DeliveryRecordId> {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO webhook_deliveries (
                id, endpoint_id, event_type, payload, response,
                attempt_number, next_attempt_at, gave_up_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            ",
        )
        .bind(record.id)
        .bind(record.endpoint_id)
        .bind(&record.event_type)
        .bind(Json(&record.payload))
        .bind(record.response.as_ref().map(Json))
        .bind(attempt_column(record.attempt_number))
        .bind(record.next_attempt_at)
        .bind(record.gave_up_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_one(&mut **tx)
        .await?;

        Ok(id)
    }

    /// Finds a record by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: DeliveryRecordId) -> Result<Option<DeliveryRecord>> {
        let record = sqlx::query_as::<_, DeliveryRecord>(
            r"
            SELECT id, endpoint_id, event_type, payload, response,
                   attempt_number, next_attempt_at, gave_up_at, created_at, updated_at
            FROM webhook_deliveries
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(record)
    }

    /// Overwrites the response of the latest attempt and clears the pending
    /// attempt. Returns whether the record still existed.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn record_response(
        &self,
        id: DeliveryRecordId,
        response: &RecordedResponse,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE webhook_deliveries
            SET response = $2, next_attempt_at = NULL, updated_at = $3
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(Json(response))
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Marks `attempt_number` as owed at `due_at`.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn schedule_attempt(
        &self,
        id: DeliveryRecordId,
        attempt_number: u32,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE webhook_deliveries
            SET attempt_number = $2, next_attempt_at = $3, updated_at = $4
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(attempt_column(attempt_number))
        .bind(due_at)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Drops the pending attempt. With `gave_up` the record is also marked
    /// as having exhausted its retries.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn settle(
        &self,
        id: DeliveryRecordId,
        gave_up: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE webhook_deliveries
            SET next_attempt_at = NULL,
                gave_up_at = CASE WHEN $2 THEN $3 ELSE gave_up_at END,
                updated_at = $3
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(gave_up)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Records that still owe an attempt, earliest due first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_pending(&self, limit: i64) -> Result<Vec<DeliveryRecord>> {
        let records = sqlx::query_as::<_, DeliveryRecord>(
            r"
            SELECT id, endpoint_id, event_type, payload, response,
                   attempt_number, next_attempt_at, gave_up_at, created_at, updated_at
            FROM webhook_deliveries
            WHERE next_attempt_at IS NOT NULL
            ORDER BY next_attempt_at ASC, created_at ASC
            LIMIT $1
            ",
        )
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(records)
    }
}

fn attempt_column(attempt_number: u32) -> i32 {
    i32::try_from(attempt_number).unwrap_or(i32::MAX)
}
