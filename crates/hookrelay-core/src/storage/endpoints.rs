//! Repository for endpoint registrations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};

use crate::{
    error::Result,
    models::{Endpoint, EndpointId, EndpointUpdate},
};

/// Repository for the `webhook_endpoints` table.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a fully built endpoint.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or the ID already exists.
    pub async fn create(&self, endpoint: &Endpoint) -> Result<EndpointId> {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO webhook_endpoints (id, url, subscriptions, enabled, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            ",
        )
        .bind(endpoint.id)
        .bind(&endpoint.url)
        .bind(Json(&endpoint.subscriptions))
        .bind(endpoint.enabled)
        .bind(endpoint.created_at)
        .bind(endpoint.updated_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Finds an endpoint by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: EndpointId) -> Result<Option<Endpoint>> {
        let endpoint = sqlx::query_as::<_, Endpoint>(
            r"
            SELECT id, url, subscriptions, enabled, created_at, updated_at
            FROM webhook_endpoints
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(endpoint)
    }

    /// Lists enabled endpoints, oldest first.
    ///
    /// Subscription filtering happens in the dispatcher so the match rule
    /// stays in one place.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_enabled(&self) -> Result<Vec<Endpoint>> {
        let endpoints = sqlx::query_as::<_, Endpoint>(
            r"
            SELECT id, url, subscriptions, enabled, created_at, updated_at
            FROM webhook_endpoints
            WHERE enabled = TRUE
            ORDER BY created_at ASC
            ",
        )
        .fetch_all(&*self.pool)
        .await?;

        Ok(endpoints)
    }

    /// Applies a partial update. Returns the updated endpoint, or `None` if
    /// it no longer exists.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn update(
        &self,
        id: EndpointId,
        update: &EndpointUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<Endpoint>> {
        let endpoint = sqlx::query_as::<_, Endpoint>(
            r"
            UPDATE webhook_endpoints
            SET url = COALESCE($2, url),
                subscriptions = COALESCE($3, subscriptions),
                enabled = COALESCE($4, enabled),
                updated_at = $5
            WHERE id = $1
            RETURNING id, url, subscriptions, enabled, created_at, updated_at
            ",
        )
        .bind(id)
        .bind(update.url.as_deref())
        .bind(update.subscriptions.as_ref().map(Json))
        .bind(update.enabled)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(endpoint)
    }

    /// Deletes an endpoint. Returns whether a row was removed.
    ///
    /// Delivery records referencing the endpoint are left in place.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn delete(&self, id: EndpointId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM webhook_endpoints WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
