//! PostgreSQL repositories for endpoints and delivery records.
//!
//! Every query against the two tables lives in this module. Delivery records
//! deliberately carry no foreign key to endpoints: a record must outlive the
//! endpoint it was created for so the worker can observe the deletion.

use std::sync::Arc;

use sqlx::PgPool;

pub mod delivery_records;
pub mod endpoints;

use crate::error::Result;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS webhook_endpoints (
        id UUID PRIMARY KEY,
        url TEXT NOT NULL,
        subscriptions JSONB NOT NULL DEFAULT '["*"]'::jsonb,
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r"
    CREATE TABLE IF NOT EXISTS webhook_deliveries (
        id UUID PRIMARY KEY,
        endpoint_id UUID NOT NULL,
        event_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        response JSONB,
        attempt_number INTEGER NOT NULL DEFAULT 1,
        next_attempt_at TIMESTAMPTZ,
        gave_up_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    ",
    r"
    ALTER TABLE webhook_deliveries
        ADD COLUMN IF NOT EXISTS attempt_number INTEGER NOT NULL DEFAULT 1,
        ADD COLUMN IF NOT EXISTS next_attempt_at TIMESTAMPTZ,
        ADD COLUMN IF NOT EXISTS gave_up_at TIMESTAMPTZ
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_endpoint_id
        ON webhook_deliveries (endpoint_id)
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_next_attempt
        ON webhook_deliveries (next_attempt_at)
        WHERE next_attempt_at IS NOT NULL
    ",
];

/// Container for the repositories, sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Endpoint registrations.
    pub endpoints: Arc<endpoints::Repository>,

    /// Delivery records.
    pub delivery_records: Arc<delivery_records::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates the repositories over `pool`.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            endpoints: Arc::new(endpoints::Repository::new(pool.clone())),
            delivery_records: Arc::new(delivery_records::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Creates the tables and indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if any statement fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&*self.pool).await?;
        }
        Ok(())
    }

    /// Runs a trivial query to verify connectivity.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;
        Ok(())
    }
}
