//! PostgreSQL access for storage tests.
//!
//! Repository tests run against the database named by `DATABASE_URL` and
//! skip when it is unset, so the default test run needs no server. Each test
//! gets its own small pool; the schema is created once per process.

use std::time::Duration;

use anyhow::{Context, Result};
use hookrelay_core::Storage;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Environment variable naming the test database.
pub const DATABASE_URL_VAR: &str = "DATABASE_URL";

static SCHEMA_READY: OnceCell<()> = OnceCell::const_new();

/// Connection to the test database with the schema in place.
#[derive(Debug, Clone)]
pub struct TestDatabase {
    pool: PgPool,
}

impl TestDatabase {
    /// Connects to `DATABASE_URL`. `None` when the variable is unset.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is set but the database cannot be
    /// reached or the schema cannot be created.
    pub async fn from_env() -> Result<Option<Self>> {
        let Ok(database_url) = std::env::var(DATABASE_URL_VAR) else {
            info!("{DATABASE_URL_VAR} not set, skipping database test");
            return Ok(None);
        };

        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&database_url)
            .await
            .context("failed to connect to test database")?;

        SCHEMA_READY
            .get_or_try_init(|| async {
                Storage::new(pool.clone())
                    .ensure_schema()
                    .await
                    .context("failed to create test schema")?;
                debug!("test database schema ready");
                anyhow::Ok(())
            })
            .await?;

        Ok(Some(Self { pool }))
    }

    /// The connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
