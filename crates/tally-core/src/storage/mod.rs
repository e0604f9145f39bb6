//! PostgreSQL implementations of the registry and delivery store.
//!
//! All SQL lives in this module. Queries are runtime-checked (`sqlx::query*`
//! with `.bind`) so the crate builds without a database.

use std::sync::Arc;

use sqlx::PgPool;

pub mod delivery_attempts;
pub mod subscriptions;

pub use delivery_attempts::PostgresDeliveryStore;
pub use subscriptions::PostgresSubscriptionRegistry;

use crate::{error::Result, registry::RegistryConfig, time::Clock};

/// Container for the Postgres-backed repositories sharing one pool.
#[derive(Clone)]
pub struct Storage {
    /// Subscription registry.
    pub subscriptions: Arc<PostgresSubscriptionRegistry>,

    /// Delivery attempt history.
    pub delivery_attempts: Arc<PostgresDeliveryStore>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates repositories over the given pool.
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>, config: RegistryConfig) -> Self {
        let pool = Arc::new(pool);

        Self {
            subscriptions: Arc::new(PostgresSubscriptionRegistry::new(pool.clone(), clock, config)),
            delivery_attempts: Arc::new(PostgresDeliveryStore::new(pool.clone())),
            pool,
        }
    }

    /// Verifies the database answers.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;
        Ok(())
    }
}

/// Advisory lock key serializing concurrent migration runs.
const MIGRATION_LOCK_KEY: i64 = 0x7461_6c6c_795f_6462;

/// Creates the webhook tables and indexes if they do not exist.
///
/// Runs in one transaction under an advisory lock, so instances starting
/// together do not race on `CREATE ... IF NOT EXISTS`.
///
/// # Errors
///
/// Returns `CoreError::Database` if any statement fails.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS webhook_subscriptions (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            url TEXT NOT NULL,
            secret TEXT NOT NULL,
            patterns TEXT[] NOT NULL,
            method TEXT NOT NULL DEFAULT 'POST',
            active BOOLEAN NOT NULL DEFAULT TRUE,
            max_retries INTEGER NOT NULL CHECK (max_retries BETWEEN 1 AND 10),
            retry_delay_base_seconds INTEGER NOT NULL CHECK (retry_delay_base_seconds > 0),
            timeout_seconds INTEGER NOT NULL CHECK (timeout_seconds > 0),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS webhook_delivery_attempts (
            id UUID PRIMARY KEY,
            subscription_id UUID NOT NULL REFERENCES webhook_subscriptions(id),
            event_id UUID NOT NULL,
            event_type TEXT NOT NULL,
            attempt_number INTEGER NOT NULL CHECK (attempt_number >= 1),
            status TEXT NOT NULL,
            next_retry_at TIMESTAMPTZ,
            abandon_reason TEXT,
            http_status_code INTEGER,
            response_snippet TEXT,
            scheduled_at TIMESTAMPTZ NOT NULL,
            attempted_at TIMESTAMPTZ,
            error_message TEXT,
            payload TEXT NOT NULL,
            signature TEXT NOT NULL,
            UNIQUE (subscription_id, event_id, attempt_number),
            CHECK ((status = 'retrying') = (next_retry_at IS NOT NULL)),
            CHECK ((status = 'abandoned') = (abandon_reason IS NOT NULL))
        )
        ",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_delivery_attempts_due
        ON webhook_delivery_attempts(next_retry_at)
        WHERE status = 'retrying'
        ",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_delivery_attempts_subscription
        ON webhook_delivery_attempts(subscription_id, scheduled_at DESC)
        ",
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
