//! Postgres-backed subscription registry.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{postgres::PgRow, Executor, PgPool, Postgres, Row};
use tracing::info;

use crate::{
    error::{CoreError, Result},
    models::{
        EventPattern, NewSubscription, SigningSecret, Subscription, SubscriptionId,
        SubscriptionUpdate,
    },
    registry::{apply_update, build_subscription, RegistryConfig, SubscriptionRegistry},
    time::Clock,
};

const SELECT_SUBSCRIPTION: &str = r"
    SELECT id, name, url, secret, patterns, method, active,
           max_retries, retry_delay_base_seconds, timeout_seconds,
           created_at, updated_at
    FROM webhook_subscriptions
";

fn to_u32(row: &PgRow, column: &str) -> std::result::Result<u32, sqlx::Error> {
    let value: i32 = row.try_get(column)?;
    u32::try_from(value)
        .map_err(|_| sqlx::Error::Decode(format!("{column} cannot be negative").into()))
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

impl<'r> sqlx::FromRow<'r, PgRow> for Subscription {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        let raw_patterns: Vec<String> = row.try_get("patterns")?;
        let patterns = raw_patterns
            .iter()
            .map(|p| p.parse::<EventPattern>())
            .collect::<Result<Vec<_>>>()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let secret: String = row.try_get("secret")?;

        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            url: row.try_get("url")?,
            secret: SigningSecret::new(secret),
            patterns,
            method: row.try_get("method")?,
            active: row.try_get("active")?,
            max_retries: to_u32(row, "max_retries")?,
            retry_delay_base_seconds: to_u32(row, "retry_delay_base_seconds")?,
            timeout_seconds: to_u32(row, "timeout_seconds")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Subscription registry stored in `webhook_subscriptions`.
pub struct PostgresSubscriptionRegistry {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
}

impl PostgresSubscriptionRegistry {
    /// Creates a new registry over the pool.
    pub fn new(pool: Arc<PgPool>, clock: Arc<dyn Clock>, config: RegistryConfig) -> Self {
        Self { pool, clock, config }
    }

    async fn find_impl<'e, E>(
        &self,
        executor: E,
        id: SubscriptionId,
        lock: bool,
    ) -> Result<Option<Subscription>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let suffix = if lock { "WHERE id = $1 FOR UPDATE" } else { "WHERE id = $1" };
        let sql = format!("{SELECT_SUBSCRIPTION} {suffix}");
        let subscription =
            sqlx::query_as::<_, Subscription>(&sql).bind(id).fetch_optional(executor).await?;
        Ok(subscription)
    }

    async fn write_impl<'e, E>(&self, executor: E, subscription: &Subscription) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let patterns: Vec<String> = subscription.patterns.iter().map(ToString::to_string).collect();

        sqlx::query(
            r"
            INSERT INTO webhook_subscriptions (
                id, name, url, secret, patterns, method, active,
                max_retries, retry_delay_base_seconds, timeout_seconds,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                url = EXCLUDED.url,
                secret = EXCLUDED.secret,
                patterns = EXCLUDED.patterns,
                method = EXCLUDED.method,
                active = EXCLUDED.active,
                max_retries = EXCLUDED.max_retries,
                retry_delay_base_seconds = EXCLUDED.retry_delay_base_seconds,
                timeout_seconds = EXCLUDED.timeout_seconds,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(subscription.id)
        .bind(&subscription.name)
        .bind(&subscription.url)
        .bind(subscription.secret.expose())
        .bind(&patterns)
        .bind(subscription.method)
        .bind(subscription.active)
        .bind(to_i32(subscription.max_retries))
        .bind(to_i32(subscription.retry_delay_base_seconds))
        .bind(to_i32(subscription.timeout_seconds))
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(executor)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl SubscriptionRegistry for PostgresSubscriptionRegistry {
    async fn matching(&self, event_type: &str) -> Result<Vec<Subscription>> {
        let sql = format!(
            "{SELECT_SUBSCRIPTION} WHERE active AND ($1 = ANY(patterns) OR '*' = ANY(patterns)) \
             ORDER BY created_at ASC, id ASC"
        );
        let subscriptions =
            sqlx::query_as::<_, Subscription>(&sql).bind(event_type).fetch_all(&*self.pool).await?;
        Ok(subscriptions)
    }

    async fn find(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        self.find_impl(&*self.pool, id, false).await
    }

    async fn list(&self) -> Result<Vec<Subscription>> {
        let sql = format!("{SELECT_SUBSCRIPTION} ORDER BY created_at ASC, id ASC");
        let subscriptions = sqlx::query_as::<_, Subscription>(&sql).fetch_all(&*self.pool).await?;
        Ok(subscriptions)
    }

    async fn register(&self, new: NewSubscription) -> Result<Subscription> {
        let subscription = build_subscription(new, self.clock.as_ref(), self.config)?;
        self.write_impl(&*self.pool, &subscription).await?;

        info!(
            subscription_id = %subscription.id,
            name = %subscription.name,
            "subscription registered"
        );
        Ok(subscription)
    }

    async fn update(&self, id: SubscriptionId, update: SubscriptionUpdate) -> Result<Subscription> {
        let mut tx = self.pool.begin().await?;
        let current = self
            .find_impl(&mut *tx, id, true)
            .await?
            .ok_or_else(|| CoreError::not_found("subscription", id))?;

        let next = apply_update(&current, update, self.clock.as_ref(), self.config)?;
        self.write_impl(&mut *tx, &next).await?;
        tx.commit().await?;

        info!(subscription_id = %id, "subscription updated");
        Ok(next)
    }

    async fn set_active(&self, id: SubscriptionId, active: bool) -> Result<Subscription> {
        let subscription = sqlx::query_as::<_, Subscription>(
            r"
            UPDATE webhook_subscriptions SET active = $2, updated_at = $3
            WHERE id = $1
            RETURNING id, name, url, secret, patterns, method, active,
                      max_retries, retry_delay_base_seconds, timeout_seconds,
                      created_at, updated_at
            ",
        )
        .bind(id)
        .bind(active)
        .bind(self.clock.now())
        .fetch_optional(&*self.pool)
        .await?
        .ok_or_else(|| CoreError::not_found("subscription", id))?;

        info!(subscription_id = %id, active, "subscription active flag changed");
        Ok(subscription)
    }
}
