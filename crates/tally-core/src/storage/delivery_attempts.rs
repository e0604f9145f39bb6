//! Postgres-backed delivery store.
//!
//! State transitions load the row with `FOR UPDATE`, apply the shared state
//! machine in Rust and write the row back inside the same transaction. Retry
//! claims use `SKIP LOCKED` plus the lineage unique index, so a second
//! claimer either skips the row or loses on insert. The claimed row and its
//! successor are written in one transaction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Executor, PgPool, Postgres, Row};

use crate::{
    attempt::{
        AbandonReason, AttemptQuery, AttemptResult, AttemptState, AttemptStatus, DeliveryAttempt,
        DeliveryStats,
    },
    error::{CoreError, Result},
    models::{AttemptId, EventId, SubscriptionId},
    store::DeliveryStore,
};

const SELECT_ATTEMPT: &str = r"
    SELECT id, subscription_id, event_id, event_type, attempt_number, status,
           next_retry_at, abandon_reason, http_status_code, response_snippet,
           scheduled_at, attempted_at, error_message, payload, signature
    FROM webhook_delivery_attempts a
";

impl<'r> sqlx::FromRow<'r, PgRow> for DeliveryAttempt {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        let status: AttemptStatus = row.try_get("status")?;
        let next_retry_at: Option<DateTime<Utc>> = row.try_get("next_retry_at")?;
        let abandon_reason: Option<String> = row.try_get("abandon_reason")?;

        let state = match status {
            AttemptStatus::Pending => AttemptState::Pending,
            AttemptStatus::Success => AttemptState::Success,
            AttemptStatus::Failed => AttemptState::Failed,
            AttemptStatus::Retrying => AttemptState::Retrying {
                next_retry_at: next_retry_at.ok_or_else(|| {
                    sqlx::Error::Decode("retrying attempt without next_retry_at".into())
                })?,
            },
            AttemptStatus::Abandoned => AttemptState::Abandoned {
                reason: abandon_reason
                    .as_deref()
                    .unwrap_or_default()
                    .parse()
                    .map_err(|e: CoreError| sqlx::Error::Decode(Box::new(e)))?,
            },
        };

        let attempt_number: i32 = row.try_get("attempt_number")?;
        let http_status_code: Option<i32> = row.try_get("http_status_code")?;

        Ok(Self {
            id: row.try_get("id")?,
            subscription_id: row.try_get("subscription_id")?,
            event_id: row.try_get("event_id")?,
            event_type: row.try_get("event_type")?,
            attempt_number: u32::try_from(attempt_number)
                .map_err(|_| sqlx::Error::Decode("attempt_number cannot be negative".into()))?,
            state,
            http_status_code: http_status_code.and_then(|code| u16::try_from(code).ok()),
            response_snippet: row.try_get("response_snippet")?,
            scheduled_at: row.try_get("scheduled_at")?,
            attempted_at: row.try_get("attempted_at")?,
            error_message: row.try_get("error_message")?,
            payload: row.try_get("payload")?,
            signature: row.try_get("signature")?,
        })
    }
}

fn abandon_reason(state: &AttemptState) -> Option<&'static str> {
    match state {
        AttemptState::Abandoned { reason } => Some(reason.as_str()),
        _ => None,
    }
}

/// Delivery store backed by `webhook_delivery_attempts`.
pub struct PostgresDeliveryStore {
    pool: Arc<PgPool>,
}

impl PostgresDeliveryStore {
    /// Creates a new store over the pool.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    async fn insert_impl<'e, E>(&self, executor: E, attempt: &DeliveryAttempt) -> Result<bool>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let inserted: Option<AttemptId> = sqlx::query_scalar(
            r"
            INSERT INTO webhook_delivery_attempts (
                id, subscription_id, event_id, event_type, attempt_number, status,
                next_retry_at, abandon_reason, http_status_code, response_snippet,
                scheduled_at, attempted_at, error_message, payload, signature
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15
            )
            ON CONFLICT (subscription_id, event_id, attempt_number) DO NOTHING
            RETURNING id
            ",
        )
        .bind(attempt.id)
        .bind(attempt.subscription_id)
        .bind(attempt.event_id)
        .bind(&attempt.event_type)
        .bind(i32::try_from(attempt.attempt_number).unwrap_or(i32::MAX))
        .bind(attempt.status())
        .bind(attempt.next_retry_at())
        .bind(abandon_reason(&attempt.state))
        .bind(attempt.http_status_code.map(i32::from))
        .bind(&attempt.response_snippet)
        .bind(attempt.scheduled_at)
        .bind(attempt.attempted_at)
        .bind(&attempt.error_message)
        .bind(&attempt.payload)
        .bind(&attempt.signature)
        .fetch_optional(executor)
        .await?;

        Ok(inserted.is_some())
    }

    async fn update_impl<'e, E>(&self, executor: E, attempt: &DeliveryAttempt) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r"
            UPDATE webhook_delivery_attempts SET
                status = $2,
                next_retry_at = $3,
                abandon_reason = $4,
                http_status_code = $5,
                response_snippet = $6,
                attempted_at = $7,
                error_message = $8
            WHERE id = $1
            ",
        )
        .bind(attempt.id)
        .bind(attempt.status())
        .bind(attempt.next_retry_at())
        .bind(abandon_reason(&attempt.state))
        .bind(attempt.http_status_code.map(i32::from))
        .bind(&attempt.response_snippet)
        .bind(attempt.attempted_at)
        .bind(&attempt.error_message)
        .execute(executor)
        .await?;

        Ok(())
    }

    async fn mutate<F>(&self, id: AttemptId, transition: F) -> Result<DeliveryAttempt>
    where
        F: FnOnce(&mut DeliveryAttempt) -> Result<()> + Send,
    {
        let mut tx = self.pool.begin().await?;

        let sql = format!("{SELECT_ATTEMPT} WHERE id = $1 FOR UPDATE");
        let mut attempt = sqlx::query_as::<_, DeliveryAttempt>(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::not_found("delivery attempt", id))?;

        // An Err here drops the transaction and rolls back the row lock
        transition(&mut attempt)?;

        self.update_impl(&mut *tx, &attempt).await?;
        tx.commit().await?;

        Ok(attempt)
    }
}

#[async_trait]
impl DeliveryStore for PostgresDeliveryStore {
    async fn insert(&self, attempt: DeliveryAttempt) -> Result<()> {
        if self.insert_impl(&*self.pool, &attempt).await? {
            Ok(())
        } else {
            Err(CoreError::ConstraintViolation(format!(
                "attempt {} already exists for subscription {} and event {}",
                attempt.attempt_number, attempt.subscription_id, attempt.event_id
            )))
        }
    }

    async fn find(&self, id: AttemptId) -> Result<Option<DeliveryAttempt>> {
        let sql = format!("{SELECT_ATTEMPT} WHERE id = $1");
        let attempt =
            sqlx::query_as::<_, DeliveryAttempt>(&sql).bind(id).fetch_optional(&*self.pool).await?;
        Ok(attempt)
    }

    async fn find_lineage(
        &self,
        subscription_id: SubscriptionId,
        event_id: EventId,
    ) -> Result<Vec<DeliveryAttempt>> {
        let sql = format!(
            "{SELECT_ATTEMPT} WHERE subscription_id = $1 AND event_id = $2 \
             ORDER BY attempt_number ASC"
        );
        let attempts = sqlx::query_as::<_, DeliveryAttempt>(&sql)
            .bind(subscription_id)
            .bind(event_id)
            .fetch_all(&*self.pool)
            .await?;
        Ok(attempts)
    }

    async fn record_success(
        &self,
        id: AttemptId,
        result: AttemptResult,
    ) -> Result<DeliveryAttempt> {
        self.mutate(id, |attempt| attempt.record_success(result)).await
    }

    async fn record_failure(
        &self,
        id: AttemptId,
        result: AttemptResult,
        error: String,
    ) -> Result<DeliveryAttempt> {
        self.mutate(id, |attempt| attempt.record_failure(result, error)).await
    }

    async fn schedule_retry(
        &self,
        id: AttemptId,
        next_retry_at: DateTime<Utc>,
    ) -> Result<DeliveryAttempt> {
        self.mutate(id, |attempt| attempt.schedule_retry(next_retry_at)).await
    }

    async fn abandon(&self, id: AttemptId, reason: AbandonReason) -> Result<DeliveryAttempt> {
        self.mutate(id, |attempt| attempt.abandon(reason)).await
    }

    async fn abandon_retry(
        &self,
        id: AttemptId,
        reason: AbandonReason,
    ) -> Result<DeliveryAttempt> {
        self.mutate(id, |attempt| attempt.abandon_retry(reason)).await
    }

    async fn find_due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryAttempt>> {
        let sql = format!(
            r"{SELECT_ATTEMPT}
            WHERE a.status = 'retrying'
              AND a.next_retry_at <= $1
              AND NOT EXISTS (
                  SELECT 1 FROM webhook_delivery_attempts n
                  WHERE n.subscription_id = a.subscription_id
                    AND n.event_id = a.event_id
                    AND n.attempt_number = a.attempt_number + 1
              )
            ORDER BY a.next_retry_at ASC, a.attempt_number ASC
            LIMIT $2"
        );
        let attempts = sqlx::query_as::<_, DeliveryAttempt>(&sql)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await?;
        Ok(attempts)
    }

    async fn claim_retry(
        &self,
        id: AttemptId,
        now: DateTime<Utc>,
    ) -> Result<Option<DeliveryAttempt>> {
        let mut tx = self.pool.begin().await?;

        let sql = format!("{SELECT_ATTEMPT} WHERE id = $1 FOR UPDATE SKIP LOCKED");
        let Some(mut claimed) =
            sqlx::query_as::<_, DeliveryAttempt>(&sql).bind(id).fetch_optional(&mut *tx).await?
        else {
            return Ok(None);
        };

        let Ok(next) = claimed.claim_next(now) else {
            return Ok(None);
        };

        if !self.insert_impl(&mut *tx, &next).await? {
            return Ok(None);
        }
        self.update_impl(&mut *tx, &claimed).await?;

        tx.commit().await?;
        Ok(Some(next))
    }

    async fn query(&self, query: &AttemptQuery) -> Result<Vec<DeliveryAttempt>> {
        let sql = format!(
            r"{SELECT_ATTEMPT}
            WHERE ($1::uuid IS NULL OR subscription_id = $1)
              AND ($2::uuid IS NULL OR event_id = $2)
              AND ($3::text IS NULL OR status = $3)
              AND ($4::timestamptz IS NULL OR scheduled_at >= $4)
              AND ($5::timestamptz IS NULL OR scheduled_at < $5)
            ORDER BY scheduled_at DESC, attempt_number DESC
            LIMIT $6"
        );
        let attempts = sqlx::query_as::<_, DeliveryAttempt>(&sql)
            .bind(query.subscription_id)
            .bind(query.event_id)
            .bind(query.status)
            .bind(query.since)
            .bind(query.until)
            .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await?;
        Ok(attempts)
    }

    async fn stats(&self, subscription_id: SubscriptionId) -> Result<DeliveryStats> {
        let counts: Vec<(AttemptStatus, i64)> = sqlx::query_as(
            r"
            SELECT status, COUNT(*)
            FROM webhook_delivery_attempts
            WHERE subscription_id = $1
            GROUP BY status
            ",
        )
        .bind(subscription_id)
        .fetch_all(&*self.pool)
        .await?;

        let mut stats = DeliveryStats::default();
        for (status, count) in counts {
            let count = u64::try_from(count).unwrap_or(0);
            match status {
                AttemptStatus::Pending => stats.pending = count,
                AttemptStatus::Success => stats.success = count,
                AttemptStatus::Failed => stats.failed = count,
                AttemptStatus::Retrying => stats.retrying = count,
                AttemptStatus::Abandoned => stats.abandoned = count,
            }
        }
        Ok(stats)
    }
}
