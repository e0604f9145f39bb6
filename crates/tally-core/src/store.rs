//! Delivery store: durable, queryable history of every attempt.
//!
//! The store is the only state shared between workers and the retry
//! scheduler. Each mutation is a compare-and-set through the attempt state
//! machine, applied in a single critical section (a write lock in memory, a
//! row lock in Postgres), so two actors can never both win the same edge.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    attempt::{AbandonReason, AttemptQuery, AttemptResult, DeliveryAttempt, DeliveryStats},
    error::{CoreError, Result},
    models::{AttemptId, EventId, SubscriptionId},
};

/// Storage operations required by the delivery engine.
#[async_trait]
pub trait DeliveryStore: Send + Sync + 'static {
    /// Inserts a new attempt.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` if the lineage already has an
    /// attempt with the same number.
    async fn insert(&self, attempt: DeliveryAttempt) -> Result<()>;

    /// Looks up one attempt.
    async fn find(&self, id: AttemptId) -> Result<Option<DeliveryAttempt>>;

    /// Returns all attempts for one subscription and event, by attempt number.
    async fn find_lineage(
        &self,
        subscription_id: SubscriptionId,
        event_id: EventId,
    ) -> Result<Vec<DeliveryAttempt>>;

    /// Marks a pending attempt as delivered.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` unless the attempt is pending.
    async fn record_success(&self, id: AttemptId, result: AttemptResult) -> Result<DeliveryAttempt>;

    /// Marks a pending attempt as failed.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` unless the attempt is pending.
    async fn record_failure(
        &self,
        id: AttemptId,
        result: AttemptResult,
        error: String,
    ) -> Result<DeliveryAttempt>;

    /// Moves a failed attempt to retrying.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` unless the attempt is failed.
    async fn schedule_retry(
        &self,
        id: AttemptId,
        next_retry_at: DateTime<Utc>,
    ) -> Result<DeliveryAttempt>;

    /// Moves a failed attempt to abandoned.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` unless the attempt is failed.
    async fn abandon(&self, id: AttemptId, reason: AbandonReason) -> Result<DeliveryAttempt>;

    /// Moves a retrying attempt to abandoned.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` unless the attempt is still
    /// retrying, for example when a concurrent sweep already claimed it.
    async fn abandon_retry(&self, id: AttemptId, reason: AbandonReason)
        -> Result<DeliveryAttempt>;

    /// Returns retrying attempts due at `now` that have no successor yet,
    /// earliest first.
    async fn find_due_retries(&self, now: DateTime<Utc>, limit: usize)
        -> Result<Vec<DeliveryAttempt>>;

    /// Atomically claims a due retry: the attempt settles back to failed and
    /// its pending successor is inserted in the same step.
    ///
    /// Returns `None` if the attempt is no longer retrying, is not due, or
    /// another claimer already created the successor.
    async fn claim_retry(&self, id: AttemptId, now: DateTime<Utc>)
        -> Result<Option<DeliveryAttempt>>;

    /// Filters delivery history, newest first.
    async fn query(&self, query: &AttemptQuery) -> Result<Vec<DeliveryAttempt>>;

    /// Counts attempts per status for one subscription.
    async fn stats(&self, subscription_id: SubscriptionId) -> Result<DeliveryStats>;
}

type LineageKey = (SubscriptionId, EventId, u32);

#[derive(Debug, Default)]
struct Attempts {
    by_id: HashMap<AttemptId, DeliveryAttempt>,
    by_lineage: HashMap<LineageKey, AttemptId>,
}

impl Attempts {
    fn insert(&mut self, attempt: DeliveryAttempt) -> Result<()> {
        let key = (attempt.subscription_id, attempt.event_id, attempt.attempt_number);
        if self.by_lineage.contains_key(&key) {
            return Err(CoreError::ConstraintViolation(format!(
                "attempt {} already exists for subscription {} and event {}",
                attempt.attempt_number, attempt.subscription_id, attempt.event_id
            )));
        }
        if self.by_id.contains_key(&attempt.id) {
            return Err(CoreError::ConstraintViolation(format!(
                "attempt id {} already exists",
                attempt.id
            )));
        }
        self.by_lineage.insert(key, attempt.id);
        self.by_id.insert(attempt.id, attempt);
        Ok(())
    }

    fn has_successor(&self, attempt: &DeliveryAttempt) -> bool {
        self.by_lineage.contains_key(&(
            attempt.subscription_id,
            attempt.event_id,
            attempt.attempt_number + 1,
        ))
    }
}

/// Delivery store held in memory.
///
/// Every mutation runs under one write lock, which makes each
/// compare-and-set atomic with respect to all other store calls.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeliveryStore {
    inner: Arc<RwLock<Attempts>>,
}

impl InMemoryDeliveryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every stored attempt in no particular order.
    pub async fn all(&self) -> Vec<DeliveryAttempt> {
        self.inner.read().await.by_id.values().cloned().collect()
    }

    async fn mutate(
        &self,
        id: AttemptId,
        transition: impl FnOnce(&mut DeliveryAttempt) -> Result<()> + Send,
    ) -> Result<DeliveryAttempt> {
        let mut guard = self.inner.write().await;
        let stored =
            guard.by_id.get_mut(&id).ok_or_else(|| CoreError::not_found("delivery attempt", id))?;

        let mut next = stored.clone();
        transition(&mut next)?;
        *stored = next.clone();
        Ok(next)
    }
}

#[async_trait]
impl DeliveryStore for InMemoryDeliveryStore {
    async fn insert(&self, attempt: DeliveryAttempt) -> Result<()> {
        self.inner.write().await.insert(attempt)
    }

    async fn find(&self, id: AttemptId) -> Result<Option<DeliveryAttempt>> {
        Ok(self.inner.read().await.by_id.get(&id).cloned())
    }

    async fn find_lineage(
        &self,
        subscription_id: SubscriptionId,
        event_id: EventId,
    ) -> Result<Vec<DeliveryAttempt>> {
        let guard = self.inner.read().await;
        let mut lineage: Vec<DeliveryAttempt> = guard
            .by_id
            .values()
            .filter(|a| a.subscription_id == subscription_id && a.event_id == event_id)
            .cloned()
            .collect();
        lineage.sort_by_key(|a| a.attempt_number);
        Ok(lineage)
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
        let guard = self.inner.read().await;
        let mut due: Vec<DeliveryAttempt> = guard
            .by_id
            .values()
            .filter(|a| a.next_retry_at().is_some_and(|at| at <= now) && !guard.has_successor(a))
            .cloned()
            .collect();
        due.sort_by_key(|a| (a.next_retry_at(), a.attempt_number));
        due.truncate(limit);
        Ok(due)
    }

    async fn claim_retry(
        &self,
        id: AttemptId,
        now: DateTime<Utc>,
    ) -> Result<Option<DeliveryAttempt>> {
        let mut guard = self.inner.write().await;
        let Some(current) = guard.by_id.get(&id) else {
            return Err(CoreError::not_found("delivery attempt", id));
        };

        if guard.has_successor(current) {
            return Ok(None);
        }

        let mut claimed = current.clone();
        let Ok(next) = claimed.claim_next(now) else {
            return Ok(None);
        };

        guard.insert(next.clone())?;
        guard.by_id.insert(claimed.id, claimed);
        Ok(Some(next))
    }

    async fn query(&self, query: &AttemptQuery) -> Result<Vec<DeliveryAttempt>> {
        let guard = self.inner.read().await;
        let mut found: Vec<DeliveryAttempt> =
            guard.by_id.values().filter(|a| query.matches(a)).cloned().collect();
        found.sort_by(|a, b| {
            b.scheduled_at.cmp(&a.scheduled_at).then(b.attempt_number.cmp(&a.attempt_number))
        });
        found.truncate(query.limit);
        Ok(found)
    }

    async fn stats(&self, subscription_id: SubscriptionId) -> Result<DeliveryStats> {
        let guard = self.inner.read().await;
        let mut stats = DeliveryStats::default();
        for attempt in guard.by_id.values().filter(|a| a.subscription_id == subscription_id) {
            stats.record(attempt.status());
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::attempt::AttemptStatus;

    fn attempt(subscription_id: SubscriptionId, event_id: EventId) -> DeliveryAttempt {
        DeliveryAttempt::first(
            subscription_id,
            event_id,
            "task.completed",
            r#"{"event_type":"task.completed"}"#.to_string(),
            "sha256=ab".to_string(),
            Utc::now(),
        )
    }

    async fn retrying(store: &InMemoryDeliveryStore, at: DateTime<Utc>) -> DeliveryAttempt {
        let first = attempt(SubscriptionId::new(), EventId::new());
        store.insert(first.clone()).await.unwrap();
        store
            .record_failure(
                first.id,
                AttemptResult::new(at).with_response(500, b"boom"),
                "HTTP 500".into(),
            )
            .await
            .unwrap();
        store.schedule_retry(first.id, at + TimeDelta::seconds(60)).await.unwrap()
    }

    #[tokio::test]
    async fn duplicate_attempt_numbers_are_rejected() {
        let store = InMemoryDeliveryStore::new();
        let (subscription_id, event_id) = (SubscriptionId::new(), EventId::new());
        store.insert(attempt(subscription_id, event_id)).await.unwrap();

        let err = store.insert(attempt(subscription_id, event_id)).await.unwrap_err();
        assert!(matches!(err, CoreError::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn failed_transition_leaves_attempt_unchanged() {
        let store = InMemoryDeliveryStore::new();
        let first = attempt(SubscriptionId::new(), EventId::new());
        store.insert(first.clone()).await.unwrap();

        assert!(store.abandon(first.id, AbandonReason::Exhausted).await.is_err());
        assert_eq!(store.find(first.id).await.unwrap().unwrap(), first);
    }

    #[tokio::test]
    async fn retry_can_only_be_claimed_once() {
        let store = InMemoryDeliveryStore::new();
        let now = Utc::now();
        let retrying = retrying(&store, now).await;
        let due_at = now + TimeDelta::seconds(60);

        assert!(store.claim_retry(retrying.id, now).await.unwrap().is_none(), "not due yet");

        let next = store.claim_retry(retrying.id, due_at).await.unwrap().unwrap();
        assert_eq!(next.attempt_number, 2);
        assert!(store.claim_retry(retrying.id, due_at).await.unwrap().is_none());

        let lineage =
            store.find_lineage(retrying.subscription_id, retrying.event_id).await.unwrap();
        assert_eq!(lineage.len(), 2);
        assert_eq!(lineage[0].status(), AttemptStatus::Failed);
        assert_eq!(lineage[0].next_retry_at(), None);
        assert_eq!(lineage[1].status(), AttemptStatus::Pending);
    }

    #[tokio::test]
    async fn claimed_retries_no_longer_count_as_retrying() {
        let store = InMemoryDeliveryStore::new();
        let now = Utc::now();
        let retrying = retrying(&store, now).await;
        let subscription_id = retrying.subscription_id;
        assert_eq!(store.stats(subscription_id).await.unwrap().retrying, 1);

        let next = store.claim_retry(retrying.id, now + TimeDelta::seconds(60)).await.unwrap();
        let ok = AttemptResult::new(now).with_response(200, b"");
        store.record_success(next.unwrap().id, ok).await.unwrap();

        let stats = store.stats(subscription_id).await.unwrap();
        assert_eq!(stats, DeliveryStats { failed: 1, success: 1, ..DeliveryStats::default() });

        let retrying_rows = AttemptQuery::default()
            .for_subscription(subscription_id)
            .with_status(AttemptStatus::Retrying);
        assert!(store.query(&retrying_rows).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claimed_retry_cannot_be_abandoned_as_a_retry() {
        let store = InMemoryDeliveryStore::new();
        let now = Utc::now();
        let retrying = retrying(&store, now).await;
        store.claim_retry(retrying.id, now + TimeDelta::seconds(60)).await.unwrap();

        let err = store
            .abandon_retry(retrying.id, AbandonReason::SubscriptionInactive)
            .await
            .unwrap_err();
        assert!(err.is_transition_conflict());
        let stored = store.find(retrying.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), AttemptStatus::Failed);
    }

    #[tokio::test]
    async fn claimed_retries_are_no_longer_due() {
        let store = InMemoryDeliveryStore::new();
        let now = Utc::now();
        let retrying = retrying(&store, now).await;
        let due_at = now + TimeDelta::seconds(60);

        assert!(store.find_due_retries(now, 10).await.unwrap().is_empty());
        assert_eq!(store.find_due_retries(due_at, 10).await.unwrap().len(), 1);

        store.claim_retry(retrying.id, due_at).await.unwrap();
        assert!(store.find_due_retries(due_at, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_claims_create_one_successor() {
        let store = InMemoryDeliveryStore::new();
        let now = Utc::now();
        let retrying = retrying(&store, now).await;
        let due_at = now + TimeDelta::seconds(60);
        let id = retrying.id;

        let claims: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.claim_retry(id, due_at).await })
            })
            .collect();

        let mut winners = 0;
        for claim in claims {
            if claim.await.unwrap().unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn query_and_stats_follow_subscription() {
        let store = InMemoryDeliveryStore::new();
        let subscription_id = SubscriptionId::new();
        for _ in 0..3 {
            store.insert(attempt(subscription_id, EventId::new())).await.unwrap();
        }
        store.insert(attempt(SubscriptionId::new(), EventId::new())).await.unwrap();

        let query = AttemptQuery::default().for_subscription(subscription_id);
        let found = store.query(&query).await.unwrap();
        assert_eq!(found.len(), 3);

        let limited = store
            .query(&AttemptQuery::default().for_subscription(subscription_id).limit(2))
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);

        let stats = store.stats(subscription_id).await.unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.total(), 3);
    }
}
