//! Property-based tests for subscription matching and the attempt state
//! machine.
//!
//! Everything here runs in memory; no database is needed.

use chrono::{DateTime, TimeDelta, Utc};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};
use tally_core::{
    attempt::{truncate_snippet, MAX_SNIPPET_BYTES},
    AbandonReason, AttemptResult, AttemptStatus, DeliveryAttempt, EventId, EventPattern,
    SubscriptionId,
};

fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 64,
        fork: false,
        failure_persistence: None,
        source_file: None,
        ..ProptestConfig::default()
    }
}

fn event_type_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,10}(\\.[a-z][a-z0-9_]{0,10}){0,2}").unwrap()
}

/// One externally requested transition.
#[derive(Debug, Clone, Copy)]
enum Action {
    Succeed,
    Fail,
    Retry,
    Abandon,
    Claim,
}

fn action_strategy() -> impl Strategy<Value = Vec<Action>> {
    prop::collection::vec(
        prop::sample::select(vec![
            Action::Succeed,
            Action::Fail,
            Action::Retry,
            Action::Abandon,
            Action::Claim,
        ]),
        1..20,
    )
}

fn base_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn first_attempt() -> DeliveryAttempt {
    DeliveryAttempt::first(
        SubscriptionId::new(),
        EventId::new(),
        "project.updated",
        "{}".to_string(),
        "sha256=00".to_string(),
        base_time(),
    )
}

/// Applies an action, returning the successor attempt for claims.
fn apply(attempt: &mut DeliveryAttempt, action: Action) -> Option<DeliveryAttempt> {
    let now = base_time() + TimeDelta::hours(1);
    match action {
        Action::Succeed => {
            let _ = attempt.record_success(AttemptResult::new(now).with_response(200, b"ok"));
        },
        Action::Fail => {
            let _ = attempt.record_failure(AttemptResult::new(now), "connection refused");
        },
        Action::Retry => {
            let _ = attempt.schedule_retry(now);
        },
        Action::Abandon => {
            let _ = attempt.abandon(AbandonReason::Exhausted);
            let _ = attempt.abandon_retry(AbandonReason::SubscriptionInactive);
        },
        Action::Claim => return attempt.claim_next(now).ok(),
    }
    None
}

proptest! {
    #![proptest_config(proptest_config())]

    /// The wildcard selects every event type; an exact pattern only itself.
    #[test]
    fn pattern_matching_is_exact_or_wildcard(
        subscribed in event_type_strategy(),
        emitted in event_type_strategy(),
    ) {
        let exact: EventPattern = subscribed.parse().unwrap();
        prop_assert!(EventPattern::Wildcard.matches(&emitted));
        prop_assert_eq!(exact.matches(&emitted), subscribed == emitted);
    }

    /// Once an attempt is terminal no action changes it.
    #[test]
    fn terminal_attempts_never_change(actions in action_strategy()) {
        let mut attempt = first_attempt();

        for action in actions {
            let before = attempt.clone();
            let was_terminal = attempt.is_terminal();
            let _ = apply(&mut attempt, action);

            if was_terminal {
                prop_assert_eq!(&attempt, &before);
            }
        }
    }

    /// A retry time exists exactly while the attempt is retrying.
    #[test]
    fn next_retry_at_tracks_retrying_status(actions in action_strategy()) {
        let mut attempt = first_attempt();

        for action in actions {
            let _ = apply(&mut attempt, action);
            prop_assert_eq!(
                attempt.next_retry_at().is_some(),
                attempt.status() == AttemptStatus::Retrying
            );
        }
    }

    /// Successors only ever come from retrying attempts and number N+1, and
    /// the claimed attempt is left failed rather than retrying.
    #[test]
    fn successors_increment_attempt_number(actions in action_strategy()) {
        let mut attempt = first_attempt();

        for action in actions {
            let status = attempt.status();
            if let Some(next) = apply(&mut attempt, action) {
                prop_assert_eq!(status, AttemptStatus::Retrying);
                prop_assert_eq!(attempt.status(), AttemptStatus::Failed);
                prop_assert!(attempt.next_retry_at().is_none());
                prop_assert_eq!(next.attempt_number, attempt.attempt_number + 1);
                prop_assert_eq!(next.status(), AttemptStatus::Pending);
                attempt = next;
            }
        }
    }

    /// Stored response snippets never exceed the size limit.
    #[test]
    fn snippets_are_bounded(body in prop::collection::vec(any::<u8>(), 0..4096)) {
        let snippet = truncate_snippet(&body);
        prop_assert!(snippet.len() <= MAX_SNIPPET_BYTES);

        let decoded = String::from_utf8_lossy(&body).into_owned();
        if decoded.len() <= MAX_SNIPPET_BYTES {
            prop_assert_eq!(snippet, decoded);
        } else {
            prop_assert!(snippet.ends_with("... (truncated)"));
        }
    }
}
