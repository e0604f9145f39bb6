//! Property-based tests for backoff, signing and retry decisions.

use chrono::{DateTime, TimeDelta, Utc};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};
use tally_core::{
    AbandonReason, AttemptResult, DeliveryAttempt, EventId, HttpMethod, SigningSecret,
    Subscription, SubscriptionId,
};
use tally_delivery::{
    backoff_delay,
    retry::{decide, RetryDecision},
    sign_payload, verify_signature, DeliveryError,
};

fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 128,
        fork: false,
        failure_persistence: None,
        source_file: None,
        ..ProptestConfig::default()
    }
}

fn epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn subscription(max_retries: u32, base: u32) -> Subscription {
    Subscription {
        id: SubscriptionId::new(),
        name: "prop".to_string(),
        url: "https://example.com/hook".to_string(),
        secret: SigningSecret::new("whsec_prop"),
        patterns: vec![tally_core::EventPattern::Wildcard],
        method: HttpMethod::Post,
        active: true,
        max_retries,
        retry_delay_base_seconds: base,
        timeout_seconds: 30,
        created_at: epoch(),
        updated_at: epoch(),
    }
}

/// Failed attempt `number` of a lineage, attempted at `epoch()`.
fn failed_attempt(subscription: &Subscription, number: u32) -> DeliveryAttempt {
    let mut attempt = DeliveryAttempt::first(
        subscription.id,
        EventId::new(),
        "invoice.paid",
        "{}".to_string(),
        "sha256=00".to_string(),
        epoch(),
    );
    attempt.attempt_number = number;
    attempt.record_failure(AttemptResult::new(epoch()), "HTTP 500").unwrap();
    attempt
}

fn retryable_error() -> impl Strategy<Value = DeliveryError> {
    prop_oneof![
        Just(DeliveryError::network("connection reset")),
        (1u64..120).prop_map(DeliveryError::timeout),
        (400u16..600).prop_map(|status| DeliveryError::application(status, String::new())),
    ]
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn backoff_doubles_with_each_attempt(base in 1u32..3600, attempt in 1u32..20) {
        let current = backoff_delay(base, attempt);
        let next = backoff_delay(base, attempt + 1);
        prop_assert_eq!(next, current * 2);
        prop_assert_eq!(backoff_delay(base, 1), TimeDelta::seconds(i64::from(base)));
    }

    #[test]
    fn backoff_is_capped_and_never_negative(base in 0u32..=u32::MAX, attempt in 0u32..=u32::MAX) {
        let delay = backoff_delay(base, attempt);
        prop_assert!(delay >= TimeDelta::zero());
        prop_assert!(delay <= backoff_delay(base, 21));
    }

    #[test]
    fn signatures_verify_only_with_the_signing_secret(
        secret in "[A-Za-z0-9_]{1,64}",
        other in "[A-Za-z0-9_]{1,64}",
        body in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let signature = sign_payload(&secret, &body).unwrap();
        prop_assert!(signature.starts_with("sha256="));
        prop_assert_eq!(signature.len(), "sha256=".len() + 64);
        prop_assert!(verify_signature(&secret, &body, &signature));
        prop_assert_eq!(verify_signature(&other, &body, &signature), secret == other);
    }

    #[test]
    fn tampered_bodies_fail_verification(
        body in prop::collection::vec(any::<u8>(), 1..256),
        index in any::<prop::sample::Index>(),
    ) {
        let signature = sign_payload("whsec_prop", &body).unwrap();
        let mut tampered = body.clone();
        let i = index.index(tampered.len());
        tampered[i] ^= 0x01;
        prop_assert!(!verify_signature("whsec_prop", &tampered, &signature));
    }

    #[test]
    fn retries_stop_exactly_at_the_budget(
        max_retries in 1u32..=10,
        base in 1u32..600,
        error in retryable_error(),
    ) {
        let subscription = subscription(max_retries, base);

        for number in 1..=max_retries {
            let attempt = failed_attempt(&subscription, number);
            let decision = decide(&attempt, Some(&subscription), &error, epoch());

            if number < max_retries {
                prop_assert_eq!(
                    decision,
                    RetryDecision::Retry { next_retry_at: epoch() + backoff_delay(base, number) }
                );
            } else {
                prop_assert_eq!(
                    decision,
                    RetryDecision::GiveUp { reason: AbandonReason::Exhausted }
                );
            }
        }
    }

    #[test]
    fn configuration_errors_are_never_retried(max_retries in 1u32..=10, number in 1u32..=10) {
        let subscription = subscription(max_retries, 60);
        let attempt = failed_attempt(&subscription, number);
        let error = DeliveryError::configuration("payload too large");

        prop_assert_eq!(
            decide(&attempt, Some(&subscription), &error, epoch()),
            RetryDecision::GiveUp { reason: AbandonReason::NonRetryable }
        );
    }
}
