//! Fan-out from emitted events to matching subscriptions.

use std::collections::HashSet;

use tally_core::{AttemptStatus, DeliveryStore, SubscriptionRegistry};
use tally_delivery::verify_signature;
use tally_testing::{EventBuilder, TestEnv};
use wiremock::{matchers, Mock, ResponseTemplate};

#[tokio::test]
async fn exact_and_wildcard_subscriptions_each_get_one_attempt() {
    let mut env = TestEnv::new().await.unwrap();
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&env.http)
        .await;

    let exact = env.subscribe(env.subscription().patterns(["invoice.paid"])).await.unwrap();
    let wildcard = env.subscribe(env.subscription().patterns(["*"])).await.unwrap();
    let unrelated = env.subscribe(env.subscription().patterns(["invoice.voided"])).await.unwrap();

    env.start().await.unwrap();
    let event_id = env.emit(EventBuilder::new("invoice.paid").build()).unwrap();

    env.wait_for_attempt(exact.id, event_id, 1, AttemptStatus::Success).await.unwrap();
    env.wait_for_attempt(wildcard.id, event_id, 1, AttemptStatus::Success).await.unwrap();

    let attempts = env
        .store
        .query(&tally_core::AttemptQuery::default().for_event(event_id))
        .await
        .unwrap();
    assert_eq!(attempts.len(), 2);
    assert!(env.lineage(unrelated.id, event_id).await.unwrap().is_empty());

    let subscribers: HashSet<_> = attempts.iter().map(|a| a.subscription_id).collect();
    assert_eq!(subscribers, HashSet::from([exact.id, wildcard.id]));

    env.shutdown().await.unwrap();
}

#[tokio::test]
async fn each_subscriber_receives_its_own_signature() {
    let mut env = TestEnv::new().await.unwrap();
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&env.http)
        .await;

    env.subscribe(env.subscription().name("billing").secret("whsec_billing")).await.unwrap();
    env.subscribe(env.subscription().name("audit").secret("whsec_audit")).await.unwrap();

    env.start().await.unwrap();
    env.emit(EventBuilder::new("task.completed").build()).unwrap();

    let requests = env.wait_for_requests(2).await.unwrap();
    assert_eq!(requests.len(), 2);

    // Same body for both, signed with different secrets.
    assert_eq!(requests[0].body, requests[1].body);
    let mut verified = Vec::new();
    for request in &requests {
        let signature = request.headers.get("X-Webhook-Signature").unwrap().to_str().unwrap();
        let secret = ["whsec_billing", "whsec_audit"]
            .into_iter()
            .find(|secret| verify_signature(secret, &request.body, signature))
            .expect("signature matches one of the secrets");
        verified.push(secret);
    }
    verified.sort_unstable();
    assert_eq!(verified, vec!["whsec_audit", "whsec_billing"]);

    env.shutdown().await.unwrap();
}

#[tokio::test]
async fn disabled_subscription_is_skipped() {
    let mut env = TestEnv::new().await.unwrap();
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&env.http)
        .await;

    let active = env.subscribe(env.subscription()).await.unwrap();
    let disabled = env.subscribe(env.subscription()).await.unwrap();
    env.registry.set_active(disabled.id, false).await.unwrap();

    env.start().await.unwrap();
    let event_id = env.emit(EventBuilder::new("invoice.paid").build()).unwrap();

    env.wait_for_attempt(active.id, event_id, 1, AttemptStatus::Success).await.unwrap();
    assert!(env.lineage(disabled.id, event_id).await.unwrap().is_empty());

    env.shutdown().await.unwrap();
}

#[tokio::test]
async fn emitting_the_same_event_twice_delivers_once() {
    let mut env = TestEnv::new().await.unwrap();
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&env.http)
        .await;

    let subscription = env.subscribe(env.subscription()).await.unwrap();
    env.start().await.unwrap();

    let event = EventBuilder::new("invoice.paid").build();
    let event_id = env.emit(event.clone()).unwrap();
    env.emit(event).unwrap();

    env.wait_for_attempt(subscription.id, event_id, 1, AttemptStatus::Success).await.unwrap();
    let env_ref = &env;
    tally_testing::wait_until(tally_testing::DEFAULT_WAIT, || async move {
        (env_ref.stats().duplicates_suppressed == 1).then_some(())
    })
    .await
    .expect("second emit suppressed");

    assert_eq!(env.lineage(subscription.id, event_id).await.unwrap().len(), 1);
    assert_eq!(env.stats().events_accepted, 2);

    env.shutdown().await.unwrap();
}

#[tokio::test]
async fn event_without_subscribers_creates_nothing() {
    let mut env = TestEnv::new().await.unwrap();
    env.subscribe(env.subscription().patterns(["invoice.paid"])).await.unwrap();

    let event = EventBuilder::new("user.created").build();
    let attempts = env.engine().dispatcher().dispatch(&event).await.unwrap();
    assert!(attempts.is_empty());

    env.start().await.unwrap();
    env.shutdown().await.unwrap();
}
