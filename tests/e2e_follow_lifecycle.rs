//! E2E tests for the follow lifecycle
//!
//! Cover the full outgoing path: initiate → Follow queued → Accept or
//! Reject applied → optional Undo, including the idempotency and
//! spoofing protections on the receive side.

mod common;

use common::{Harness, wait_until};

use almanac::error::FederationError;
use almanac::resolver::ResolveError;
use almanac::store::{CalendarId, FollowDirection, FollowState, RelationshipStore};

fn cal(id: &str) -> CalendarId {
    CalendarId::new(id)
}

/// Accept activity JSON answering the given follow
fn accept_for(follow_uri: &str, accept_id: &str) -> serde_json::Value {
    serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": accept_id,
        "type": "Accept",
        "actor": "https://remote.example/calendars/alice",
        "object": {
            "id": follow_uri,
            "type": "Follow",
            "actor": "https://local.example/calendars/cal-1",
            "object": "acct:alice@remote.example"
        }
    })
}

#[tokio::test]
async fn initiate_follow_queues_follow_and_creates_pending_relationship() {
    let h = Harness::new();

    let relationship = h
        .state
        .follows
        .initiate_follow(&cal("cal-1"), "alice@remote.example")
        .await
        .unwrap();

    assert_eq!(relationship.state, FollowState::Pending);
    assert_eq!(relationship.direction, FollowDirection::Outgoing);
    assert_eq!(
        relationship.remote_actor.inbox_url.as_str(),
        "https://remote.example/calendars/alice/inbox"
    );

    wait_until("follow delivered", || h.transport.delivery_count() == 1).await;

    let record = &h.transport.deliveries()[0];
    assert_eq!(record.inbox, "https://remote.example/calendars/alice/inbox");
    assert_eq!(record.body["type"], "Follow");
    assert_eq!(record.body["actor"], "https://local.example/calendars/cal-1");
    assert_eq!(record.body["object"], "acct:alice@remote.example");
    assert_eq!(
        record.body["id"],
        relationship.follow_activity_uri.as_str()
    );
}

#[tokio::test]
async fn self_follow_is_rejected_regardless_of_casing() {
    let h = Harness::new();

    let result = h
        .state
        .follows
        .initiate_follow(&cal("cal-1"), "cal-1@local.example")
        .await;
    assert!(matches!(result, Err(FederationError::SelfFollow)));

    let shouted = h
        .state
        .follows
        .initiate_follow(&cal("cal-1"), "CAL-1@LOCAL.EXAMPLE")
        .await;
    assert!(matches!(shouted, Err(FederationError::SelfFollow)));

    // no state mutated, nothing queued
    let relationships = h.store.list_for_calendar(&cal("cal-1")).await.unwrap();
    assert!(relationships.is_empty());
    assert_eq!(h.transport.delivery_count(), 0);
}

#[tokio::test]
async fn duplicate_follow_is_rejected_while_pending() {
    let h = Harness::new();

    h.state
        .follows
        .initiate_follow(&cal("cal-1"), "alice@remote.example")
        .await
        .unwrap();

    let duplicate = h
        .state
        .follows
        .initiate_follow(&cal("cal-1"), "alice@remote.example")
        .await;
    assert!(matches!(duplicate, Err(FederationError::DuplicateFollow)));
}

#[tokio::test]
async fn resolver_failure_creates_no_relationship() {
    let h = Harness::new();
    h.discovery.fail_domain(
        "dead.example",
        ResolveError::Unreachable("connect timed out".to_string()),
    );

    let result = h
        .state
        .follows
        .initiate_follow(&cal("cal-1"), "bob@dead.example")
        .await;

    assert!(matches!(result, Err(FederationError::RemoteUnreachable(_))));
    let relationships = h.store.list_for_calendar(&cal("cal-1")).await.unwrap();
    assert!(relationships.is_empty());
    assert_eq!(h.transport.delivery_count(), 0);
}

#[tokio::test]
async fn accept_transitions_pending_to_accepted_exactly_once() {
    let h = Harness::new();

    let relationship = h
        .state
        .follows
        .initiate_follow(&cal("cal-1"), "alice@remote.example")
        .await
        .unwrap();

    let accept = accept_for(
        relationship.follow_activity_uri.as_str(),
        "https://remote.example/accepts/1",
    );

    h.state
        .inbox
        .receive(h.signed_envelope(&accept))
        .await
        .unwrap();

    let stored = h.store.get(&relationship.id).await.unwrap().unwrap();
    assert_eq!(stored.state, FollowState::Accepted);
    assert!(stored.responded_at.is_some());

    // a second delivery of the same Accept id is an acknowledged no-op
    h.state
        .inbox
        .receive(h.signed_envelope(&accept))
        .await
        .unwrap();

    let stored = h.store.get(&relationship.id).await.unwrap().unwrap();
    assert_eq!(stored.state, FollowState::Accepted);

    let accepted_events = h
        .notifier
        .relationship_events()
        .into_iter()
        .filter(|rel| rel.state == FollowState::Accepted)
        .count();
    assert_eq!(accepted_events, 1);
}

#[tokio::test]
async fn reject_transitions_pending_to_rejected_and_frees_the_pair() {
    let h = Harness::new();

    let relationship = h
        .state
        .follows
        .initiate_follow(&cal("cal-1"), "alice@remote.example")
        .await
        .unwrap();

    let reject = serde_json::json!({
        "id": "https://remote.example/rejects/1",
        "type": "Reject",
        "actor": "https://remote.example/calendars/alice",
        "object": relationship.follow_activity_uri.as_str()
    });
    h.state
        .inbox
        .receive(h.signed_envelope(&reject))
        .await
        .unwrap();

    let stored = h.store.get(&relationship.id).await.unwrap().unwrap();
    assert_eq!(stored.state, FollowState::Rejected);

    // a rejected relationship is terminal, so a fresh follow may start
    let renewed = h
        .state
        .follows
        .initiate_follow(&cal("cal-1"), "alice@remote.example")
        .await;
    assert!(renewed.is_ok());
}

#[tokio::test]
async fn accept_for_unknown_follow_is_relationship_not_found() {
    let h = Harness::new();

    let accept = accept_for(
        "https://local.example/federation/follow/does-not-exist",
        "https://remote.example/accepts/9",
    );

    let result = h.state.inbox.receive(h.signed_envelope(&accept)).await;
    assert!(matches!(
        result,
        Err(FederationError::RelationshipNotFound)
    ));
}

#[tokio::test]
async fn accept_from_the_wrong_actor_is_treated_as_not_found() {
    let h = Harness::new();

    let relationship = h
        .state
        .follows
        .initiate_follow(&cal("cal-1"), "alice@remote.example")
        .await
        .unwrap();

    // mallory answers a follow addressed to alice
    let spoofed = serde_json::json!({
        "id": "https://evil.example/accepts/1",
        "type": "Accept",
        "actor": "https://evil.example/calendars/mallory",
        "object": relationship.follow_activity_uri.as_str()
    });

    let result = h.state.inbox.receive(h.signed_envelope(&spoofed)).await;
    assert!(matches!(
        result,
        Err(FederationError::RelationshipNotFound)
    ));

    let stored = h.store.get(&relationship.id).await.unwrap().unwrap();
    assert_eq!(stored.state, FollowState::Pending);
}

#[tokio::test]
async fn undo_follow_requires_accepted_and_queues_an_undo() {
    let h = Harness::new();

    let relationship = h
        .state
        .follows
        .initiate_follow(&cal("cal-1"), "alice@remote.example")
        .await
        .unwrap();

    // undo before the remote answered is illegal
    let early = h.state.follows.undo_follow(&relationship.id).await;
    assert!(matches!(early, Err(FederationError::Validation(_))));

    let accept = accept_for(
        relationship.follow_activity_uri.as_str(),
        "https://remote.example/accepts/1",
    );
    h.state
        .inbox
        .receive(h.signed_envelope(&accept))
        .await
        .unwrap();

    let undone = h.state.follows.undo_follow(&relationship.id).await.unwrap();
    assert_eq!(undone.state, FollowState::Undone);

    wait_until("undo delivered", || {
        h.transport
            .delivered_types("https://remote.example/calendars/alice/inbox")
            .contains(&"Undo".to_string())
    })
    .await;

    let undo_record = h
        .transport
        .deliveries_to("https://remote.example/calendars/alice/inbox")
        .into_iter()
        .find(|record| record.body["type"] == "Undo")
        .unwrap();
    assert_eq!(
        undo_record.body["object"]["id"],
        relationship.follow_activity_uri.as_str()
    );

    // undone is terminal
    let again = h.state.follows.undo_follow(&relationship.id).await;
    assert!(matches!(again, Err(FederationError::Validation(_))));
}
