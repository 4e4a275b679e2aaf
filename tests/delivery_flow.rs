//! End-to-end exercises of the delivery engine over the in-memory store,
//! observing fan-out through real registry subscriptions.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use chat_sync_service::conversation::{personal_room, ConversationId};
use chat_sync_service::error::AppError;
use chat_sync_service::models::{BlockState, DeliveryStatus, REVOKED_PLACEHOLDER};
use chat_sync_service::services::{DeliveryEngine, SendRequest};
use chat_sync_service::store::memory::MemoryStore;
use chat_sync_service::websocket::message_types::OutboundEvent;
use chat_sync_service::websocket::SessionRegistry;

fn engine() -> (Arc<DeliveryEngine>, SessionRegistry) {
    let store = Arc::new(MemoryStore::new());
    let registry = SessionRegistry::new();
    let engine = Arc::new(DeliveryEngine::new(
        store.clone(),
        store,
        registry.clone(),
        100,
    ));
    (engine, registry)
}

async fn subscribe(registry: &SessionRegistry, rooms: &[&str]) -> (Uuid, Receiver) {
    let (conn, rx) = registry.connect().await;
    for room in rooms {
        registry.join(room, conn).await;
    }
    (conn, Receiver(rx))
}

struct Receiver(UnboundedReceiver<OutboundEvent>);

impl Receiver {
    fn next(&mut self) -> OutboundEvent {
        self.0.try_recv().expect("expected a pending event")
    }

    fn drain(&mut self) -> Vec<OutboundEvent> {
        let mut out = Vec::new();
        while let Ok(evt) = self.0.try_recv() {
            out.push(evt);
        }
        out
    }

    fn assert_empty(&mut self) {
        assert!(self.0.try_recv().is_err(), "expected no pending events");
    }
}

fn send_req(from: &str, to: &str, text: &str) -> SendRequest {
    SendRequest {
        from: from.into(),
        to: to.into(),
        text: Some(text.into()),
        attachment_url: None,
        attachment_kind: None,
        client_temp_id: None,
    }
}

#[tokio::test]
async fn send_fans_out_and_confirms() {
    let (engine, registry) = engine();
    let pair = ConversationId::for_pair("alice", "bob");

    let (alice_conn, mut alice) = subscribe(&registry, &["alice", pair.as_str()]).await;
    let (_, mut bob) = subscribe(&registry, &["bob", pair.as_str()]).await;

    let req = SendRequest {
        client_temp_id: Some("tmp-7".into()),
        ..send_req("alice", "bob", "hello")
    };
    let stored = engine.send(Some(alice_conn), req).await.unwrap();
    assert_eq!(stored.status, DeliveryStatus::Sent);

    // Bob is in both the conversation room and his personal room, so the
    // at-least-once fan-out reaches him twice with the same id.
    let bob_events = bob.drain();
    assert_eq!(bob_events.len(), 2);
    for evt in &bob_events {
        match evt {
            OutboundEvent::MessageReceived { message } => assert_eq!(message.id, stored.id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    // Alice's connection was excluded from the room fan-out and only gets
    // the correlation.
    match alice.next() {
        OutboundEvent::SendConfirmed {
            client_temp_id, id, ..
        } => {
            assert_eq!(client_temp_id.as_deref(), Some("tmp-7"));
            assert_eq!(id, stored.id);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    alice.assert_empty();
}

#[tokio::test]
async fn offline_catchup_groups_by_sender() {
    let (engine, registry) = engine();

    let (_, mut alice) = subscribe(&registry, &["alice"]).await;
    let (_, mut carol) = subscribe(&registry, &["carol"]).await;

    // Bob is offline for all three sends.
    let m1 = engine.send(None, send_req("alice", "bob", "one")).await.unwrap();
    let m2 = engine.send(None, send_req("alice", "bob", "two")).await.unwrap();
    let m3 = engine.send(None, send_req("carol", "bob", "three")).await.unwrap();
    assert_eq!(m1.status, DeliveryStatus::Sent);

    engine.on_connect("bob").await.unwrap();

    match alice.next() {
        OutboundEvent::BulkDelivered { ids, to, status } => {
            assert_eq!(ids, vec![m1.id, m2.id]);
            assert_eq!(to, "bob");
            assert_eq!(status, DeliveryStatus::Delivered);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    alice.assert_empty();

    match carol.next() {
        OutboundEvent::BulkDelivered { ids, .. } => assert_eq!(ids, vec![m3.id]),
        other => panic!("unexpected event: {other:?}"),
    }

    // The sweep is one-shot: a reconnect finds nothing queued.
    engine.on_connect("bob").await.unwrap();
    alice.assert_empty();

    let history = engine.history("alice", "bob", "bob").await.unwrap();
    assert!(history
        .iter()
        .all(|m| m.status == DeliveryStatus::Delivered));
}

#[tokio::test]
async fn mark_read_emits_one_event_per_sweep() {
    let (engine, registry) = engine();
    let pair = ConversationId::for_pair("alice", "bob");
    let (_, mut alice) = subscribe(&registry, &[pair.as_str()]).await;

    for text in ["one", "two", "three"] {
        engine.send(None, send_req("alice", "bob", text)).await.unwrap();
    }
    alice.drain();

    engine.mark_read("alice", "bob").await.unwrap();

    match alice.next() {
        OutboundEvent::MessagesRead { by, read_all_from } => {
            assert_eq!(by, "bob");
            assert_eq!(read_all_from, "alice");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    alice.assert_empty();

    let history = engine.history("alice", "bob", "alice").await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|m| m.status == DeliveryStatus::Read));
}

#[tokio::test]
async fn revoke_redacts_for_both_parties() {
    let (engine, registry) = engine();
    let (_, mut bob) = subscribe(&registry, &["bob"]).await;

    let msg = engine.send(None, send_req("alice", "bob", "oops")).await.unwrap();
    bob.drain();

    engine.revoke(msg.id, Some("alice")).await.unwrap();

    match bob.next() {
        OutboundEvent::MessageRevoked { id } => assert_eq!(id, msg.id),
        other => panic!("unexpected event: {other:?}"),
    }

    for viewer in ["alice", "bob"] {
        let history = engine.history("alice", "bob", viewer).await.unwrap();
        assert_eq!(history[0].body.as_deref(), Some(REVOKED_PLACEHOLDER));
        assert!(history[0].revoked);
    }
}

#[tokio::test]
async fn only_the_sender_may_revoke() {
    let (engine, _registry) = engine();
    let msg = engine.send(None, send_req("alice", "bob", "mine")).await.unwrap();

    let err = engine.revoke(msg.id, Some("bob")).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidRequest(_)));

    let history = engine.history("alice", "bob", "bob").await.unwrap();
    assert_eq!(history[0].body.as_deref(), Some("mine"));
}

#[tokio::test]
async fn revoking_an_unknown_id_is_a_noop() {
    let (engine, _registry) = engine();
    engine.revoke(Uuid::now_v7(), Some("alice")).await.unwrap();
}

#[tokio::test]
async fn bulk_revoke_redacts_every_message() {
    let (engine, registry) = engine();
    let (_, mut bob) = subscribe(&registry, &["bob"]).await;

    let mut ids = Vec::new();
    for text in ["a", "b", "c"] {
        ids.push(engine.send(None, send_req("alice", "bob", text)).await.unwrap().id);
    }
    bob.drain();

    engine.bulk_revoke(&ids, Some("alice")).await.unwrap();

    match bob.next() {
        OutboundEvent::BulkMessageRevoked { ids: got } => assert_eq!(got, ids),
        other => panic!("unexpected event: {other:?}"),
    }
    let history = engine.history("alice", "bob", "bob").await.unwrap();
    assert!(history.iter().all(|m| m.revoked));
}

#[tokio::test]
async fn delete_for_me_notifies_requester_only() {
    let (engine, registry) = engine();
    let (_, mut alice) = subscribe(&registry, &["alice"]).await;
    let (_, mut bob) = subscribe(&registry, &["bob"]).await;

    let msg = engine.send(None, send_req("alice", "bob", "private")).await.unwrap();
    alice.drain();
    bob.drain();

    engine.delete_for_user(msg.id, "bob").await.unwrap();

    match bob.next() {
        OutboundEvent::MessageDeleted { id } => assert_eq!(id, msg.id),
        other => panic!("unexpected event: {other:?}"),
    }
    alice.assert_empty();

    assert!(engine.history("alice", "bob", "bob").await.unwrap().is_empty());
    assert_eq!(engine.history("alice", "bob", "alice").await.unwrap().len(), 1);
}

#[tokio::test]
async fn both_sided_delete_purges_the_record() {
    let (engine, _registry) = engine();
    let msg = engine.send(None, send_req("alice", "bob", "gone")).await.unwrap();

    engine.delete_for_user(msg.id, "alice").await.unwrap();
    engine.delete_for_user(msg.id, "bob").await.unwrap();

    assert!(engine.history("alice", "bob", "alice").await.unwrap().is_empty());
    assert!(engine.history("alice", "bob", "bob").await.unwrap().is_empty());

    // A purged id is unknown from then on; revoking it is a no-op.
    engine.revoke(msg.id, Some("alice")).await.unwrap();
}

#[tokio::test]
async fn blocked_pairs_cannot_exchange_messages() {
    let (engine, _registry) = engine();

    assert!(engine.toggle_block("alice", "bob").await.unwrap());

    for (from, to) in [("alice", "bob"), ("bob", "alice")] {
        let err = engine.send(None, send_req(from, to, "hi")).await.unwrap_err();
        assert!(matches!(err, AppError::Blocked));
    }
    assert!(engine.history("alice", "bob", "alice").await.unwrap().is_empty());

    assert_eq!(
        engine.block_state("alice", "bob").await.unwrap(),
        BlockState::BlockedByMe
    );
    assert_eq!(
        engine.block_state("bob", "alice").await.unwrap(),
        BlockState::BlockedByOther
    );

    // Toggle off restores delivery.
    assert!(!engine.toggle_block("alice", "bob").await.unwrap());
    engine.send(None, send_req("alice", "bob", "hi again")).await.unwrap();
}

#[tokio::test]
async fn mark_delivered_is_idempotent_and_never_regresses() {
    let (engine, registry) = engine();
    let pair = ConversationId::for_pair("alice", "bob");
    let (_, mut alice) = subscribe(&registry, &[pair.as_str()]).await;

    let msg = engine.send(None, send_req("alice", "bob", "hi")).await.unwrap();
    alice.drain();

    engine.mark_delivered(msg.id, "alice", "bob").await.unwrap();
    engine.mark_delivered(msg.id, "alice", "bob").await.unwrap();
    assert_eq!(alice.drain().len(), 2);

    engine.mark_read("alice", "bob").await.unwrap();
    engine.mark_delivered(msg.id, "alice", "bob").await.unwrap();

    let history = engine.history("alice", "bob", "alice").await.unwrap();
    assert_eq!(history[0].status, DeliveryStatus::Read);
}

#[tokio::test]
async fn typing_reaches_the_recipient_only() {
    let (engine, registry) = engine();
    let (alice_conn, mut alice) = subscribe(&registry, &["alice"]).await;
    let (_, mut bob) = subscribe(&registry, &["bob"]).await;

    engine.typing(Some(alice_conn), "alice", "bob", true).await;

    match bob.next() {
        OutboundEvent::UserTyping { from, typing } => {
            assert_eq!(from, "alice");
            assert!(typing);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    alice.assert_empty();
}

#[tokio::test]
async fn clear_conversation_removes_every_trace() {
    let (engine, _registry) = engine();
    for text in ["a", "b"] {
        engine.send(None, send_req("alice", "bob", text)).await.unwrap();
    }

    engine.clear_conversation("alice", "bob").await.unwrap();

    assert!(engine.history("alice", "bob", "alice").await.unwrap().is_empty());
    assert!(engine.history("alice", "bob", "bob").await.unwrap().is_empty());

    // Queued offline deliveries for the pair are gone too.
    engine.on_connect("bob").await.unwrap();
}

#[tokio::test]
async fn pair_traffic_is_invisible_to_lookalike_identities() {
    let (engine, registry) = engine();

    // a third user whose opaque identity spells the pair's room name
    let (_, mut lurker) = subscribe(&registry, &[&personal_room("x|y")]).await;
    let (_, mut y) = subscribe(&registry, &[&personal_room("y")]).await;

    let msg = engine.send(None, send_req("x", "y", "secret")).await.unwrap();

    match y.next() {
        OutboundEvent::MessageReceived { message } => assert_eq!(message.id, msg.id),
        other => panic!("unexpected event: {other:?}"),
    }
    lurker.assert_empty();

    engine.revoke(msg.id, Some("x")).await.unwrap();
    engine.mark_read("x", "y").await.unwrap();
    lurker.assert_empty();
}

#[tokio::test]
async fn send_rejects_self_and_empty_messages() {
    let (engine, _registry) = engine();

    let err = engine.send(None, send_req("alice", "alice", "hi")).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidRequest(_)));

    let empty = SendRequest {
        text: None,
        ..send_req("alice", "bob", "")
    };
    let err = engine.send(None, empty).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidRequest(_)));
}
