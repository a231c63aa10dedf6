//! End-to-end exchange between two engines, each holding the other as a
//! contact, with payloads round-tripped through their wire encoding.

use std::sync::Arc;

use driftnet_shared::protocol::SyncPayload;
use driftnet_shared::{AuthorId, ContactId, Group, Message, MessageId, Rating};
use driftnet_sync::{ManualClock, SyncConfig, SyncEngine};

struct Peer {
    engine: Arc<SyncEngine>,
    /// The other peer's contact id on this engine.
    other: ContactId,
}

fn pair() -> (Peer, Peer, Group) {
    let mk = |name: &str| {
        let config = SyncConfig::default();
        let db = driftnet_store::Database::open_in_memory(config.capacity).unwrap();
        let engine = SyncEngine::with_database(db, config, Box::new(ManualClock::new(1_000_000)));
        let other = engine.add_contact(name).unwrap();
        Peer { engine, other }
    };
    let alice = mk("bob");
    let bob = mk("alice");
    let g = Group::new("news", None);

    for peer in [&alice, &bob] {
        peer.engine.subscribe(&g).unwrap();
        peer.engine.set_visibility(g.id, &[peer.other]).unwrap();
    }
    exchange_updates(&alice, &bob);
    exchange_updates(&bob, &alice);
    (alice, bob, g)
}

/// Send every due update and ack from `from` to `to`, through the wire
/// encoding, and return the resulting acks to `from`.
fn exchange_updates(from: &Peer, to: &Peer) {
    if let Some(update) = from.engine.generate_subscription_update(from.other).unwrap() {
        let bytes = SyncPayload::SubscriptionUpdate(update).to_bytes().unwrap();
        let SyncPayload::SubscriptionUpdate(update) = SyncPayload::from_bytes(&bytes).unwrap()
        else {
            panic!("payload changed shape on the wire");
        };
        to.engine
            .receive_subscription_update(to.other, &update)
            .unwrap();
    }
    if let Some(ack) = to.engine.generate_subscription_ack(to.other).unwrap() {
        from.engine
            .receive_subscription_ack(from.other, &ack)
            .unwrap();
    }
    if let Some(update) = from.engine.generate_retention_update(from.other).unwrap() {
        to.engine
            .receive_retention_update(to.other, &update)
            .unwrap();
    }
    if let Some(ack) = to.engine.generate_retention_ack(to.other).unwrap() {
        from.engine.receive_retention_ack(from.other, &ack).unwrap();
    }
    for update in from.engine.generate_transport_updates(from.other).unwrap() {
        to.engine
            .receive_transport_update(to.other, &update)
            .unwrap();
    }
    for ack in to.engine.generate_transport_acks(to.other).unwrap() {
        from.engine.receive_transport_ack(from.other, &ack).unwrap();
    }
}

/// One full anti-entropy round from `from` to `to`: offer, request, batch,
/// ack.  Returns the ids that were transmitted.
fn sync_round(from: &Peer, to: &Peer) -> Vec<MessageId> {
    let Some(offer) = from.engine.generate_offer(from.other).unwrap() else {
        return Vec::new();
    };
    let bytes = SyncPayload::Offer(offer).to_bytes().unwrap();
    let SyncPayload::Offer(offer) = SyncPayload::from_bytes(&bytes).unwrap() else {
        panic!("payload changed shape on the wire");
    };

    let request = to.engine.receive_offer(to.other, &offer).unwrap();
    let wanted: Vec<MessageId> = offer
        .message_ids
        .iter()
        .enumerate()
        .filter(|(i, _)| request.requested(*i))
        .map(|(_, id)| *id)
        .collect();
    if wanted.is_empty() {
        return Vec::new();
    }

    let batch = from
        .engine
        .generate_batch(from.other, 1 << 20, Some(&wanted))
        .unwrap()
        .expect("requested messages should be sendable");
    to.engine.receive_batch(to.other, &batch).unwrap();

    if let Some(ack) = to.engine.generate_ack(to.other).unwrap() {
        from.engine.receive_ack(from.other, &ack).unwrap();
    }
    wanted
}

fn good_author(engine: &SyncEngine) -> AuthorId {
    let author = AuthorId([11u8; driftnet_shared::ID_LEN]);
    engine.set_rating(author, Rating::Good).unwrap();
    author
}

#[test]
fn group_messages_propagate_and_settle() {
    let (alice, bob, g) = pair();
    let author = good_author(&alice.engine);

    let m1 = Message::new(None, Some(g.id), Some(author), 100, b"first".to_vec());
    let m2 = Message::new(Some(m1.id), Some(g.id), Some(author), 200, b"reply".to_vec());
    alice.engine.store_local_group_message(m1.clone()).unwrap();
    alice.engine.store_local_group_message(m2.clone()).unwrap();

    let sent = sync_round(&alice, &bob);
    assert_eq!(sent, vec![m1.id, m2.id]);
    assert_eq!(bob.engine.get_message(m1.id).unwrap(), m1);
    assert_eq!(bob.engine.get_message(m2.id).unwrap(), m2);

    // Everything acked: the next round moves nothing, in either direction.
    assert!(sync_round(&alice, &bob).is_empty());
    // Bob never rated the author, so nothing is sendable back; and alice
    // already has both messages anyway.
    assert!(sync_round(&bob, &alice).is_empty());
}

#[test]
fn interrupted_round_repeats_without_duplicates() {
    let (alice, bob, g) = pair();
    let author = good_author(&alice.engine);

    let m = Message::new(None, Some(g.id), Some(author), 100, b"once".to_vec());
    alice.engine.store_local_group_message(m.clone()).unwrap();

    // The batch arrives but the ack is lost.
    let offer = alice.engine.generate_offer(alice.other).unwrap().unwrap();
    let request = bob.engine.receive_offer(bob.other, &offer).unwrap();
    assert!(request.requested(0));
    let batch = alice
        .engine
        .generate_batch(alice.other, 1 << 20, Some(&[m.id]))
        .unwrap()
        .unwrap();
    bob.engine.receive_batch(bob.other, &batch).unwrap();
    let _lost_ack = bob.engine.generate_ack(bob.other).unwrap().unwrap();

    // Alice retries from the top; bob already has the message, so the new
    // offer is declined and nothing is stored twice.
    assert!(alice.engine.generate_offer(alice.other).unwrap().is_none());
    let replayed = bob.engine.receive_offer(
        bob.other,
        &driftnet_shared::protocol::Offer {
            message_ids: vec![m.id],
        },
    );
    assert!(!replayed.unwrap().requested(0));
    assert_eq!(bob.engine.get_group_message_headers(g.id).unwrap().len(), 1);
}

#[test]
fn private_messages_flow_both_ways() {
    let (alice, bob, _) = pair();

    let to_bob = Message::new(None, None, None, 100, b"hi bob".to_vec());
    alice
        .engine
        .store_local_private_message(to_bob.clone(), alice.other)
        .unwrap();
    let to_alice = Message::new(None, None, None, 150, b"hi alice".to_vec());
    bob.engine
        .store_local_private_message(to_alice.clone(), bob.other)
        .unwrap();

    assert_eq!(sync_round(&alice, &bob), vec![to_bob.id]);
    assert_eq!(sync_round(&bob, &alice), vec![to_alice.id]);

    let at_bob = bob.engine.get_private_message_headers(bob.other).unwrap();
    assert_eq!(at_bob.len(), 2);
    assert!(at_bob.iter().any(|h| h.id == to_bob.id && h.incoming));
    assert!(at_bob.iter().any(|h| h.id == to_alice.id && !h.incoming));
}

#[test]
fn store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("driftnet.db");
    let config = SyncConfig::default();

    let m = {
        let engine = SyncEngine::open(&path, config.clone()).unwrap();
        let c = engine.add_contact("bob").unwrap();
        let m = Message::new(None, None, None, 100, b"persisted".to_vec());
        engine.store_local_private_message(m.clone(), c).unwrap();
        m
    };

    let engine = SyncEngine::open(&path, config).unwrap();
    assert_eq!(engine.get_message(m.id).unwrap(), m);
    let contacts = engine.get_contacts().unwrap();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].name, "bob");
}
