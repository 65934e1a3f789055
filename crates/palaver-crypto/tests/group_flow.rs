//! Group session sharing, encryption, rotation, and verification.

mod common;

use std::time::Duration;

use common::{ciphertext_for, claim_key, learn_device, machine, upload_keys};
use palaver_crypto::{
    EncryptionError, Machine, RoomMessage, RotationPolicy, TrustError, store::MemoryStore,
};
use palaver_proto::{DeviceId, ROOM_KEY_TYPE, RoomId, ShareGroupSessionResponse, UserId};
use serde_json::json;

fn room() -> RoomId {
    RoomId::new("!kitchen:example.org")
}

/// Alice and bob with mutual device knowledge and a pairwise session from
/// alice to bob.
fn connected_pair() -> (Machine<MemoryStore>, Machine<MemoryStore>) {
    let mut alice = machine("@alice:example.org", "ALICEDEV");
    let mut bob = machine("@bob:example.org", "BOBDEV");

    let bob_upload = upload_keys(&mut bob);
    upload_keys(&mut alice);
    learn_device(&mut alice, &bob);
    learn_device(&mut bob, &alice);
    claim_key(&mut alice, bob.user_id(), bob.device_id(), &bob_upload, 0);
    (alice, bob)
}

/// Runs the whole share handshake: alice builds the batch, bob ingests his
/// message, alice gets the delivery confirmation.
fn share_with_bob(alice: &mut Machine<MemoryStore>, bob: &mut Machine<MemoryStore>) {
    let batch = alice.share_group_session(&room(), &[bob.user_id().clone()], false).unwrap();
    let ciphertext =
        ciphertext_for(&batch, bob.user_id(), bob.device_id(), &bob.curve25519_key());
    let envelope = bob
        .decrypt_to_device(alice.user_id(), &alice.curve25519_key(), &ciphertext)
        .unwrap();
    assert_eq!(envelope.event_type, ROOM_KEY_TYPE);
    alice
        .receive_share_group_session_response(&ShareGroupSessionResponse { room_id: room() })
        .unwrap();
}

#[test]
fn sharing_with_unreviewed_device_is_refused() {
    let (mut alice, bob) = connected_pair();
    alice.create_outbound_group_session(&room()).unwrap();

    let result = alice.share_group_session(&room(), &[bob.user_id().clone()], false);
    assert!(matches!(
        result,
        Err(EncryptionError::Trust(TrustError::UnreviewedDevice { .. }))
    ));
}

#[test]
fn user_with_no_reachable_devices_errors_unless_ignored() {
    let (mut alice, bob) = connected_pair();
    alice.blacklist_device(bob.user_id(), bob.device_id()).unwrap();
    alice.create_outbound_group_session(&room()).unwrap();

    let strict = alice.share_group_session(&room(), &[bob.user_id().clone()], false);
    assert!(matches!(strict, Err(EncryptionError::NoReachableDevices { .. })));

    let lenient = alice.share_group_session(&room(), &[bob.user_id().clone()], true).unwrap();
    assert!(lenient.is_empty());
}

#[test]
fn missing_pairwise_session_errors_unless_ignored() {
    let mut alice = machine("@alice:example.org", "ALICEDEV");
    let bob = machine("@bob:example.org", "BOBDEV");
    learn_device(&mut alice, &bob);
    alice.verify_device(bob.user_id(), bob.device_id()).unwrap();
    alice.create_outbound_group_session(&room()).unwrap();

    let strict = alice.share_group_session(&room(), &[bob.user_id().clone()], false);
    assert!(matches!(strict, Err(EncryptionError::MissingOlmSession { .. })));

    let lenient = alice.share_group_session(&room(), &[bob.user_id().clone()], true).unwrap();
    assert!(lenient.is_empty());
}

#[test]
fn unshared_session_refuses_to_encrypt() {
    let (mut alice, bob) = connected_pair();
    alice.verify_device(bob.user_id(), bob.device_id()).unwrap();
    alice.create_outbound_group_session(&room()).unwrap();

    // Batch built but delivery never confirmed.
    alice.share_group_session(&room(), &[bob.user_id().clone()], false).unwrap();
    let result = alice.encrypt_room_message(&room(), "message", json!({"body": "hi"}));
    assert!(matches!(
        result,
        Err(EncryptionError::Group(
            palaver_crypto::GroupEncryptionError::NotShared { .. }
        ))
    ));
}

#[test]
fn group_round_trip_with_verification() {
    let (mut alice, mut bob) = connected_pair();
    alice.verify_device(bob.user_id(), bob.device_id()).unwrap();
    bob.verify_device(alice.user_id(), alice.device_id()).unwrap();

    alice.create_outbound_group_session(&room()).unwrap();
    share_with_bob(&mut alice, &mut bob);

    for expected_index in 0..3 {
        let payload = alice
            .encrypt_room_message(&room(), "message", json!({"body": format!("m{expected_index}")}))
            .unwrap();
        let RoomMessage::Decrypted(message) =
            bob.handle_room_payload(&room(), alice.user_id(), &payload)
        else {
            panic!("message must decrypt");
        };
        assert_eq!(message.message_index, expected_index);
        assert_eq!(message.event_type, "message");
        assert_eq!(message.content, json!({"body": format!("m{expected_index}")}));
        assert!(message.verified, "verified sender with matching keys");
    }
}

#[test]
fn unverified_sender_decrypts_but_is_not_verified() {
    let (mut alice, mut bob) = connected_pair();
    alice.verify_device(bob.user_id(), bob.device_id()).unwrap();
    // Bob never verifies alice.

    alice.create_outbound_group_session(&room()).unwrap();
    share_with_bob(&mut alice, &mut bob);

    let payload = alice.encrypt_room_message(&room(), "message", json!({"body": "hi"})).unwrap();
    let RoomMessage::Decrypted(message) =
        bob.handle_room_payload(&room(), alice.user_id(), &payload)
    else {
        panic!("message must decrypt");
    };
    assert!(!message.verified);
}

#[test]
fn own_messages_count_as_verified() {
    let (mut alice, mut bob) = connected_pair();
    alice.verify_device(bob.user_id(), bob.device_id()).unwrap();
    alice.create_outbound_group_session(&room()).unwrap();
    share_with_bob(&mut alice, &mut bob);

    let payload = alice.encrypt_room_message(&room(), "message", json!({"body": "me"})).unwrap();
    let alice_user = alice.user_id().clone();
    let RoomMessage::Decrypted(message) = alice.handle_room_payload(&room(), &alice_user, &payload)
    else {
        panic!("own message must decrypt");
    };
    assert!(message.verified);
}

#[test]
fn unknown_session_yields_placeholder() {
    let (mut alice, mut bob) = connected_pair();
    alice.verify_device(bob.user_id(), bob.device_id()).unwrap();
    alice.create_outbound_group_session(&room()).unwrap();

    // Alice encrypts for herself without ever sharing with bob.
    alice.share_group_session(&room(), &[], false).unwrap();
    alice
        .receive_share_group_session_response(&ShareGroupSessionResponse { room_id: room() })
        .unwrap();
    let payload = alice.encrypt_room_message(&room(), "message", json!({"body": "?"})).unwrap();

    let RoomMessage::Undecryptable(placeholder) =
        bob.handle_room_payload(&room(), alice.user_id(), &payload)
    else {
        panic!("bob has no key, decryption must fail");
    };
    assert_eq!(placeholder.session_id, payload.session_id);
    assert_eq!(placeholder.room_id, room());
    assert!(placeholder.reason.contains("unknown inbound group session"));
}

#[test]
fn forwarded_room_key_is_never_verified() {
    let (mut alice, mut bob) = connected_pair();
    alice.verify_device(bob.user_id(), bob.device_id()).unwrap();
    bob.verify_device(alice.user_id(), alice.device_id()).unwrap();

    alice.create_outbound_group_session(&room()).unwrap();
    let session = alice.outbound_group_session(&room()).unwrap();
    let content = palaver_proto::RoomKeyContent {
        algorithm: palaver_proto::MEGOLM_ALGORITHM.to_owned(),
        room_id: room(),
        session_id: session.session_id(),
        session_key: session.session_key(),
        chain_index: session.message_index(),
    };
    // The key reaches bob third-hand rather than through a direct share.
    let stored = bob
        .accept_room_key(&content, &alice.curve25519_key(), &alice.ed25519_key(), true)
        .unwrap();
    assert!(stored);

    alice.share_group_session(&room(), &[], false).unwrap();
    alice
        .receive_share_group_session_response(&ShareGroupSessionResponse { room_id: room() })
        .unwrap();
    let payload = alice.encrypt_room_message(&room(), "message", json!({"body": "psst"})).unwrap();

    let RoomMessage::Decrypted(message) =
        bob.handle_room_payload(&room(), alice.user_id(), &payload)
    else {
        panic!("forwarded key must still decrypt");
    };
    assert!(!message.verified, "a forwarded key never confers verified status");
}

#[test]
fn expired_session_refuses_and_rotation_recovers() {
    let policy = RotationPolicy { max_messages: 1, max_age: Duration::from_secs(3600) };
    let mut alice = Machine::with_rotation_policy(
        UserId::new("@alice:example.org"),
        DeviceId::new("ALICEDEV"),
        MemoryStore::new(),
        policy,
    )
    .unwrap();
    let mut bob = machine("@bob:example.org", "BOBDEV");

    let bob_upload = upload_keys(&mut bob);
    learn_device(&mut alice, &bob);
    learn_device(&mut bob, &alice);
    claim_key(&mut alice, bob.user_id(), bob.device_id(), &bob_upload, 0);
    alice.verify_device(bob.user_id(), bob.device_id()).unwrap();
    bob.verify_device(alice.user_id(), alice.device_id()).unwrap();

    alice.create_outbound_group_session(&room()).unwrap();
    let first_session = alice.outbound_group_session(&room()).unwrap().session_id();
    share_with_bob(&mut alice, &mut bob);

    alice.encrypt_room_message(&room(), "message", json!({"body": "1"})).unwrap();
    let result = alice.encrypt_room_message(&room(), "message", json!({"body": "2"}));
    assert!(matches!(
        result,
        Err(EncryptionError::Group(
            palaver_crypto::GroupEncryptionError::Expired { .. }
        ))
    ));

    // Rotation replaces the session; after a fresh share everything works.
    alice.rotate_group_session(&room()).unwrap();
    let second_session = alice.outbound_group_session(&room()).unwrap().session_id();
    assert_ne!(first_session, second_session);

    share_with_bob(&mut alice, &mut bob);
    let payload = alice.encrypt_room_message(&room(), "message", json!({"body": "2"})).unwrap();
    assert_eq!(payload.session_id, second_session);
    let RoomMessage::Decrypted(message) =
        bob.handle_room_payload(&room(), alice.user_id(), &payload)
    else {
        panic!("message must decrypt after rotation");
    };
    assert_eq!(message.message_index, 0);
}

#[test]
fn mismatched_room_key_session_id_is_dropped() {
    let (mut alice, _) = connected_pair();
    alice.create_outbound_group_session(&room()).unwrap();

    let other = RoomId::new("!other:example.org");
    alice.create_outbound_group_session(&other).unwrap();
    let session = alice.outbound_group_session(&other).unwrap();
    let content = palaver_proto::RoomKeyContent {
        algorithm: palaver_proto::MEGOLM_ALGORITHM.to_owned(),
        room_id: other.clone(),
        session_id: "not-the-right-id".to_owned(),
        session_key: session.session_key(),
        chain_index: 0,
    };
    let stored = alice.accept_room_key(&content, "curvekey", "edkey", false).unwrap();
    assert!(!stored);
}

#[test]
fn inbound_group_sessions_survive_restart() {
    let bob_store = MemoryStore::new();
    let (mut alice, bob_user, bob_device) = {
        let mut alice = machine("@alice:example.org", "ALICEDEV");
        let mut bob = Machine::new(
            UserId::new("@bob:example.org"),
            DeviceId::new("BOBDEV"),
            bob_store.clone(),
        )
        .unwrap();

        let bob_upload = upload_keys(&mut bob);
        learn_device(&mut alice, &bob);
        learn_device(&mut bob, &alice);
        claim_key(&mut alice, bob.user_id(), bob.device_id(), &bob_upload, 0);
        alice.verify_device(bob.user_id(), bob.device_id()).unwrap();

        alice.create_outbound_group_session(&room()).unwrap();
        share_with_bob(&mut alice, &mut bob);
        let bob_user = bob.user_id().clone();
        let bob_device = bob.device_id().clone();
        (alice, bob_user, bob_device)
    };

    let mut bob = Machine::new(bob_user, bob_device, bob_store).unwrap();
    let payload = alice
        .encrypt_room_message(&room(), "message", json!({"body": "after restart"}))
        .unwrap();
    let RoomMessage::Decrypted(message) =
        bob.handle_room_payload(&room(), alice.user_id(), &payload)
    else {
        panic!("restarted device must still hold the group session");
    };
    assert_eq!(message.content, json!({"body": "after restart"}));
}
