mod common;

use common::{address, offer, RecordingBroadcaster, NOW};
use otcnode::clock::ManualClock;
use otcnode::crypto::{KeyRing, SignatureKeyPair};
use otcnode::mailbox::service::seal_for;
use otcnode::mailbox::{MailboxMessage, PrefixedSealedAndSignedMessage};
use otcnode::network::message::RefreshOfferMessage;
use otcnode::storage::entry::data_and_seq_nr_hash;
use otcnode::storage::p2p_data_storage::privileged_key_filter;
use otcnode::storage::payload::{Alert, MailboxStoragePayload};
use otcnode::storage::persistence::PersistedStore;
use otcnode::storage::{P2PDataStorage, P2PDataStorageConfig, Persistence, ProtectedStorageEntry, ProtectedStoragePayload};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn storage_with(persistence: Persistence) -> (P2PDataStorage, Arc<RecordingBroadcaster>, Arc<ManualClock>) {
    let broadcaster = Arc::new(RecordingBroadcaster::default());
    let clock = Arc::new(ManualClock::new(NOW));
    let storage = P2PDataStorage::new(persistence, broadcaster.clone(), clock.clone(), P2PDataStorageConfig::default());
    (storage, broadcaster, clock)
}

fn refresh(payload: &ProtectedStoragePayload, keys: &SignatureKeyPair, sequence_number: u32) -> RefreshOfferMessage {
    let hash_of_data_and_seq_nr = data_and_seq_nr_hash(payload, sequence_number);
    RefreshOfferMessage {
        hash_of_data_and_seq_nr,
        signature: keys.sign(&hash_of_data_and_seq_nr),
        hash_of_payload: payload.hash().as_bytes().to_vec(),
        sequence_number,
    }
}

#[test]
fn sequence_numbers_only_move_forward() {
    let (storage, _, _) = storage_with(Persistence::in_memory());
    let keys = SignatureKeyPair::generate();
    let payload = offer(&keys, "seq", "maker:9999");
    let entry = |n: u32| ProtectedStorageEntry::signed(payload.clone(), &keys, n, NOW);

    assert!(storage.add_protected_storage_entry(entry(3), None, None, true));
    for n in 1..=3 {
        assert!(!storage.add_protected_storage_entry(entry(n), None, None, true), "add {}", n);
        assert!(!storage.refresh_ttl(refresh(&payload, &keys, n), None), "refresh {}", n);
        assert!(!storage.remove(entry(n), None), "remove {}", n);
    }

    assert!(storage.refresh_ttl(refresh(&payload, &keys, 4), None));
    assert!(!storage.add_protected_storage_entry(entry(4), None, None, true));
    assert!(!storage.remove(entry(4), None));
    assert!(storage.add_protected_storage_entry(entry(5), None, None, true));
    assert!(storage.remove(entry(6), None));
    assert!(storage.is_empty());

    assert!(!storage.add_protected_storage_entry(entry(5), None, None, true));
    assert!(storage.add_protected_storage_entry(entry(7), None, None, true));
    assert_eq!(storage.sequence_number(&payload.hash()), Some(7));
}

#[test]
fn removed_mailbox_payload_never_comes_back() {
    let (storage, broadcaster, _) = storage_with(Persistence::in_memory());
    let sender = KeyRing::generate();
    let receiver = KeyRing::generate();
    let receivers_pub_key = receiver.signature_key_pair().public();

    let message = MailboxMessage::new(address("sender:9999"), "trade", b"hi".to_vec());
    let prefixed = PrefixedSealedAndSignedMessage {
        sender_node_address: address("sender:9999"),
        sealed_and_signed: seal_for(&receiver.pub_key_ring(), &message, &sender).unwrap(),
        uid: message.uid.clone(),
    };
    let payload = ProtectedStoragePayload::Mailbox(MailboxStoragePayload::new(
        prefixed,
        sender.signature_key_pair().public(),
        receivers_pub_key,
        message.ttl(),
    ));
    let signed_by = |keys: &SignatureKeyPair, n: u32| {
        ProtectedStorageEntry::signed_mailbox(payload.clone(), keys, n, receivers_pub_key, NOW)
    };

    assert!(storage.add_protected_storage_entry(signed_by(sender.signature_key_pair(), 1), None, None, true));
    // Only the receiver may take it out.
    assert!(!storage.remove(signed_by(sender.signature_key_pair(), 2), None));
    assert!(storage.remove(signed_by(receiver.signature_key_pair(), 2), None));
    assert!(storage.is_empty());

    assert!(!storage.add_protected_storage_entry(signed_by(sender.signature_key_pair(), 10), None, None, true));
    assert!(storage.is_empty());
    assert_eq!(broadcaster.types(), vec!["AddDataMessage", "RemoveMailboxDataMessage"]);
}

#[test]
fn sequence_numbers_outlive_expired_entries_across_restart() {
    let persistence = Persistence::in_memory();
    let keys = SignatureKeyPair::generate();
    let payload = offer(&keys, "restart", "maker:9999");
    {
        let (storage, _, clock) = storage_with(persistence.clone());
        assert!(storage.add_protected_storage_entry(
            ProtectedStorageEntry::signed(payload.clone(), &keys, 5, NOW),
            None,
            None,
            true
        ));
        clock.advance(payload.ttl().unwrap() + Duration::from_millis(1));
        assert_eq!(storage.remove_expired_entries(), 1);
        assert!(storage.persist_if_requested().unwrap());
    }

    let (restarted, _, _) = storage_with(persistence);
    assert!(restarted.is_empty());
    assert_eq!(restarted.sequence_number(&payload.hash()), Some(5));
    assert!(!restarted.add_protected_storage_entry(
        ProtectedStorageEntry::signed(payload.clone(), &keys, 4, NOW),
        None,
        None,
        true
    ));
    // A peer handing back the same entry rebuilds it.
    assert!(restarted.add_protected_storage_entry(
        ProtectedStorageEntry::signed(payload, &keys, 5, NOW),
        None,
        None,
        true
    ));
}

#[test]
fn only_allowed_keys_publish_alerts() {
    let (storage, _, _) = storage_with(Persistence::in_memory());
    let developer = SignatureKeyPair::generate();
    let stranger = SignatureKeyPair::generate();
    storage.set_filter_predicate(privileged_key_filter(HashSet::from([developer.public()])));

    let alert = |keys: &SignatureKeyPair| {
        ProtectedStoragePayload::Alert(Alert {
            message: "please update".to_string(),
            version: "2.0.0".to_string(),
            is_update_info: true,
            owner_pub_key: keys.public(),
            extra_data: None,
        })
    };
    assert!(!storage.add_protected_storage_entry(
        ProtectedStorageEntry::signed(alert(&stranger), &stranger, 1, NOW),
        None,
        None,
        true
    ));
    assert!(storage.add_protected_storage_entry(
        ProtectedStorageEntry::signed(alert(&developer), &developer, 1, NOW),
        None,
        None,
        true
    ));
    // Offers are not privileged.
    assert!(storage.add_protected_storage_entry(
        ProtectedStorageEntry::signed(offer(&stranger, "o", "maker:9999"), &stranger, 1, NOW),
        None,
        None,
        true
    ));
    assert_eq!(storage.len(), 2);
}
