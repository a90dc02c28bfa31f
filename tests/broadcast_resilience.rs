mod common;

use common::{offer, MockNetworkNode, VerdictLog, NOW};
use otcnode::broadcast::{Broadcaster, MessageBroadcaster};
use otcnode::crypto::SignatureKeyPair;
use otcnode::network::message::AddDataMessage;
use otcnode::network::{BroadcastMessage, NetworkEnvelope};
use otcnode::storage::ProtectedStorageEntry;
use std::sync::Arc;

fn add_data(id: &str) -> BroadcastMessage {
    let keys = SignatureKeyPair::generate();
    let entry = ProtectedStorageEntry::signed(offer(&keys, id, "maker:9999"), &keys, 1, NOW);
    BroadcastMessage::AddData(AddDataMessage {
        protected_storage_entry: entry,
    })
}

#[tokio::test(start_paused = true)]
async fn own_message_is_sufficient_after_three_sends() {
    let node = MockNetworkNode::with_peer_count("me:9999", 10);
    let broadcaster = Broadcaster::new(node.clone());
    let log = Arc::new(VerdictLog::default());

    broadcaster.broadcast(add_data("o1"), None, Some(log.clone()));
    let result = broadcaster.flush().expect("a batch was queued").await.unwrap();

    assert_eq!(result.num_peers, 10);
    assert_eq!(result.num_completed, 10);
    let sufficient = log.sufficient.lock().clone();
    assert_eq!(sufficient.len(), 1);
    assert_eq!(sufficient[0].num_completed, 3);
    assert!(log.not_sufficient.lock().is_empty());
    assert_eq!(node.sent.lock().len(), 10);
}

#[tokio::test(start_paused = true)]
async fn relayed_message_reaches_at_most_seven_peers_and_not_its_sender() {
    let node = MockNetworkNode::with_peer_count("me:9999", 10);
    let broadcaster = Broadcaster::new(node.clone());

    let origin = common::address("peer3:9999");
    broadcaster.broadcast(add_data("o2"), Some(origin.clone()), None);
    let result = broadcaster.flush().expect("a batch was queued").await.unwrap();

    let sent_to = node.sent_to();
    assert!(sent_to.len() <= 7);
    assert!(sent_to.len() >= 6);
    assert!(!sent_to.contains(&origin));
    assert_eq!(result.num_completed, sent_to.len());
}

#[tokio::test(start_paused = true)]
async fn failing_peers_report_not_sufficient_once() {
    let node = MockNetworkNode::with_peer_count("me:9999", 10);
    for i in 0..10 {
        node.fail_sends_to(&format!("peer{}:9999", i));
    }
    let broadcaster = Broadcaster::new(node.clone());
    let log = Arc::new(VerdictLog::default());

    broadcaster.broadcast(add_data("o3"), None, Some(log.clone()));
    let result = broadcaster.flush().expect("a batch was queued").await.unwrap();

    assert_eq!(result.num_failed, 10);
    assert_eq!(log.not_sufficient.lock().len(), 1);
    assert!(log.sufficient.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn messages_in_one_window_travel_as_a_bundle() {
    let node = MockNetworkNode::with_peer_count("me:9999", 4);
    let broadcaster = Broadcaster::new(node.clone());

    broadcaster.broadcast(add_data("a"), None, None);
    broadcaster.broadcast(add_data("b"), None, None);
    assert_eq!(broadcaster.pending_len(), 2);
    broadcaster.flush().expect("a batch was queued").await.unwrap();

    let sent = node.sent.lock();
    assert_eq!(sent.len(), 4);
    for (_, envelope) in sent.iter() {
        match envelope {
            NetworkEnvelope::BundleOfEnvelopes(bundle) => assert_eq!(bundle.envelopes.len(), 2),
            other => panic!("expected a bundle, got {}", other.message_type()),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn timer_flushes_without_explicit_call() {
    let node = MockNetworkNode::with_peer_count("me:9999", 2);
    let broadcaster = Broadcaster::new(node.clone());

    broadcaster.broadcast(add_data("timer"), None, None);
    tokio::time::sleep(std::time::Duration::from_secs(3)).await;

    assert_eq!(broadcaster.pending_len(), 0);
    assert_eq!(node.sent.lock().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn shut_down_pushes_out_the_last_batch() {
    let node = MockNetworkNode::with_peer_count("me:9999", 5);
    let broadcaster = Broadcaster::new(node.clone());

    broadcaster.broadcast(add_data("last"), Some(common::address("peer0:9999")), None);
    broadcaster.shut_down().await;

    // Shutdown ignores the relay cap but still skips the origin.
    assert_eq!(node.sent.lock().len(), 4);
    assert_eq!(broadcaster.active_handlers(), 0);
}
