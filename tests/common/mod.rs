//! In-memory stand-ins for the network, shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use otcnode::broadcast::{BroadcastListener, BroadcastResult, MessageBroadcaster};
use otcnode::crypto::SignatureKeyPair;
use otcnode::error::NetworkError;
use otcnode::network::{
    BroadcastMessage, Capabilities, Connection, ConnectionListener, MessageListener, NetworkEnvelope, NetworkNode,
    NodeAddress,
};
use otcnode::storage::payload::{OfferDirection, OfferPayload};
use otcnode::storage::ProtectedStoragePayload;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

pub const NOW: i64 = 1_700_000_000_000;

pub fn address(s: &str) -> NodeAddress {
    s.parse().expect("valid test address")
}

pub fn connection_from(peer: &str) -> Arc<Connection> {
    Arc::new(Connection::new(Some(address(peer)), Capabilities::app_defaults()))
}

/// A node with a fixed set of confirmed peers. Sends are recorded; sends to
/// peers in `failing` or to unknown addresses fail.
pub struct MockNetworkNode {
    pub address: NodeAddress,
    pub connections: Vec<Arc<Connection>>,
    pub failing: Mutex<HashSet<NodeAddress>>,
    pub sent: Mutex<Vec<(NodeAddress, NetworkEnvelope)>>,
    listeners: Mutex<Vec<Arc<dyn MessageListener>>>,
}

impl MockNetworkNode {
    pub fn new(own: &str, peers: &[String]) -> Arc<Self> {
        Arc::new(Self {
            address: address(own),
            connections: peers.iter().map(|p| connection_from(p)).collect(),
            failing: Mutex::new(HashSet::new()),
            sent: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn with_peer_count(own: &str, count: usize) -> Arc<Self> {
        let peers: Vec<String> = (0..count).map(|i| format!("peer{}:9999", i)).collect();
        Self::new(own, &peers)
    }

    pub fn fail_sends_to(&self, peer: &str) {
        self.failing.lock().insert(address(peer));
    }

    pub fn sent_to(&self) -> Vec<NodeAddress> {
        self.sent.lock().iter().map(|(a, _)| a.clone()).collect()
    }

    pub fn deliver(&self, envelope: &NetworkEnvelope, from: &str) {
        let connection = connection_from(from);
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.on_message(envelope, &connection);
        }
    }

    fn record(&self, peer: &NodeAddress, envelope: NetworkEnvelope) -> Result<(), NetworkError> {
        if self.failing.lock().contains(peer) {
            return Err(NetworkError::ConnectionClosed(peer.to_string()));
        }
        self.sent.lock().push((peer.clone(), envelope));
        Ok(())
    }
}

#[async_trait]
impl NetworkNode for MockNetworkNode {
    fn node_address(&self) -> Option<NodeAddress> {
        Some(self.address.clone())
    }

    fn confirmed_connections(&self) -> Vec<Arc<Connection>> {
        self.connections.clone()
    }

    async fn send_message(&self, connection: &Arc<Connection>, envelope: NetworkEnvelope) -> Result<(), NetworkError> {
        let peer = connection
            .peers_node_address()
            .ok_or_else(|| NetworkError::NotConnected(connection.uid().to_string()))?;
        self.record(&peer, envelope)
    }

    async fn send_message_to(
        &self,
        address: &NodeAddress,
        envelope: NetworkEnvelope,
    ) -> Result<Arc<Connection>, NetworkError> {
        let connection = self
            .find_connection(address)
            .ok_or_else(|| NetworkError::NotConnected(address.to_string()))?;
        self.record(address, envelope)?;
        Ok(connection)
    }

    fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        self.listeners.lock().push(listener);
    }

    fn add_connection_listener(&self, _listener: Arc<dyn ConnectionListener>) {}
}

/// Collects broadcasts instead of sending them.
#[derive(Default)]
pub struct RecordingBroadcaster {
    pub messages: Mutex<Vec<BroadcastMessage>>,
}

impl RecordingBroadcaster {
    pub fn take(&self) -> Vec<BroadcastMessage> {
        std::mem::take(&mut *self.messages.lock())
    }

    pub fn types(&self) -> Vec<&'static str> {
        self.messages.lock().iter().map(|m| m.message_type()).collect()
    }
}

impl MessageBroadcaster for RecordingBroadcaster {
    fn broadcast(
        &self,
        message: BroadcastMessage,
        _sender: Option<NodeAddress>,
        _listener: Option<Arc<dyn BroadcastListener>>,
    ) {
        self.messages.lock().push(message);
    }
}

/// Records every verdict a broadcast listener receives.
#[derive(Default)]
pub struct VerdictLog {
    pub sufficient: Mutex<Vec<BroadcastResult>>,
    pub not_sufficient: Mutex<Vec<BroadcastResult>>,
}

impl BroadcastListener for VerdictLog {
    fn on_sufficiently_broadcast(&self, result: &BroadcastResult) {
        self.sufficient.lock().push(*result);
    }

    fn on_not_sufficiently_broadcast(&self, result: &BroadcastResult) {
        self.not_sufficient.lock().push(*result);
    }
}

pub fn offer(owner: &SignatureKeyPair, id: &str, owner_address: &str) -> ProtectedStoragePayload {
    ProtectedStoragePayload::Offer(OfferPayload {
        id: id.to_string(),
        owner_node_address: address(owner_address),
        direction: OfferDirection::Sell,
        currency_code: "USD".to_string(),
        price: 42_000,
        amount: 1_000,
        min_amount: 500,
        date: NOW,
        owner_pub_key: owner.public(),
        extra_data: None,
    })
}
