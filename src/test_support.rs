//! In-process doubles for the network seams, shared by unit tests.

use crate::broadcast::{BroadcastListener, MessageBroadcaster};
use crate::error::NetworkError;
use crate::network::capabilities::Capabilities;
use crate::network::connection::Connection;
use crate::network::message::{BroadcastMessage, NetworkEnvelope};
use crate::network::node::{ConnectionListener, MessageListener, NetworkNode};
use crate::network::node_address::NodeAddress;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
pub struct RecordingBroadcaster {
    pub messages: Mutex<Vec<(BroadcastMessage, Option<NodeAddress>)>>,
}

impl RecordingBroadcaster {
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }
}

impl MessageBroadcaster for RecordingBroadcaster {
    fn broadcast(
        &self,
        message: BroadcastMessage,
        sender: Option<NodeAddress>,
        _listener: Option<Arc<dyn BroadcastListener>>,
    ) {
        self.messages.lock().push((message, sender));
    }
}

/// A node with a fixed set of peers that records what it sends.
pub struct StaticNode {
    pub address: NodeAddress,
    pub connections: Vec<Arc<Connection>>,
    pub sent: Mutex<Vec<(NodeAddress, NetworkEnvelope)>>,
    pub message_listeners: Mutex<Vec<Arc<dyn MessageListener>>>,
}

impl StaticNode {
    pub fn new(address: &str, peers: &[&str]) -> Arc<Self> {
        let connections = peers
            .iter()
            .map(|p| Arc::new(Connection::new(p.parse().ok(), Capabilities::default())))
            .collect();
        Arc::new(Self {
            address: address.parse().unwrap_or_else(|_| NodeAddress::new("localhost", 1)),
            connections,
            sent: Mutex::new(Vec::new()),
            message_listeners: Mutex::new(Vec::new()),
        })
    }

    /// Delivers `envelope` to every registered listener as if `from` sent it.
    pub fn deliver(&self, envelope: &NetworkEnvelope, from: &str) {
        let connection = Arc::new(Connection::new(from.parse().ok(), Capabilities::default()));
        let listeners = self.message_listeners.lock().clone();
        for listener in listeners {
            listener.on_message(envelope, &connection);
        }
    }
}

#[async_trait]
impl NetworkNode for StaticNode {
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
        self.sent.lock().push((peer, envelope));
        Ok(())
    }

    async fn send_message_to(
        &self,
        address: &NodeAddress,
        envelope: NetworkEnvelope,
    ) -> Result<Arc<Connection>, NetworkError> {
        let connection = self
            .find_connection(address)
            .ok_or_else(|| NetworkError::NotConnected(address.to_string()))?;
        self.sent.lock().push((address.clone(), envelope));
        Ok(connection)
    }

    fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        self.message_listeners.lock().push(listener);
    }

    fn add_connection_listener(&self, _listener: Arc<dyn ConnectionListener>) {}
}
