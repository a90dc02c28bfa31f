//! Transport seam used by every protocol component.
//!
//! Storage, broadcast, bulk sync, mailbox and monitoring only talk to peers
//! through [`NetworkNode`], so tests can swap the TCP node for an in-memory
//! one.

use crate::error::NetworkError;
use crate::network::connection::{CloseConnectionReason, Connection};
use crate::network::message::NetworkEnvelope;
use crate::network::node_address::NodeAddress;
use async_trait::async_trait;
use std::sync::Arc;

pub trait MessageListener: Send + Sync {
    fn on_message(&self, envelope: &NetworkEnvelope, connection: &Arc<Connection>);
}

pub trait ConnectionListener: Send + Sync {
    fn on_connection(&self, _connection: &Arc<Connection>) {}

    fn on_disconnect(&self, reason: CloseConnectionReason, connection: &Arc<Connection>);
}

#[async_trait]
pub trait NetworkNode: Send + Sync {
    /// Our own advertised address; `None` until the node is listening.
    fn node_address(&self) -> Option<NodeAddress>;

    /// Connections that completed the handshake.
    fn confirmed_connections(&self) -> Vec<Arc<Connection>>;

    async fn send_message(
        &self,
        connection: &Arc<Connection>,
        envelope: NetworkEnvelope,
    ) -> Result<(), NetworkError>;

    /// Sends over an existing connection to `address` or dials a new one.
    async fn send_message_to(
        &self,
        address: &NodeAddress,
        envelope: NetworkEnvelope,
    ) -> Result<Arc<Connection>, NetworkError>;

    fn add_message_listener(&self, listener: Arc<dyn MessageListener>);

    fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>);

    fn find_connection(&self, address: &NodeAddress) -> Option<Arc<Connection>> {
        self.confirmed_connections()
            .into_iter()
            .find(|c| c.peers_node_address().as_ref() == Some(address))
    }
}
