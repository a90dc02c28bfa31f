use crate::network::capabilities::Capabilities;
use crate::network::message::NetworkEnvelope;
use crate::network::node_address::NodeAddress;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseConnectionReason {
    // Intended closes
    Shutdown,
    CloseRequestedByPeer,
    DuplicatePeer,
    RuleViolation,
    // Unexpected loss
    SocketClosed,
    Reset,
    Timeout,
    HandshakeFailed,
}

impl CloseConnectionReason {
    /// Intended closes must not be treated as the peer going offline.
    pub fn is_intended(&self) -> bool {
        matches!(
            self,
            CloseConnectionReason::Shutdown
                | CloseConnectionReason::CloseRequestedByPeer
                | CloseConnectionReason::DuplicatePeer
                | CloseConnectionReason::RuleViolation
        )
    }
}

/// Handle for one peer connection.
///
/// The transport owns the socket; this only carries what the protocol layer
/// needs to know about the peer.
pub struct Connection {
    uid: String,
    peers_node_address: Option<NodeAddress>,
    capabilities: Capabilities,
    stopped: AtomicBool,
}

impl Connection {
    pub fn new(peers_node_address: Option<NodeAddress>, capabilities: Capabilities) -> Self {
        Self {
            uid: crate::mailbox::message::new_uid(),
            peers_node_address,
            capabilities,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn peers_node_address(&self) -> Option<NodeAddress> {
        self.peers_node_address.clone()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Returns true the first time only.
    pub fn mark_stopped(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }

    /// False when the envelope needs a capability this peer did not
    /// advertise.
    pub fn test_capability(&self, envelope: &NetworkEnvelope) -> bool {
        match envelope.required_capabilities() {
            Some(required) => self.capabilities.contains_all(&required),
            None => true,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("uid", &self.uid)
            .field("peer", &self.peers_node_address())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
