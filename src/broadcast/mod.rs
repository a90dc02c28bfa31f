//! Gossip fan-out of [`BroadcastMessage`]s to a randomized subset of peers.

pub mod broadcaster;
pub mod handler;

use crate::network::message::BroadcastMessage;
use crate::network::node_address::NodeAddress;
use std::sync::Arc;

pub use broadcaster::Broadcaster;
pub use handler::BroadcastHandler;

/// Outcome of one broadcast cycle as seen by a listener.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastResult {
    pub num_peers: usize,
    pub num_completed: usize,
    pub num_failed: usize,
}

/// Notified exactly once per broadcast cycle, with one of the two calls.
pub trait BroadcastListener: Send + Sync {
    fn on_sufficiently_broadcast(&self, result: &BroadcastResult);

    fn on_not_sufficiently_broadcast(&self, result: &BroadcastResult);
}

/// Anything that can take a gossip message off the caller's hands.
///
/// `sender` is the peer the message came from, or `None`/our own address
/// for locally originated messages.
pub trait MessageBroadcaster: Send + Sync {
    fn broadcast(
        &self,
        message: BroadcastMessage,
        sender: Option<NodeAddress>,
        listener: Option<Arc<dyn BroadcastListener>>,
    );
}

/// One queued message plus who sent it and who wants to hear back.
#[derive(Clone)]
pub struct BroadcastRequest {
    pub message: BroadcastMessage,
    pub sender: Option<NodeAddress>,
    pub listener: Option<Arc<dyn BroadcastListener>>,
}

impl std::fmt::Debug for BroadcastRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastRequest")
            .field("message", &self.message.message_type())
            .field("sender", &self.sender)
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}
