//! Exchanges state hashes of one [`MonitorKind`] with peers.

use crate::broadcast::MessageBroadcaster;
use crate::error::NetworkError;
use crate::listeners::ListenerList;
use crate::monitoring::messages::{GetStateHashesRequest, GetStateHashesResponse, MonitorKind, NewStateHashMessage};
use crate::monitoring::state_hash::StateHash;
use crate::network::connection::Connection;
use crate::network::message::{BroadcastMessage, NetworkEnvelope};
use crate::network::node::{MessageListener, NetworkNode};
use crate::network::node_address::NodeAddress;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

pub trait StateNetworkListener: Send + Sync {
    fn on_new_state_hash_message(&self, message: &NewStateHashMessage, peer: Option<&NodeAddress>);

    fn on_get_state_hash_request(&self, connection: &Arc<Connection>, request: &GetStateHashesRequest);

    fn on_peers_state_hashes(&self, state_hashes: &[StateHash], peer: Option<&NodeAddress>);
}

struct PendingRequest {
    peer: NodeAddress,
    response: oneshot::Sender<Vec<StateHash>>,
}

pub struct StateNetworkService {
    me: Weak<StateNetworkService>,
    kind: MonitorKind,
    network_node: Arc<dyn NetworkNode>,
    broadcaster: Arc<dyn MessageBroadcaster>,
    seed_nodes: HashSet<NodeAddress>,
    listeners: ListenerList<dyn StateNetworkListener>,
    pending: DashMap<u32, PendingRequest>,
}

impl StateNetworkService {
    pub fn new(
        kind: MonitorKind,
        network_node: Arc<dyn NetworkNode>,
        broadcaster: Arc<dyn MessageBroadcaster>,
        seed_nodes: impl IntoIterator<Item = NodeAddress>,
    ) -> Arc<Self> {
        let service = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            kind,
            network_node: network_node.clone(),
            broadcaster,
            seed_nodes: seed_nodes.into_iter().collect(),
            listeners: ListenerList::new(),
            pending: DashMap::new(),
        });
        network_node.add_message_listener(service.clone());
        service
    }

    pub fn kind(&self) -> MonitorKind {
        self.kind
    }

    pub fn add_listener(&self, listener: Arc<dyn StateNetworkListener>) {
        self.listeners.add(listener);
    }

    pub fn is_seed_node(&self, address: &NodeAddress) -> bool {
        self.seed_nodes.contains(address)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn broadcast_my_state_hash(&self, state_hash: StateHash) {
        tracing::debug!(
            "📡 Broadcasting {} hash {} at height {}",
            self.kind.name(),
            state_hash.short_hash(),
            state_hash.height
        );
        self.broadcaster.broadcast(
            BroadcastMessage::NewStateHash(NewStateHashMessage {
                kind: self.kind,
                state_hash,
            }),
            self.network_node.node_address(),
            None,
        );
    }

    /// Answers a peer's request on a background task.
    pub fn send_get_state_hashes_response(
        &self,
        connection: &Arc<Connection>,
        request_nonce: u32,
        state_hashes: Vec<StateHash>,
    ) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let network_node = self.network_node.clone();
        let connection = connection.clone();
        let envelope = NetworkEnvelope::GetStateHashesResponse(GetStateHashesResponse {
            kind: self.kind,
            state_hashes,
            request_nonce,
        });
        runtime.spawn(async move {
            if let Err(e) = network_node.send_message(&connection, envelope).await {
                tracing::debug!(
                    "State hash response to {:?} failed: {}",
                    connection.peers_node_address(),
                    e
                );
            }
        });
    }

    /// Asks `peer` for our kind of hashes from `from_height` on and hands the
    /// answer to the listeners.
    pub async fn request_hashes(&self, from_height: u32, peer: &NodeAddress) -> Result<Vec<StateHash>, NetworkError> {
        let nonce: u32 = rand::random();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            nonce,
            PendingRequest {
                peer: peer.clone(),
                response: tx,
            },
        );
        let request = NetworkEnvelope::GetStateHashesRequest(GetStateHashesRequest {
            kind: self.kind,
            height: from_height,
            nonce,
        });

        let result = async {
            self.network_node.send_message_to(peer, request).await?;
            match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
                Ok(Ok(hashes)) => Ok(hashes),
                Ok(Err(_)) => Err(NetworkError::ConnectionClosed(peer.to_string())),
                Err(_) => Err(NetworkError::Timeout(format!(
                    "no {} response from {} within {:?}",
                    self.kind.response_message_type(),
                    peer,
                    REQUEST_TIMEOUT
                ))),
            }
        }
        .await;
        self.pending.remove(&nonce);

        let hashes = result?;
        for listener in self.listeners.snapshot().iter() {
            listener.on_peers_state_hashes(&hashes, Some(peer));
        }
        Ok(hashes)
    }

    /// Fires a request at every seed node we are connected to. Returns how
    /// many were sent.
    pub fn request_hashes_from_all_connected_seed_nodes(&self, from_height: u32) -> usize {
        let (Some(me), Ok(runtime)) = (self.me.upgrade(), tokio::runtime::Handle::try_current()) else {
            return 0;
        };
        let seeds: Vec<NodeAddress> = self
            .network_node
            .confirmed_connections()
            .iter()
            .filter_map(|c| c.peers_node_address())
            .filter(|a| self.is_seed_node(a))
            .collect();
        for seed in &seeds {
            let service = me.clone();
            let seed = seed.clone();
            runtime.spawn(async move {
                if let Err(e) = service.request_hashes(from_height, &seed).await {
                    tracing::info!("🌐 {} hash request to {} failed: {}", service.kind.name(), seed, e);
                }
            });
        }
        seeds.len()
    }
}

impl MessageListener for StateNetworkService {
    fn on_message(&self, envelope: &NetworkEnvelope, connection: &Arc<Connection>) {
        match envelope {
            NetworkEnvelope::Broadcast(BroadcastMessage::NewStateHash(message)) if message.kind == self.kind => {
                let peer = connection.peers_node_address();
                for listener in self.listeners.snapshot().iter() {
                    listener.on_new_state_hash_message(message, peer.as_ref());
                }
            }
            NetworkEnvelope::GetStateHashesRequest(request) if request.kind == self.kind => {
                for listener in self.listeners.snapshot().iter() {
                    listener.on_get_state_hash_request(connection, request);
                }
            }
            NetworkEnvelope::GetStateHashesResponse(response) if response.kind == self.kind => {
                let from_expected_peer = self
                    .pending
                    .get(&response.request_nonce)
                    .is_some_and(|p| connection.peers_node_address().as_ref() == Some(&p.peer));
                if !from_expected_peer {
                    tracing::debug!("Ignoring {} with unknown nonce", self.kind.response_message_type());
                    return;
                }
                if let Some((_, pending)) = self.pending.remove(&response.request_nonce) {
                    let _ = pending.response.send(response.state_hashes.clone());
                }
            }
            _ => {}
        }
    }
}
