//! Drives the bootstrap sync against seed nodes and answers peers' data
//! requests.

use crate::getdata::handler::{GetDataRequestHandler, GetDataRequestHandlerListener};
use crate::getdata::messages::GetDataRequest;
use crate::getdata::request_data_handler::{RequestDataHandler, RequestDataOutcome};
use crate::getdata::DataRequestListener;
use crate::listeners::ListenerList;
use crate::network::capabilities::Capabilities;
use crate::network::connection::Connection;
use crate::network::message::NetworkEnvelope;
use crate::network::node::{MessageListener, NetworkNode};
use crate::network::node_address::NodeAddress;
use crate::storage::P2PDataStorage;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub struct RequestDataManager {
    network_node: Arc<dyn NetworkNode>,
    storage: Arc<P2PDataStorage>,
    request_handler: Arc<RequestDataHandler>,
    seed_nodes: Vec<NodeAddress>,
    listeners: ListenerList<dyn DataRequestListener>,
    synced_from: RwLock<Option<NodeAddress>>,
    preliminary_received: AtomicBool,
    bootstrapped: AtomicBool,
    responses_sent: Arc<AtomicUsize>,
}

struct ResponseStats {
    sent: Arc<AtomicUsize>,
}

impl GetDataRequestHandlerListener for ResponseStats {
    fn on_complete(&self, serialized_size: usize) {
        let n = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!("✅ Data response #{} complete ({} bytes)", n, serialized_size);
    }

    fn on_fault(&self, error_message: &str, connection: &Arc<Connection>) {
        tracing::debug!("Data response to {:?} failed: {}", connection.peers_node_address(), error_message);
    }
}

impl RequestDataManager {
    pub fn new(
        network_node: Arc<dyn NetworkNode>,
        storage: Arc<P2PDataStorage>,
        seed_nodes: Vec<NodeAddress>,
        capabilities: Capabilities,
        version: impl Into<String>,
    ) -> Arc<Self> {
        let request_handler = RequestDataHandler::new(network_node.clone(), storage.clone(), capabilities, version);
        let manager = Arc::new(Self {
            network_node: network_node.clone(),
            storage,
            request_handler,
            seed_nodes,
            listeners: ListenerList::new(),
            synced_from: RwLock::new(None),
            preliminary_received: AtomicBool::new(false),
            bootstrapped: AtomicBool::new(false),
            responses_sent: Arc::new(AtomicUsize::new(0)),
        });
        network_node.add_message_listener(manager.clone());
        manager
    }

    pub fn add_listener(&self, listener: Arc<dyn DataRequestListener>) {
        self.listeners.add(listener);
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::SeqCst)
    }

    pub fn is_preliminary_data_received(&self) -> bool {
        self.preliminary_received.load(Ordering::SeqCst)
    }

    pub fn synced_from(&self) -> Option<NodeAddress> {
        self.synced_from.read().clone()
    }

    pub fn responses_sent(&self) -> usize {
        self.responses_sent.load(Ordering::SeqCst)
    }

    /// Seed nodes in random order, never ourselves.
    fn candidate_seeds(&self) -> Vec<NodeAddress> {
        let me = self.network_node.node_address();
        let mut seeds: Vec<NodeAddress> = self
            .seed_nodes
            .iter()
            .filter(|s| Some(*s) != me.as_ref())
            .cloned()
            .collect();
        seeds.shuffle(&mut rand::thread_rng());
        seeds
    }

    /// Asks seed nodes one after another until one answers.
    pub async fn request_preliminary_data(&self) -> Option<(NodeAddress, RequestDataOutcome)> {
        for seed in self.candidate_seeds() {
            match self.request_handler.request_data(&seed, true).await {
                Ok(outcome) => {
                    self.preliminary_received.store(true, Ordering::SeqCst);
                    *self.synced_from.write() = Some(seed.clone());
                    for listener in self.listeners.snapshot().iter() {
                        listener.on_preliminary_data_received();
                    }
                    return Some((seed, outcome));
                }
                Err(e) => tracing::info!("🌐 Seed node {} did not deliver data: {}", seed, e),
            }
        }
        tracing::warn!("⚠️ No seed node available for the initial data request");
        for listener in self.listeners.snapshot().iter() {
            listener.on_no_seed_node_available();
        }
        None
    }

    /// Delta request once we are reachable. Marks the node bootstrapped and
    /// starts the storage expiry sweep on success.
    pub async fn request_updated_data(&self, seed: &NodeAddress) -> Option<RequestDataOutcome> {
        match self.request_handler.request_data(seed, false).await {
            Ok(outcome) => {
                self.mark_bootstrapped();
                for listener in self.listeners.snapshot().iter() {
                    listener.on_updated_data_received();
                }
                Some(outcome)
            }
            Err(e) => {
                tracing::warn!("⚠️ Updated data request to {} failed: {}", seed, e);
                None
            }
        }
    }

    fn mark_bootstrapped(&self) {
        if !self.bootstrapped.swap(true, Ordering::SeqCst) {
            tracing::info!("✅ P2P data bootstrapped");
            self.storage.on_bootstrapped();
        }
    }

    /// Preliminary request followed by the updated request to the same seed.
    /// A node without any seed to ask (a lone seed node) is bootstrapped as is.
    pub async fn bootstrap(&self) -> bool {
        if self.candidate_seeds().is_empty() {
            tracing::info!("🌐 No other seed nodes configured; starting from local data");
            self.mark_bootstrapped();
            return true;
        }
        let Some((seed, _)) = self.request_preliminary_data().await else {
            return false;
        };
        self.request_updated_data(&seed).await.is_some()
    }

    fn handle_request(&self, request: GetDataRequest, connection: Arc<Connection>) {
        let handler = GetDataRequestHandler::new(
            self.network_node.clone(),
            self.storage.clone(),
            Arc::new(ResponseStats {
                sent: self.responses_sent.clone(),
            }),
        );
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            handler.handle(request, connection).await;
        });
    }
}

impl MessageListener for RequestDataManager {
    fn on_message(&self, envelope: &NetworkEnvelope, connection: &Arc<Connection>) {
        let request = match envelope {
            NetworkEnvelope::PreliminaryGetDataRequest(r) => GetDataRequest::Preliminary(r.clone()),
            NetworkEnvelope::GetUpdatedDataRequest(r) => GetDataRequest::Updated(r.clone()),
            _ => return,
        };
        tracing::debug!(
            "📨 {} from {:?}",
            envelope.message_type(),
            connection.peers_node_address()
        );
        self.handle_request(request, connection.clone());
    }
}
