//! Keeps our own state hash chain for one [`MonitorKind`] and compares it
//! with what peers report.

use crate::error::StorageError;
use crate::listeners::ListenerList;
use crate::monitoring::checkpoint::{verify_checkpoints, Checkpoint};
use crate::monitoring::messages::{GetStateHashesRequest, MonitorKind, NewStateHashMessage};
use crate::monitoring::network_service::{StateNetworkListener, StateNetworkService};
use crate::monitoring::state_hash::{chain_hash, StateBlock, StateHash};
use crate::network::connection::Connection;
use crate::network::node_address::NodeAddress;
use crate::network_type::BaseCurrencyNetwork;
use crate::storage::persistence::{PersistedStore, Persistence, PersistenceRequest};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;

/// How far below our height we start when asking seed nodes for hashes.
pub const REQUEST_HEIGHT_OFFSET: u32 = 10;
pub const DAO_SLOT_PREFIX: &str = "dao_";
pub const DAO_CHAIN_SLOT: &str = "dao_state_hash_chain";

const UNKNOWN_PEER: &str = "Unknown peer";

pub trait StateMonitorListener: Send + Sync {
    fn on_state_block_chain_changed(&self);
}

pub type CheckpointFailHandler = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct MonitorState {
    blocks: Vec<StateBlock>,
    parse_complete: bool,
    in_conflict_with_seed_node: bool,
    in_conflict_with_non_seed_node: bool,
    checkpoint_failed: bool,
}

pub struct StateMonitoringService {
    me: Weak<StateMonitoringService>,
    kind: MonitorKind,
    network_service: Arc<StateNetworkService>,
    network_type: BaseCurrencyNetwork,
    persistence: Persistence,
    persistence_request: PersistenceRequest,
    checkpoints: Vec<Checkpoint>,
    state: Mutex<MonitorState>,
    listeners: ListenerList<dyn StateMonitorListener>,
    checkpoint_fail_handler: Mutex<Option<CheckpointFailHandler>>,
    shutdown: CancellationToken,
}

impl StateMonitoringService {
    pub fn new(
        network_service: Arc<StateNetworkService>,
        network_type: BaseCurrencyNetwork,
        persistence: Persistence,
        checkpoints: Vec<Checkpoint>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let kind = network_service.kind();
        let mut state = MonitorState::default();
        if kind == MonitorKind::Dao {
            let chain: Vec<StateHash> = persistence.read_or_default(DAO_CHAIN_SLOT);
            if !chain.is_empty() {
                tracing::info!("📚 Loaded DAO state hash chain up to height {}", chain[chain.len() - 1].height);
            }
            state.blocks = chain.into_iter().map(StateBlock::new).collect();
        }
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            kind,
            network_service,
            network_type,
            persistence,
            persistence_request: PersistenceRequest::default(),
            checkpoints,
            state: Mutex::new(state),
            listeners: ListenerList::new(),
            checkpoint_fail_handler: Mutex::new(None),
            shutdown,
        })
    }

    pub fn kind(&self) -> MonitorKind {
        self.kind
    }

    pub fn add_listener(&self, listener: Arc<dyn StateMonitorListener>) {
        self.listeners.add(listener);
    }

    /// Called at most once, on the first checkpoint mismatch.
    pub fn set_checkpoint_fail_handler(&self, handler: CheckpointFailHandler) {
        *self.checkpoint_fail_handler.lock() = Some(handler);
    }

    pub fn state_blocks(&self) -> Vec<StateBlock> {
        self.state.lock().blocks.clone()
    }

    pub fn my_state_hashes(&self) -> Vec<StateHash> {
        self.state
            .lock()
            .blocks
            .iter()
            .map(|b| b.my_state_hash.clone())
            .collect()
    }

    pub fn current_height(&self) -> Option<u32> {
        self.state.lock().blocks.last().map(StateBlock::height)
    }

    pub fn is_in_conflict_with_seed_node(&self) -> bool {
        self.state.lock().in_conflict_with_seed_node
    }

    pub fn is_in_conflict_with_non_seed_node(&self) -> bool {
        self.state.lock().in_conflict_with_non_seed_node
    }

    pub fn is_checkpoint_failed(&self) -> bool {
        self.state.lock().checkpoint_failed
    }

    fn notify_changed(&self) {
        for listener in self.listeners.snapshot().iter() {
            listener.on_state_block_chain_changed();
        }
    }

    /// Appends the hash for a new height. Heights at or below the tip are
    /// ignored. Once the historical parse is done the hash is also gossiped.
    pub fn on_new_state(&self, height: u32, state: &[u8], num_items: Option<u32>) -> Option<StateHash> {
        let (state_hash, parse_complete) = {
            let mut guard = self.state.lock();
            let prev_hash = match guard.blocks.last() {
                Some(last) if height <= last.height() => {
                    tracing::debug!("{} hash for height {} already known", self.kind.name(), height);
                    return None;
                }
                Some(last) => Some(*last.hash()),
                None => None,
            };
            let state_hash = StateHash {
                height,
                hash: chain_hash(prev_hash.as_ref(), state),
                num_items,
            };
            guard.blocks.push(StateBlock::new(state_hash.clone()));
            (state_hash, guard.parse_complete)
        };
        if self.kind == MonitorKind::Dao {
            self.persistence_request.request();
        }
        if parse_complete {
            self.schedule_broadcast(state_hash.clone());
        }
        self.notify_changed();
        Some(state_hash)
    }

    /// Peers get time to reach the same height before our hash arrives.
    fn schedule_broadcast(&self, state_hash: StateHash) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let jitter = rand::thread_rng().gen_range(0..10);
        let delay = self.network_type.state_hash_broadcast_delay(jitter);
        let network_service = self.network_service.clone();
        let shutdown = self.shutdown.clone();
        runtime.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => network_service.broadcast_my_state_hash(state_hash),
            }
        });
    }

    /// Starts talking to peers: from here on we answer requests, take in
    /// their hashes and ask the seed nodes for theirs.
    pub fn on_parse_block_chain_complete(&self) {
        let current_height = {
            let mut guard = self.state.lock();
            if guard.parse_complete {
                return;
            }
            guard.parse_complete = true;
            guard.blocks.last().map(StateBlock::height).unwrap_or(0)
        };
        if let Some(me) = self.me.upgrade() {
            self.network_service.add_listener(me);
        }
        let from_height = current_height.saturating_sub(REQUEST_HEIGHT_OFFSET);
        let requested = self.network_service.request_hashes_from_all_connected_seed_nodes(from_height);
        tracing::info!(
            "🔗 {} chain complete at height {}, asked {} seed nodes from height {}",
            self.kind.name(),
            current_height,
            requested,
            from_height
        );
        self.check_checkpoints();
    }

    fn check_checkpoints(&self) {
        if self.checkpoints.is_empty() {
            return;
        }
        let chain = self.my_state_hashes();
        match verify_checkpoints(&chain, &self.checkpoints) {
            Ok(0) => {}
            Ok(passed) => tracing::info!("✅ Passed {} {} checkpoints", passed, self.kind.name()),
            Err(checkpoint) => self.on_checkpoint_failed(&checkpoint),
        }
    }

    /// Last resort: our DAO data is unrecoverably off, so drop it and let
    /// the application resync.
    fn on_checkpoint_failed(&self, checkpoint: &Checkpoint) {
        {
            let mut guard = self.state.lock();
            if guard.checkpoint_failed {
                return;
            }
            guard.checkpoint_failed = true;
            guard.blocks.clear();
        }
        self.persistence_request.take();
        tracing::error!(
            "❌ {} state at height {} does not match checkpoint {}, deleting local DAO data",
            self.kind.name(),
            checkpoint.height,
            hex::encode(&checkpoint.hash[..8])
        );
        match self.persistence.remove_prefix(DAO_SLOT_PREFIX) {
            Ok(n) => tracing::info!("🧹 Deleted {} DAO stores", n),
            Err(e) => tracing::error!("❌ Deleting DAO stores failed: {}", e),
        }
        if let Some(handler) = self.checkpoint_fail_handler.lock().take() {
            handler();
        }
    }

    /// Compares a peer's hash with ours at the same height. Returns true if
    /// our view of that peer changed.
    pub fn process_peers_state_hash(&self, state_hash: &StateHash, peer: Option<&NodeAddress>) -> bool {
        let peer_key = peer.map(NodeAddress::full_address).unwrap_or_else(|| UNKNOWN_PEER.to_string());
        let is_seed_node = peer.is_some_and(|p| self.network_service.is_seed_node(p));
        let mut guard = self.state.lock();
        let Some(block) = guard.blocks.iter_mut().find(|b| b.height() == state_hash.height) else {
            return false;
        };
        let changed = block.put_peer_hash(&peer_key, state_hash.clone());
        let in_conflict = block.in_conflict_map.contains_key(&peer_key);
        let my_hash = block.my_state_hash.short_hash();

        if changed && in_conflict {
            if is_seed_node {
                guard.in_conflict_with_seed_node = true;
                tracing::warn!(
                    "⚠️ {} conflict with seed node {} at height {}: ours {}, theirs {}",
                    self.kind.name(),
                    peer_key,
                    state_hash.height,
                    my_hash,
                    state_hash.short_hash()
                );
            } else {
                guard.in_conflict_with_non_seed_node = true;
                tracing::info!(
                    "{} conflict with peer {} at height {}: ours {}, theirs {}",
                    self.kind.name(),
                    peer_key,
                    state_hash.height,
                    my_hash,
                    state_hash.short_hash()
                );
            }
        }
        changed
    }
}

impl StateNetworkListener for StateMonitoringService {
    fn on_new_state_hash_message(&self, message: &NewStateHashMessage, peer: Option<&NodeAddress>) {
        let reachable = self
            .current_height()
            .is_some_and(|h| message.state_hash.height <= h);
        if reachable && self.process_peers_state_hash(&message.state_hash, peer) {
            self.notify_changed();
        }
    }

    fn on_get_state_hash_request(&self, connection: &Arc<Connection>, request: &GetStateHashesRequest) {
        let state_hashes: Vec<StateHash> = self
            .state
            .lock()
            .blocks
            .iter()
            .filter(|b| b.height() >= request.height)
            .map(|b| b.my_state_hash.clone())
            .collect();
        self.network_service
            .send_get_state_hashes_response(connection, request.nonce, state_hashes);
    }

    fn on_peers_state_hashes(&self, state_hashes: &[StateHash], peer: Option<&NodeAddress>) {
        let mut changed = false;
        for state_hash in state_hashes {
            changed |= self.process_peers_state_hash(state_hash, peer);
        }
        if changed {
            self.notify_changed();
        }
    }
}

impl PersistedStore for StateMonitoringService {
    fn store_name(&self) -> &'static str {
        DAO_CHAIN_SLOT
    }

    fn persist_if_requested(&self) -> Result<bool, StorageError> {
        if !self.persistence_request.take() {
            return Ok(false);
        }
        let chain = self.my_state_hashes();
        self.persistence.write(DAO_CHAIN_SLOT, &chain)?;
        Ok(true)
    }
}
