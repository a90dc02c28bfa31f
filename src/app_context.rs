//! Everything a running node owns, built from the configuration.

use crate::account::SignedWitnessService;
use crate::broadcast::{Broadcaster, MessageBroadcaster};
use crate::clock::{system_clock, SharedClock};
use crate::config::Config;
use crate::crypto::{KeyRing, PersistedKeyRing};
use crate::error::AppError;
use crate::getdata::RequestDataManager;
use crate::mailbox::MailboxMessageService;
use crate::monitoring::{MonitorKind, StateMonitoringService, StateNetworkService};
use crate::network::capabilities::{Capabilities, Capability};
use crate::network::keep_alive::KeepAliveManager;
use crate::network::node::NetworkNode;
use crate::network::node_address::NodeAddress;
use crate::network::tcp::{TcpNetworkNode, TcpNodeConfig};
use crate::network_type::BaseCurrencyNetwork;
use crate::p2p_service::P2PService;
use crate::shutdown::ShutdownManager;
use crate::storage::p2p_data_storage::privileged_key_filter;
use crate::storage::{P2PDataStorage, Persistence, PersistenceManager};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const KEY_RING_SLOT: &str = "key_ring";

/// Reads our key ring or creates and stores a new one.
pub fn load_or_create_key_ring(persistence: &Persistence) -> Result<KeyRing, AppError> {
    if let Some(persisted) = persistence.read::<PersistedKeyRing>(KEY_RING_SLOT)? {
        return Ok(KeyRing::from_persisted(&persisted));
    }
    let key_ring = KeyRing::generate();
    persistence.write(KEY_RING_SLOT, &key_ring.to_persisted())?;
    persistence.flush()?;
    tracing::info!("🔑 Created new key ring");
    Ok(key_ring)
}

pub struct AppContext {
    pub config: Config,
    pub network_type: BaseCurrencyNetwork,
    pub seed_nodes: Vec<NodeAddress>,
    pub persistence: Persistence,
    pub persistence_manager: Arc<PersistenceManager>,
    pub network_node: Arc<TcpNetworkNode>,
    pub broadcaster: Arc<Broadcaster>,
    pub storage: Arc<P2PDataStorage>,
    pub keep_alive: Arc<KeepAliveManager>,
    pub request_data_manager: Arc<RequestDataManager>,
    pub mailbox: Arc<MailboxMessageService>,
    pub p2p_service: Arc<P2PService>,
    pub monitors: Vec<Arc<StateMonitoringService>>,
    pub signed_witness_service: Arc<SignedWitnessService>,
}

impl AppContext {
    pub fn build(config: Config, shutdown: CancellationToken) -> Result<Self, AppError> {
        Self::build_with_clock(config, system_clock(), shutdown)
    }

    pub fn build_with_clock(config: Config, clock: SharedClock, shutdown: CancellationToken) -> Result<Self, AppError> {
        let network_type = config.node.network_type();
        let seed_nodes = config.network.seed_node_addresses(&network_type)?;
        let advertised_address = config.network.advertised_address(&network_type)?;

        let persistence = Persistence::open(&config.storage.db_path())?;
        let key_ring = load_or_create_key_ring(&persistence)?;

        let mut capabilities = Capabilities::app_defaults();
        if config.network.is_seed_node {
            capabilities.insert(Capability::SeedNode);
        }
        let version = env!("CARGO_PKG_VERSION");

        let network_node = TcpNetworkNode::new(
            TcpNodeConfig {
                listen_addr: config.network.full_listen_address(&network_type),
                advertised_address,
                magic: network_type.magic_bytes(),
                capabilities: capabilities.clone(),
                version: version.to_string(),
            },
            shutdown.clone(),
        );
        let node: Arc<dyn NetworkNode> = network_node.clone();

        let broadcaster = Broadcaster::new(node.clone());
        let storage = Arc::new(P2PDataStorage::new(
            persistence.clone(),
            broadcaster.clone() as Arc<dyn MessageBroadcaster>,
            clock.clone(),
            config.storage.p2p_data_storage_config(),
        ));
        storage.set_filter_predicate(privileged_key_filter(config.filter.privileged_keys()?));
        node.add_message_listener(storage.clone());
        node.add_connection_listener(storage.clone());

        let keep_alive = KeepAliveManager::new(node.clone());
        let request_data_manager = RequestDataManager::new(
            node.clone(),
            storage.clone(),
            seed_nodes.clone(),
            capabilities,
            version,
        );
        let mailbox = MailboxMessageService::new(
            node.clone(),
            storage.clone(),
            key_ring,
            persistence.clone(),
            clock.clone(),
            config.mailbox.republish_mailbox_entries,
            shutdown.clone(),
        );
        let p2p_service = P2PService::new(
            node.clone(),
            storage.clone(),
            request_data_manager.clone(),
            mailbox.clone(),
        );

        let mut monitors = Vec::new();
        if config.monitoring.enabled {
            let dao_checkpoints = config.monitoring.checkpoints()?;
            for kind in [MonitorKind::Dao, MonitorKind::Proposal, MonitorKind::BlindVote] {
                let network_service = StateNetworkService::new(
                    kind,
                    node.clone(),
                    broadcaster.clone(),
                    seed_nodes.iter().cloned(),
                );
                let checkpoints = if kind == MonitorKind::Dao {
                    dao_checkpoints.clone()
                } else {
                    Vec::new()
                };
                let monitor = StateMonitoringService::new(
                    network_service,
                    network_type,
                    persistence.clone(),
                    checkpoints,
                    shutdown.clone(),
                );
                if kind == MonitorKind::Dao {
                    let shutdown = shutdown.clone();
                    monitor.set_checkpoint_fail_handler(Box::new(move || {
                        tracing::error!("🛑 Local DAO data was deleted; restart the node to resync");
                        shutdown.cancel();
                    }));
                }
                monitors.push(monitor);
            }
        }

        let signed_witness_service =
            SignedWitnessService::new(&storage, config.filter.banned_signer_keys()?, clock);

        let persistence_manager = PersistenceManager::new(persistence.clone());
        persistence_manager.register(storage.clone());
        persistence_manager.register(storage.append_only_store().clone());
        persistence_manager.register(storage.protected_store().clone());
        persistence_manager.register(storage.removed_payloads().clone());
        persistence_manager.register(mailbox.clone());
        for monitor in &monitors {
            persistence_manager.register(monitor.clone());
        }

        Ok(Self {
            config,
            network_type,
            seed_nodes,
            persistence,
            persistence_manager,
            network_node,
            broadcaster,
            storage,
            keep_alive,
            request_data_manager,
            mailbox,
            p2p_service,
            monitors,
            signed_witness_service,
        })
    }

    /// Binds the socket and starts every background task.
    pub async fn start(&self, shutdown_manager: &mut ShutdownManager) -> Result<(), AppError> {
        let token = shutdown_manager.token();
        shutdown_manager.set_broadcaster(self.broadcaster.clone());
        shutdown_manager.set_storage(self.storage.clone());
        shutdown_manager.set_persistence_manager(self.persistence_manager.clone());

        shutdown_manager.register_task(self.network_node.start().await?);
        shutdown_manager.register_task(self.persistence_manager.start(token.clone()));
        shutdown_manager.register_task(self.keep_alive.start(token.clone()));
        shutdown_manager.register_task(self.p2p_service.start(token));
        Ok(())
    }

    pub fn monitor(&self, kind: MonitorKind) -> Option<&Arc<StateMonitoringService>> {
        self.monitors.iter().find(|m| m.kind() == kind)
    }

    /// Called by the chain parser once the historical blocks are in.
    pub fn on_parse_block_chain_complete(&self) {
        for monitor in &self.monitors {
            monitor.on_parse_block_chain_complete();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ring_is_created_once() {
        let persistence = Persistence::in_memory();
        let first = load_or_create_key_ring(&persistence).unwrap();
        let second = load_or_create_key_ring(&persistence).unwrap();
        assert_eq!(first.pub_key_ring(), second.pub_key_ring());
    }

    #[tokio::test]
    async fn test_dropped_peer_back_dates_its_offers() {
        use crate::clock::ManualClock;
        use crate::crypto::SignatureKeyPair;
        use crate::network::message::{Hello, NetworkEnvelope};
        use crate::network::wire::{read_envelope, write_envelope};
        use crate::storage::payload::{OfferDirection, OfferPayload, ProtectedStoragePayload};
        use crate::storage::ProtectedStorageEntry;
        use std::time::Duration;

        const NOW: i64 = 1_700_000_000_000;
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .unwrap()
            .port();
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = dir.path().to_string_lossy().to_string();
        config.network.listen_address = format!("127.0.0.1:{}", port);
        config.network.seed_nodes = vec!["127.0.0.1:2002".to_string()];
        let shutdown = CancellationToken::new();
        let context =
            AppContext::build_with_clock(config, Arc::new(ManualClock::new(NOW)), shutdown.clone()).unwrap();
        let _accept = context.network_node.start().await.unwrap();

        let maker = NodeAddress::new("maker.onion", 9999);
        let keys = SignatureKeyPair::generate();
        let payload = ProtectedStoragePayload::Offer(OfferPayload {
            id: "offer-1".to_string(),
            owner_node_address: maker.clone(),
            direction: OfferDirection::Sell,
            currency_code: "EUR".to_string(),
            price: 30_000,
            amount: 100,
            min_amount: 50,
            date: NOW,
            owner_pub_key: keys.public(),
            extra_data: None,
        });
        let ttl = payload.ttl().unwrap().as_millis() as i64;
        let hash = payload.hash();
        assert!(context.storage.add_protected_storage_entry(
            ProtectedStorageEntry::signed(payload, &keys, 1, NOW),
            None,
            None,
            false
        ));

        // The maker connects, says hello and vanishes without a close message.
        let magic = context.network_type.magic_bytes();
        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let hello = NetworkEnvelope::Hello(Hello {
            magic,
            node_address: maker,
            capabilities: Capabilities::app_defaults(),
            version: "1.0.0".to_string(),
        });
        write_envelope(&mut stream, magic, &hello).await.unwrap();
        assert!(matches!(
            read_envelope(&mut stream, magic).await.unwrap(),
            Some(NetworkEnvelope::Hello(_))
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(stream);

        let expected = NOW - ttl / 2;
        let mut back_dated = false;
        for _ in 0..200 {
            if context.storage.get(&hash).map(|e| e.creation_timestamp()) == Some(expected) {
                back_dated = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(back_dated);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_build_wires_every_service() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = dir.path().to_string_lossy().to_string();
        config.network.listen_address = "127.0.0.1:0".to_string();
        config.network.seed_nodes = vec!["127.0.0.1:2002".to_string()];

        let context = AppContext::build(config, CancellationToken::new()).unwrap();
        assert_eq!(context.network_type, BaseCurrencyNetwork::Regtest);
        assert_eq!(context.seed_nodes, vec![NodeAddress::new("127.0.0.1", 2002)]);
        assert_eq!(context.monitors.len(), 3);
        assert!(context.monitor(MonitorKind::Dao).is_some());
        assert!(!context.p2p_service.is_bootstrapped());
        assert!(context.signed_witness_service.is_empty());
    }
}
