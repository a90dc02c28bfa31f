//! Brings the node from "listening" to "bootstrapped".
//!
//! Initial data comes from one seed node (preliminary request, then the
//! updated request once we are reachable). When that succeeds the storage
//! expiry sweep starts and the mailbox starts following the map.

use crate::getdata::{DataRequestListener, RequestDataManager};
use crate::listeners::ListenerList;
use crate::mailbox::MailboxMessageService;
use crate::network::node::NetworkNode;
use crate::storage::P2PDataStorage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const BOOTSTRAP_RETRY_DELAY: Duration = Duration::from_secs(30);

pub trait P2PServiceListener: Send + Sync {
    fn on_data_received(&self) {}

    fn on_no_seed_node_available(&self) {}

    fn on_bootstrapped(&self) {}
}

pub struct P2PService {
    network_node: Arc<dyn NetworkNode>,
    storage: Arc<P2PDataStorage>,
    request_data_manager: Arc<RequestDataManager>,
    mailbox: Arc<MailboxMessageService>,
    listeners: ListenerList<dyn P2PServiceListener>,
    bootstrapped: AtomicBool,
}

/// Relays data-request progress to our own listeners.
struct DataRequestRelay(std::sync::Weak<P2PService>);

impl DataRequestListener for DataRequestRelay {
    fn on_preliminary_data_received(&self) {
        if let Some(service) = self.0.upgrade() {
            tracing::info!("📥 Preliminary data received ({} entries)", service.storage.len());
            for listener in service.listeners.snapshot().iter() {
                listener.on_data_received();
            }
        }
    }

    fn on_no_seed_node_available(&self) {
        if let Some(service) = self.0.upgrade() {
            for listener in service.listeners.snapshot().iter() {
                listener.on_no_seed_node_available();
            }
        }
    }
}

impl P2PService {
    pub fn new(
        network_node: Arc<dyn NetworkNode>,
        storage: Arc<P2PDataStorage>,
        request_data_manager: Arc<RequestDataManager>,
        mailbox: Arc<MailboxMessageService>,
    ) -> Arc<Self> {
        let service = Arc::new(Self {
            network_node,
            storage,
            request_data_manager,
            mailbox,
            listeners: ListenerList::new(),
            bootstrapped: AtomicBool::new(false),
        });
        service
            .request_data_manager
            .add_listener(Arc::new(DataRequestRelay(Arc::downgrade(&service))));
        service
    }

    pub fn add_listener(&self, listener: Arc<dyn P2PServiceListener>) {
        self.listeners.add(listener);
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::SeqCst)
    }

    pub fn num_connected_peers(&self) -> usize {
        self.network_node.confirmed_connections().len()
    }

    pub fn storage(&self) -> &Arc<P2PDataStorage> {
        &self.storage
    }

    pub fn mailbox(&self) -> &Arc<MailboxMessageService> {
        &self.mailbox
    }

    /// One bootstrap attempt.
    pub async fn bootstrap(&self) -> bool {
        if self.is_bootstrapped() {
            return true;
        }
        if !self.request_data_manager.bootstrap().await {
            return false;
        }
        self.on_bootstrapped();
        true
    }

    fn on_bootstrapped(&self) {
        if self.bootstrapped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.mailbox.on_bootstrapped();
        tracing::info!(
            "✅ P2P network ready: {} entries, {} peers, synced from {}",
            self.storage.len(),
            self.num_connected_peers(),
            self.request_data_manager
                .synced_from()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "local data".to_string())
        );
        for listener in self.listeners.snapshot().iter() {
            listener.on_bootstrapped();
        }
    }

    /// Retries bootstrapping until it succeeds or the node shuts down.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                if service.bootstrap().await {
                    break;
                }
                tracing::info!(
                    "🌐 Bootstrap failed, retrying in {}s",
                    BOOTSTRAP_RETRY_DELAY.as_secs()
                );
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(BOOTSTRAP_RETRY_DELAY) => {}
                }
            }
        })
    }
}
