//! Responder side of bulk sync: answers one data request.

use crate::error::NetworkError;
use crate::getdata::messages::GetDataRequest;
use crate::network::capabilities::Capabilities;
use crate::network::connection::Connection;
use crate::network::message::NetworkEnvelope;
use crate::network::node::NetworkNode;
use crate::storage::P2PDataStorage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const TIMEOUT: Duration = Duration::from_secs(240);

pub trait GetDataRequestHandlerListener: Send + Sync {
    /// `serialized_size` is the byte size of the response that was sent.
    fn on_complete(&self, serialized_size: usize);

    fn on_fault(&self, error_message: &str, connection: &Arc<Connection>);
}

pub struct GetDataRequestHandler {
    network_node: Arc<dyn NetworkNode>,
    storage: Arc<P2PDataStorage>,
    listener: Arc<dyn GetDataRequestHandlerListener>,
    stopped: AtomicBool,
}

impl GetDataRequestHandler {
    pub fn new(
        network_node: Arc<dyn NetworkNode>,
        storage: Arc<P2PDataStorage>,
        listener: Arc<dyn GetDataRequestHandlerListener>,
    ) -> Self {
        Self {
            network_node,
            storage,
            listener,
            stopped: AtomicBool::new(false),
        }
    }

    /// True the first time only, so the listener hears back once whether
    /// the send or the timeout finishes first.
    fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Capabilities to filter the response by. A preliminary request may
    /// arrive before the peer's capabilities are known on the connection.
    fn peer_capabilities(request: &GetDataRequest, connection: &Connection) -> Capabilities {
        let known = connection.capabilities();
        match request {
            GetDataRequest::Preliminary(r) if known.is_empty() => r.supported_capabilities.clone(),
            _ => known,
        }
    }

    pub async fn handle(&self, request: GetDataRequest, connection: Arc<Connection>) {
        let capabilities = Self::peer_capabilities(&request, &connection);
        let response = self.storage.build_get_data_response(&request, &capabilities);
        let envelope = NetworkEnvelope::GetDataResponse(response);
        let size = envelope.serialized_size();

        let sent = tokio::time::timeout(TIMEOUT, self.network_node.send_message(&connection, envelope)).await;
        if !self.stop() {
            tracing::trace!("Data response for {:?} finished after handler stopped", connection);
            return;
        }
        match sent {
            Ok(Ok(())) => {
                tracing::debug!("📤 Sent data response of {} bytes to {:?}", size, connection.peers_node_address());
                self.listener.on_complete(size);
            }
            Ok(Err(e)) => self.fault(&format!("Sending data response failed: {}", e), &connection),
            Err(_) => {
                let e = NetworkError::Timeout(format!("data response not sent within {:?}", TIMEOUT));
                self.fault(&e.to_string(), &connection);
            }
        }
    }

    fn fault(&self, message: &str, connection: &Arc<Connection>) {
        tracing::info!("❌ {} (peer {:?})", message, connection.peers_node_address());
        self.listener.on_fault(message, connection);
    }
}
