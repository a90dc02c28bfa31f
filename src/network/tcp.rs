//! TCP transport.
//!
//! Every connection starts with both sides sending a `Hello` carrying the
//! network magic, the advertised node address and the capability set. After
//! that, frames are dispatched to the registered message listeners with
//! bundles unpacked first.

use crate::error::{NetworkError, ProtocolError};
use crate::listeners::ListenerList;
use crate::network::capabilities::Capabilities;
use crate::network::connection::{CloseConnectionReason, Connection};
use crate::network::message::{BundleOfEnvelopes, Hello, NetworkEnvelope};
use crate::network::node::{ConnectionListener, MessageListener, NetworkNode};
use crate::network::node_address::NodeAddress;
use crate::network::wire::{read_envelope, write_envelope};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const SEND_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Debug)]
pub struct TcpNodeConfig {
    pub listen_addr: String,
    pub advertised_address: NodeAddress,
    pub magic: [u8; 4],
    pub capabilities: Capabilities,
    pub version: String,
}

struct Outbound {
    envelope: NetworkEnvelope,
    done: oneshot::Sender<Result<(), NetworkError>>,
}

struct PeerHandle {
    connection: Arc<Connection>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

pub struct TcpNetworkNode {
    me: Weak<TcpNetworkNode>,
    config: TcpNodeConfig,
    node_address: RwLock<Option<NodeAddress>>,
    peers: RwLock<HashMap<String, PeerHandle>>,
    message_listeners: ListenerList<dyn MessageListener>,
    connection_listeners: ListenerList<dyn ConnectionListener>,
    shutdown: CancellationToken,
}

impl TcpNetworkNode {
    pub fn new(config: TcpNodeConfig, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            node_address: RwLock::new(None),
            peers: RwLock::new(HashMap::new()),
            message_listeners: ListenerList::new(),
            connection_listeners: ListenerList::new(),
            shutdown,
        })
    }

    /// Binds the listener and starts accepting peers.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, NetworkError> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        *self.node_address.write() = Some(self.config.advertised_address.clone());
        tracing::info!(
            "🌐 P2P node listening on {} (advertised as {})",
            self.config.listen_addr,
            self.config.advertised_address
        );

        let node = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = node.shutdown.cancelled() => {
                        tracing::debug!("🛑 Accept loop stopped");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            tracing::debug!("🔌 Inbound connection from {}", addr);
                            let node = node.clone();
                            tokio::spawn(async move {
                                if let Err(e) = node.clone().attach(stream).await {
                                    tracing::debug!("🚫 Inbound handshake with {} failed: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!("❌ Accept failed: {}", e);
                        }
                    }
                }
            }
        }))
    }

    async fn dial(self: &Arc<Self>, address: &NodeAddress) -> Result<Arc<Connection>, NetworkError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address.full_address()))
            .await
            .map_err(|_| NetworkError::Timeout(format!("connect to {}", address)))??;
        let connection = self.clone().attach(stream).await?;
        if connection.peers_node_address().as_ref() != Some(address) {
            tracing::debug!(
                "Peer dialed at {} advertises {:?}",
                address,
                connection.peers_node_address()
            );
        }
        Ok(connection)
    }

    /// Runs the handshake on a fresh stream and starts its reader and writer.
    async fn attach(self: Arc<Self>, stream: TcpStream) -> Result<Arc<Connection>, NetworkError> {
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);
        let magic = self.config.magic;

        let hello = NetworkEnvelope::Hello(Hello {
            magic,
            node_address: self.config.advertised_address.clone(),
            capabilities: self.config.capabilities.clone(),
            version: self.config.version.clone(),
        });
        write_envelope(&mut writer, magic, &hello).await?;

        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_envelope(&mut reader, magic))
            .await
            .map_err(|_| NetworkError::Timeout("handshake".to_string()))??;
        let peer_hello = match first {
            Some(NetworkEnvelope::Hello(hello)) if hello.magic == magic => hello,
            Some(other) => {
                return Err(NetworkError::HandshakeRejected(format!(
                    "expected Hello, got {}",
                    other.message_type()
                )))
            }
            None => return Err(NetworkError::ConnectionClosed("during handshake".to_string())),
        };

        let connection = Arc::new(Connection::new(
            Some(peer_hello.node_address.clone()),
            peer_hello.capabilities,
        ));
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
        self.peers.write().insert(
            connection.uid().to_string(),
            PeerHandle {
                connection: connection.clone(),
                outbound: tx,
            },
        );
        tracing::info!(
            "✅ Connected to {} (version {})",
            peer_hello.node_address,
            peer_hello.version
        );
        for listener in self.connection_listeners.snapshot().iter() {
            listener.on_connection(&connection);
        }

        let writer_connection = connection.clone();
        tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                let result = write_envelope(&mut writer, magic, &outbound.envelope).await;
                let failed = result.is_err();
                let _ = outbound.done.send(result);
                if failed || writer_connection.is_stopped() {
                    break;
                }
            }
        });

        let node = self.clone();
        let reader_connection = connection.clone();
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = node.shutdown.cancelled() => break CloseConnectionReason::Shutdown,
                    frame = read_envelope(&mut reader, magic) => match frame {
                        Ok(Some(envelope)) => node.dispatch(envelope, &reader_connection),
                        Ok(None) => break CloseConnectionReason::SocketClosed,
                        Err(NetworkError::Protocol(ProtocolError::Foreign(e))) => {
                            tracing::warn!(
                                "🚫 Dropping {:?} after malformed data: {}",
                                reader_connection.peers_node_address(),
                                e
                            );
                            break CloseConnectionReason::RuleViolation;
                        }
                        Err(e) => {
                            tracing::debug!("Connection {} read error: {}", reader_connection.uid(), e);
                            break CloseConnectionReason::Reset;
                        }
                    }
                }
            };
            node.close(&reader_connection, reason);
        });

        Ok(connection)
    }

    fn dispatch(&self, envelope: NetworkEnvelope, connection: &Arc<Connection>) {
        match envelope {
            NetworkEnvelope::BundleOfEnvelopes(bundle) => {
                for inner in bundle.envelopes {
                    self.dispatch(inner, connection);
                }
            }
            NetworkEnvelope::Hello(_) => {
                tracing::debug!("Ignoring repeated Hello from {:?}", connection.peers_node_address());
            }
            envelope => {
                for listener in self.message_listeners.snapshot().iter() {
                    listener.on_message(&envelope, connection);
                }
            }
        }
    }

    fn close(&self, connection: &Arc<Connection>, reason: CloseConnectionReason) {
        if !connection.mark_stopped() {
            return;
        }
        self.peers.write().remove(connection.uid());
        tracing::info!(
            "🔌 Connection to {:?} closed ({:?})",
            connection.peers_node_address(),
            reason
        );
        for listener in self.connection_listeners.snapshot().iter() {
            listener.on_disconnect(reason, connection);
        }
    }

    fn self_handle(&self) -> Option<Arc<Self>> {
        self.me.upgrade()
    }

    /// Drops envelopes inside a bundle that this peer cannot handle.
    fn filter_for_peer(envelope: NetworkEnvelope, connection: &Connection) -> Option<NetworkEnvelope> {
        match envelope {
            NetworkEnvelope::BundleOfEnvelopes(bundle) => {
                let envelopes: Vec<NetworkEnvelope> = bundle
                    .envelopes
                    .into_iter()
                    .filter(|e| connection.test_capability(e))
                    .collect();
                match envelopes.len() {
                    0 => None,
                    1 => envelopes.into_iter().next(),
                    _ => Some(NetworkEnvelope::BundleOfEnvelopes(BundleOfEnvelopes { envelopes })),
                }
            }
            envelope if connection.test_capability(&envelope) => Some(envelope),
            _ => None,
        }
    }
}

#[async_trait]
impl NetworkNode for TcpNetworkNode {
    fn node_address(&self) -> Option<NodeAddress> {
        self.node_address.read().clone()
    }

    fn confirmed_connections(&self) -> Vec<Arc<Connection>> {
        self.peers
            .read()
            .values()
            .filter(|p| !p.connection.is_stopped())
            .map(|p| p.connection.clone())
            .collect()
    }

    async fn send_message(
        &self,
        connection: &Arc<Connection>,
        envelope: NetworkEnvelope,
    ) -> Result<(), NetworkError> {
        let message_type = envelope.message_type();
        let Some(envelope) = Self::filter_for_peer(envelope, connection) else {
            tracing::debug!(
                "Not sending {} to {:?}: missing capability",
                message_type,
                connection.peers_node_address()
            );
            return Ok(());
        };

        let outbound = self
            .peers
            .read()
            .get(connection.uid())
            .map(|p| p.outbound.clone())
            .ok_or_else(|| NetworkError::ConnectionClosed(connection.uid().to_string()))?;

        let (done_tx, done_rx) = oneshot::channel();
        outbound
            .send(Outbound {
                envelope,
                done: done_tx,
            })
            .map_err(|_| NetworkError::ConnectionClosed(connection.uid().to_string()))?;

        match tokio::time::timeout(SEND_TIMEOUT, done_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NetworkError::ConnectionClosed(connection.uid().to_string())),
            Err(_) => Err(NetworkError::Timeout(format!("send {}", message_type))),
        }
    }

    async fn send_message_to(
        &self,
        address: &NodeAddress,
        envelope: NetworkEnvelope,
    ) -> Result<Arc<Connection>, NetworkError> {
        let connection = match self.find_connection(address) {
            Some(connection) => connection,
            None => {
                let node = self
                    .self_handle()
                    .ok_or_else(|| NetworkError::NotConnected(address.to_string()))?;
                node.dial(address).await?
            }
        };
        self.send_message(&connection, envelope).await?;
        Ok(connection)
    }

    fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        self.message_listeners.add(listener);
    }

    fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.connection_listeners.add(listener);
    }
}
