//! Ping/Pong keep-alive and self-connectivity probe.

use crate::error::NetworkError;
use crate::network::connection::Connection;
use crate::network::message::{NetworkEnvelope, Ping, Pong};
use crate::network::node::{MessageListener, NetworkNode};
use crate::network::node_address::NodeAddress;
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const PING_TIMEOUT: Duration = Duration::from_secs(30);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

pub struct KeepAliveManager {
    network_node: Arc<dyn NetworkNode>,
    pending: DashMap<u32, oneshot::Sender<()>>,
    last_round_trip_ms: AtomicU64,
}

impl KeepAliveManager {
    pub fn new(network_node: Arc<dyn NetworkNode>) -> Arc<Self> {
        let manager = Arc::new(Self {
            network_node: network_node.clone(),
            pending: DashMap::new(),
            last_round_trip_ms: AtomicU64::new(0),
        });
        network_node.add_message_listener(manager.clone());
        manager
    }

    /// Resolves with the round trip time once the peer answers.
    pub async fn ping(&self, address: &NodeAddress) -> Result<Duration, NetworkError> {
        let nonce: u32 = rand::thread_rng().gen();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(nonce, tx);

        let started = Instant::now();
        let ping = NetworkEnvelope::Ping(Ping {
            nonce,
            last_round_trip_time_ms: self.last_round_trip_ms.load(Ordering::Relaxed),
        });
        if let Err(e) = self.network_node.send_message_to(address, ping).await {
            self.pending.remove(&nonce);
            return Err(e);
        }

        match tokio::time::timeout(PING_TIMEOUT, rx).await {
            Ok(Ok(())) => {
                let elapsed = started.elapsed();
                self.last_round_trip_ms
                    .store(elapsed.as_millis() as u64, Ordering::Relaxed);
                Ok(elapsed)
            }
            Ok(Err(_)) => Err(NetworkError::ConnectionClosed(address.to_string())),
            Err(_) => {
                self.pending.remove(&nonce);
                Err(NetworkError::Timeout(format!("pong from {}", address)))
            }
        }
    }

    /// Pings every confirmed peer on a fixed interval until cancelled.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEP_ALIVE_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        for connection in manager.network_node.confirmed_connections() {
                            let Some(address) = connection.peers_node_address() else {
                                continue;
                            };
                            let manager = manager.clone();
                            tokio::spawn(async move {
                                if let Err(e) = manager.ping(&address).await {
                                    tracing::debug!("Keep-alive ping to {} failed: {}", address, e);
                                }
                            });
                        }
                    }
                }
            }
        })
    }
}

impl MessageListener for KeepAliveManager {
    fn on_message(&self, envelope: &NetworkEnvelope, connection: &Arc<Connection>) {
        match envelope {
            NetworkEnvelope::Ping(ping) => {
                let network_node = self.network_node.clone();
                let connection = connection.clone();
                let pong = NetworkEnvelope::Pong(Pong {
                    request_nonce: ping.nonce,
                });
                tokio::spawn(async move {
                    if let Err(e) = network_node.send_message(&connection, pong).await {
                        tracing::debug!("Sending Pong failed: {}", e);
                    }
                });
            }
            NetworkEnvelope::Pong(pong) => {
                if let Some((_, tx)) = self.pending.remove(&pong.request_nonce) {
                    let _ = tx.send(());
                } else {
                    tracing::trace!("Unsolicited Pong {}", pong.request_nonce);
                }
            }
            _ => {}
        }
    }
}
