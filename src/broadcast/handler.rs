//! One broadcast cycle: fan a batch of requests out to shuffled peers and
//! report to each request's listener exactly once.

use crate::broadcast::{BroadcastListener, BroadcastRequest, BroadcastResult};
use crate::network::connection::Connection;
use crate::network::message::{BundleOfEnvelopes, NetworkEnvelope};
use crate::network::node::NetworkNode;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub const BASE_TIMEOUT: Duration = Duration::from_secs(120);
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);
pub const MAX_RELAY_PEERS: usize = 7;
pub const RESILIENCE_TARGET: usize = 3;

const OWN_MESSAGE_DELAY: Duration = Duration::from_millis(50);
const RELAY_DELAY: Duration = Duration::from_millis(100);
const SHUTDOWN_DELAY: Duration = Duration::from_millis(1);

#[derive(Default)]
struct HandlerState {
    num_peers: usize,
    num_completed: usize,
    num_failed: usize,
    timed_out: bool,
    notified: Vec<bool>,
}

impl HandlerState {
    fn target(&self) -> usize {
        self.num_peers.min(RESILIENCE_TARGET).max(1)
    }

    fn result(&self) -> BroadcastResult {
        BroadcastResult {
            num_peers: self.num_peers,
            num_completed: self.num_completed,
            num_failed: self.num_failed,
        }
    }
}

enum Verdict {
    Sufficient,
    NotSufficient,
}

pub struct BroadcastHandler {
    network_node: Arc<dyn NetworkNode>,
    state: Mutex<HandlerState>,
    stopped: CancellationToken,
}

impl BroadcastHandler {
    pub fn new(network_node: Arc<dyn NetworkNode>) -> Self {
        Self {
            network_node,
            state: Mutex::new(HandlerState::default()),
            stopped: CancellationToken::new(),
        }
    }

    /// Stops pending sends. Listeners not yet notified are not called.
    pub fn cancel(&self) {
        self.stopped.cancel();
    }

    pub fn result(&self) -> BroadcastResult {
        self.state.lock().result()
    }

    /// Runs the cycle to completion, timeout or cancellation.
    pub async fn broadcast(self: Arc<Self>, requests: Vec<BroadcastRequest>, shutdown_requested: bool) -> BroadcastResult {
        let mut connections = self.network_node.confirmed_connections();
        connections.shuffle(&mut rand::thread_rng());

        let (num_peers, delay) = if shutdown_requested {
            (connections.len(), SHUTDOWN_DELAY)
        } else if self.contains_own_message(&requests) {
            (connections.len(), OWN_MESSAGE_DELAY)
        } else {
            (connections.len().min(MAX_RELAY_PEERS), RELAY_DELAY)
        };
        connections.truncate(num_peers);

        let timeout = if shutdown_requested {
            SHUTDOWN_TIMEOUT
        } else {
            BASE_TIMEOUT + delay * (num_peers as u32 + 1)
        };

        {
            let mut state = self.state.lock();
            state.num_peers = num_peers;
            state.notified = vec![false; requests.len()];
        }
        tracing::debug!(
            "📡 Broadcasting {} messages to {} peers (timeout {:?})",
            requests.len(),
            num_peers,
            timeout
        );

        let requests = Arc::new(requests);
        let mut sends = JoinSet::new();
        for (i, connection) in connections.into_iter().enumerate() {
            let min_delay = delay * (i as u32 + 1);
            let max_delay = delay * (i as u32 + 2);
            let wait = rand::thread_rng().gen_range(min_delay..max_delay);
            let handler = self.clone();
            let requests = requests.clone();
            sends.spawn(async move {
                tokio::select! {
                    _ = handler.stopped.cancelled() => {}
                    _ = tokio::time::sleep(wait) => handler.send_to_peer(connection, &requests).await,
                }
            });
        }

        let all_sent = async {
            while sends.join_next().await.is_some() {}
        };
        tokio::select! {
            _ = all_sent => {}
            _ = tokio::time::sleep(timeout) => {
                tracing::info!("⏱️ Broadcast timed out after {:?}: {:?}", timeout, self.result());
                self.state.lock().timed_out = true;
            }
            _ = self.stopped.cancelled() => return self.result(),
        }
        self.stopped.cancel();
        sends.abort_all();

        let all: Vec<usize> = (0..requests.len()).collect();
        self.notify_remaining(&requests, &all);
        self.result()
    }

    /// A request without a sender was created locally.
    fn contains_own_message(&self, requests: &[BroadcastRequest]) -> bool {
        let my_address = self.network_node.node_address();
        requests
            .iter()
            .any(|r| r.sender.is_none() || (my_address.is_some() && r.sender == my_address))
    }

    /// Requests for `connection`: never echo a message back to the peer it
    /// came from, and skip messages the peer lacks capabilities for.
    fn requests_for_connection(connection: &Connection, requests: &[BroadcastRequest]) -> Vec<usize> {
        let peer = connection.peers_node_address();
        requests
            .iter()
            .enumerate()
            .filter(|(_, r)| peer.is_none() || r.sender != peer)
            .filter(|(_, r)| connection.test_capability(&NetworkEnvelope::Broadcast(r.message.clone())))
            .map(|(i, _)| i)
            .collect()
    }

    async fn send_to_peer(&self, connection: Arc<Connection>, requests: &[BroadcastRequest]) {
        let indices = Self::requests_for_connection(&connection, requests);
        if indices.is_empty() || connection.is_stopped() {
            {
                let mut state = self.state.lock();
                state.num_peers = state.num_peers.saturating_sub(1);
            }
            self.maybe_notify(requests, &indices);
            return;
        }

        let envelope = if indices.len() == 1 {
            NetworkEnvelope::Broadcast(requests[indices[0]].message.clone())
        } else {
            NetworkEnvelope::BundleOfEnvelopes(BundleOfEnvelopes {
                envelopes: indices
                    .iter()
                    .map(|&i| NetworkEnvelope::Broadcast(requests[i].message.clone()))
                    .collect(),
            })
        };

        let sent = self.network_node.send_message(&connection, envelope).await;
        {
            let mut state = self.state.lock();
            match &sent {
                Ok(()) => state.num_completed += 1,
                Err(e) => {
                    tracing::warn!("⚠️ Broadcast to {:?} failed: {}", connection.peers_node_address(), e);
                    state.num_failed += 1;
                }
            }
        }
        if self.stopped.is_cancelled() {
            return;
        }
        self.maybe_notify(requests, &indices);
    }

    fn maybe_notify(&self, requests: &[BroadcastRequest], indices: &[usize]) {
        let (verdict, result, listeners) = {
            let mut state = self.state.lock();
            let target = state.target();
            let verdict = if state.num_completed >= target {
                Verdict::Sufficient
            } else if state.num_peers.saturating_sub(state.num_failed) < target || state.timed_out {
                Verdict::NotSufficient
            } else {
                return;
            };
            let listeners = Self::take_unnotified(&mut state, requests, indices);
            (verdict, state.result(), listeners)
        };
        Self::dispatch(verdict, &result, &listeners);
    }

    /// Final accounting: whoever was not told yet hears the outcome now.
    fn notify_remaining(&self, requests: &[BroadcastRequest], indices: &[usize]) {
        let (verdict, result, listeners) = {
            let mut state = self.state.lock();
            let verdict = if state.num_completed >= state.target() {
                Verdict::Sufficient
            } else {
                Verdict::NotSufficient
            };
            let listeners = Self::take_unnotified(&mut state, requests, indices);
            (verdict, state.result(), listeners)
        };
        Self::dispatch(verdict, &result, &listeners);
    }

    fn take_unnotified(
        state: &mut HandlerState,
        requests: &[BroadcastRequest],
        indices: &[usize],
    ) -> Vec<Arc<dyn BroadcastListener>> {
        let mut listeners = Vec::new();
        for &i in indices {
            if state.notified.get(i).copied().unwrap_or(true) {
                continue;
            }
            state.notified[i] = true;
            if let Some(listener) = &requests[i].listener {
                listeners.push(listener.clone());
            }
        }
        listeners
    }

    fn dispatch(verdict: Verdict, result: &BroadcastResult, listeners: &[Arc<dyn BroadcastListener>]) {
        for listener in listeners {
            match verdict {
                Verdict::Sufficient => listener.on_sufficiently_broadcast(result),
                Verdict::NotSufficient => listener.on_not_sufficiently_broadcast(result),
            }
        }
    }
}
