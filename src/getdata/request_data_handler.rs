//! Requester side of bulk sync.
//!
//! Each outstanding request is a nonce-keyed oneshot; the response listener
//! resolves it and the requester applies the data to storage.

use crate::error::NetworkError;
use crate::getdata::messages::{GetDataResponse, GetUpdatedDataRequest, PreliminaryGetDataRequest};
use crate::network::capabilities::Capabilities;
use crate::network::connection::Connection;
use crate::network::message::NetworkEnvelope;
use crate::network::node::{MessageListener, NetworkNode};
use crate::network::node_address::NodeAddress;
use crate::storage::P2PDataStorage;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

pub const TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestDataOutcome {
    pub num_entries: usize,
    pub num_payloads: usize,
    pub was_truncated: bool,
    pub truncated_kinds: Vec<String>,
}

struct PendingRequest {
    peer: NodeAddress,
    response: oneshot::Sender<GetDataResponse>,
}

pub struct RequestDataHandler {
    network_node: Arc<dyn NetworkNode>,
    storage: Arc<P2PDataStorage>,
    capabilities: Capabilities,
    version: String,
    pending: DashMap<u32, PendingRequest>,
}

impl RequestDataHandler {
    pub fn new(
        network_node: Arc<dyn NetworkNode>,
        storage: Arc<P2PDataStorage>,
        capabilities: Capabilities,
        version: impl Into<String>,
    ) -> Arc<Self> {
        let handler = Arc::new(Self {
            network_node: network_node.clone(),
            storage,
            capabilities,
            version: version.into(),
            pending: DashMap::new(),
        });
        network_node.add_message_listener(handler.clone());
        handler
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn build_request(&self, nonce: u32, preliminary: bool) -> Result<NetworkEnvelope, NetworkError> {
        let excluded_keys = self.storage.get_known_payload_hashes();
        if preliminary {
            return Ok(NetworkEnvelope::PreliminaryGetDataRequest(PreliminaryGetDataRequest {
                nonce,
                excluded_keys,
                supported_capabilities: self.capabilities.clone(),
                version: self.version.clone(),
            }));
        }
        let sender_node_address = self
            .network_node
            .node_address()
            .ok_or_else(|| NetworkError::NotConnected("own address not known yet".to_string()))?;
        Ok(NetworkEnvelope::GetUpdatedDataRequest(GetUpdatedDataRequest {
            sender_node_address,
            nonce,
            excluded_keys,
            version: self.version.clone(),
        }))
    }

    /// Asks `peer` for everything we do not have and applies the answer.
    pub async fn request_data(&self, peer: &NodeAddress, preliminary: bool) -> Result<RequestDataOutcome, NetworkError> {
        let nonce: u32 = rand::random();
        let request = self.build_request(nonce, preliminary)?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            nonce,
            PendingRequest {
                peer: peer.clone(),
                response: tx,
            },
        );

        let result = async {
            self.network_node.send_message_to(peer, request).await?;
            match tokio::time::timeout(TIMEOUT, rx).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(_)) => Err(NetworkError::ConnectionClosed(peer.to_string())),
                Err(_) => Err(NetworkError::Timeout(format!("no data response from {} within {:?}", peer, TIMEOUT))),
            }
        }
        .await;
        self.pending.remove(&nonce);

        let response = result?;
        Ok(self.apply_response(response, peer))
    }

    fn apply_response(&self, response: GetDataResponse, peer: &NodeAddress) -> RequestDataOutcome {
        let outcome = RequestDataOutcome {
            num_entries: response.data_set.len(),
            num_payloads: response.persistable_network_payload_set.len(),
            was_truncated: response.was_truncated,
            truncated_kinds: response.truncated_kinds.clone(),
        };
        for entry in response.data_set {
            self.storage.add_protected_storage_entry(entry, Some(peer), None, false);
        }
        for payload in response.persistable_network_payload_set {
            self.storage.add_persistable_network_payload(payload, Some(peer), false, false, false);
        }
        if outcome.was_truncated {
            tracing::info!(
                "✂️ Data response from {} was truncated ({:?})",
                peer,
                outcome.truncated_kinds
            );
        }
        tracing::info!(
            "📥 Received {} entries and {} payloads from {}",
            outcome.num_entries,
            outcome.num_payloads,
            peer
        );
        outcome
    }
}

impl MessageListener for RequestDataHandler {
    fn on_message(&self, envelope: &NetworkEnvelope, connection: &Arc<Connection>) {
        let NetworkEnvelope::GetDataResponse(response) = envelope else {
            return;
        };
        let from_expected_peer = self
            .pending
            .get(&response.request_nonce)
            .is_some_and(|p| connection.peers_node_address().as_ref() == Some(&p.peer));
        if !from_expected_peer {
            tracing::debug!("Ignoring data response with unknown nonce {}", response.request_nonce);
            return;
        }
        if let Some((_, pending)) = self.pending.remove(&response.request_nonce) {
            let _ = pending.response.send(response.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crypto::SignatureKeyPair;
    use crate::storage::payload::{Alert, ProtectedStoragePayload};
    use crate::storage::{P2PDataStorageConfig, Persistence, ProtectedStorageEntry};
    use crate::test_support::{RecordingBroadcaster, StaticNode};

    const NOW: i64 = 1_700_000_000_000;

    fn handler(node: &Arc<StaticNode>) -> (Arc<RequestDataHandler>, Arc<P2PDataStorage>) {
        let storage = Arc::new(P2PDataStorage::new(
            Persistence::in_memory(),
            Arc::new(RecordingBroadcaster::default()),
            Arc::new(ManualClock::new(NOW)),
            P2PDataStorageConfig::default(),
        ));
        let handler = RequestDataHandler::new(node.clone(), storage.clone(), Capabilities::app_defaults(), "1.0.0");
        (handler, storage)
    }

    /// Waits until the request went out and returns its nonce.
    async fn sent_nonce(node: &StaticNode) -> u32 {
        loop {
            let nonce = node.sent.lock().iter().find_map(|(_, envelope)| match envelope {
                NetworkEnvelope::PreliminaryGetDataRequest(r) => Some(r.nonce),
                NetworkEnvelope::GetUpdatedDataRequest(r) => Some(r.nonce),
                _ => None,
            });
            if let Some(nonce) = nonce {
                return nonce;
            }
            tokio::task::yield_now().await;
        }
    }

    fn response(nonce: u32, data_set: Vec<ProtectedStorageEntry>) -> NetworkEnvelope {
        NetworkEnvelope::GetDataResponse(GetDataResponse {
            data_set,
            persistable_network_payload_set: vec![],
            request_nonce: nonce,
            is_get_updated_data_response: false,
            was_truncated: false,
            truncated_kinds: vec![],
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_responses_are_ignored_until_timeout() {
        let node = StaticNode::new("me:1", &["seed:1"]);
        let (handler, _) = handler(&node);
        let seed: NodeAddress = "seed:1".parse().unwrap();

        let started = tokio::time::Instant::now();
        let task = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.request_data(&seed, true).await })
        };
        let nonce = sent_nonce(&node).await;

        node.deliver(&response(nonce.wrapping_add(1), vec![]), "seed:1");
        node.deliver(&response(nonce, vec![]), "intruder:1");
        assert_eq!(handler.pending_len(), 1);

        let result = task.await.unwrap();
        assert!(matches!(result, Err(NetworkError::Timeout(_))));
        assert!(started.elapsed() >= TIMEOUT);
        assert_eq!(handler.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_matching_response_is_applied() {
        let node = StaticNode::new("me:1", &["seed:1"]);
        let (handler, storage) = handler(&node);
        let seed: NodeAddress = "seed:1".parse().unwrap();
        let keys = SignatureKeyPair::generate();
        let alert = ProtectedStoragePayload::Alert(Alert {
            message: "upgrade".to_string(),
            version: "1.9.0".to_string(),
            is_update_info: true,
            owner_pub_key: keys.public(),
            extra_data: None,
        });
        let entry = ProtectedStorageEntry::signed(alert.clone(), &keys, 1, NOW);

        let task = {
            let handler = handler.clone();
            tokio::spawn(async move { handler.request_data(&seed, false).await })
        };
        let nonce = sent_nonce(&node).await;
        node.deliver(&response(nonce, vec![entry]), "seed:1");

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.num_entries, 1);
        assert!(!outcome.was_truncated);
        assert!(storage.contains(&alert.hash()));
        assert_eq!(handler.pending_len(), 0);
    }
}
