use crate::network::capabilities::Capabilities;
use crate::network::node_address::NodeAddress;
use crate::storage::byte_array::StorageByteArray;
use crate::storage::entry::ProtectedStorageEntry;
use crate::storage::payload::PersistableNetworkPayload;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// First request of a fresh node, sent before it has a reachable address.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PreliminaryGetDataRequest {
    pub nonce: u32,
    pub excluded_keys: Vec<Vec<u8>>,
    pub supported_capabilities: Capabilities,
    pub version: String,
}

/// Delta request once the node is reachable.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GetUpdatedDataRequest {
    pub sender_node_address: NodeAddress,
    pub nonce: u32,
    pub excluded_keys: Vec<Vec<u8>>,
    pub version: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GetDataResponse {
    pub data_set: Vec<ProtectedStorageEntry>,
    pub persistable_network_payload_set: Vec<PersistableNetworkPayload>,
    pub request_nonce: u32,
    pub is_get_updated_data_response: bool,
    pub was_truncated: bool,
    pub truncated_kinds: Vec<String>,
}

/// Either request kind, as seen by the responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetDataRequest {
    Preliminary(PreliminaryGetDataRequest),
    Updated(GetUpdatedDataRequest),
}

impl GetDataRequest {
    pub fn nonce(&self) -> u32 {
        match self {
            GetDataRequest::Preliminary(r) => r.nonce,
            GetDataRequest::Updated(r) => r.nonce,
        }
    }

    pub fn version(&self) -> &str {
        match self {
            GetDataRequest::Preliminary(r) => &r.version,
            GetDataRequest::Updated(r) => &r.version,
        }
    }

    pub fn is_updated(&self) -> bool {
        matches!(self, GetDataRequest::Updated(_))
    }

    pub fn excluded_keys(&self) -> HashSet<StorageByteArray> {
        let keys = match self {
            GetDataRequest::Preliminary(r) => &r.excluded_keys,
            GetDataRequest::Updated(r) => &r.excluded_keys,
        };
        keys.iter().cloned().map(StorageByteArray::new).collect()
    }
}
