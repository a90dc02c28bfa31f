use crate::getdata::messages::{GetDataResponse, GetUpdatedDataRequest, PreliminaryGetDataRequest};
use crate::mailbox::message::PrefixedSealedAndSignedMessage;
use crate::monitoring::messages::{GetStateHashesRequest, GetStateHashesResponse, NewStateHashMessage};
use crate::network::capabilities::Capabilities;
use crate::network::node_address::NodeAddress;
use crate::storage::entry::ProtectedStorageEntry;
use crate::storage::payload::PersistableNetworkPayload;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum NetworkEnvelope {
    // First frame on every connection, in both directions
    Hello(Hello),
    Ping(Ping),
    Pong(Pong),
    Broadcast(BroadcastMessage),
    BundleOfEnvelopes(BundleOfEnvelopes),
    // Bulk sync
    PreliminaryGetDataRequest(PreliminaryGetDataRequest),
    GetUpdatedDataRequest(GetUpdatedDataRequest),
    GetDataResponse(GetDataResponse),
    // State hash monitoring
    GetStateHashesRequest(GetStateHashesRequest),
    GetStateHashesResponse(GetStateHashesResponse),
    // Direct delivery of a sealed message
    PrefixedSealedAndSigned(PrefixedSealedAndSignedMessage),
}

impl NetworkEnvelope {
    pub fn message_type(&self) -> &'static str {
        match self {
            NetworkEnvelope::Hello(_) => "Hello",
            NetworkEnvelope::Ping(_) => "Ping",
            NetworkEnvelope::Pong(_) => "Pong",
            NetworkEnvelope::Broadcast(m) => m.message_type(),
            NetworkEnvelope::BundleOfEnvelopes(_) => "BundleOfEnvelopes",
            NetworkEnvelope::PreliminaryGetDataRequest(_) => "PreliminaryGetDataRequest",
            NetworkEnvelope::GetUpdatedDataRequest(_) => "GetUpdatedDataRequest",
            NetworkEnvelope::GetDataResponse(_) => "GetDataResponse",
            NetworkEnvelope::GetStateHashesRequest(r) => r.kind.request_message_type(),
            NetworkEnvelope::GetStateHashesResponse(r) => r.kind.response_message_type(),
            NetworkEnvelope::PrefixedSealedAndSigned(_) => "PrefixedSealedAndSignedMessage",
        }
    }

    /// Capabilities a peer must advertise before we send it this envelope.
    pub fn required_capabilities(&self) -> Option<Capabilities> {
        match self {
            NetworkEnvelope::Broadcast(m) => m.required_capabilities(),
            _ => None,
        }
    }

    pub fn serialized_size(&self) -> usize {
        bincode::serialized_size(self).map(|s| s as usize).unwrap_or(0)
    }
}

/// Messages that are gossiped through the broadcaster.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum BroadcastMessage {
    AddData(AddDataMessage),
    RemoveData(RemoveDataMessage),
    RemoveMailboxData(RemoveMailboxDataMessage),
    RefreshOffer(RefreshOfferMessage),
    AddPersistableNetworkPayload(AddPersistableNetworkPayloadMessage),
    NewStateHash(NewStateHashMessage),
}

impl BroadcastMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            BroadcastMessage::AddData(_) => "AddDataMessage",
            BroadcastMessage::RemoveData(_) => "RemoveDataMessage",
            BroadcastMessage::RemoveMailboxData(_) => "RemoveMailboxDataMessage",
            BroadcastMessage::RefreshOffer(_) => "RefreshOfferMessage",
            BroadcastMessage::AddPersistableNetworkPayload(_) => "AddPersistableNetworkPayloadMessage",
            BroadcastMessage::NewStateHash(m) => m.kind.new_hash_message_type(),
        }
    }

    pub fn required_capabilities(&self) -> Option<Capabilities> {
        match self {
            BroadcastMessage::AddData(m) => m.protected_storage_entry.payload().required_capabilities(),
            BroadcastMessage::AddPersistableNetworkPayload(m) => m.payload.required_capabilities(),
            BroadcastMessage::NewStateHash(m) => Some(Capabilities::single(m.kind.capability())),
            _ => None,
        }
    }
}

impl From<BroadcastMessage> for NetworkEnvelope {
    fn from(message: BroadcastMessage) -> Self {
        NetworkEnvelope::Broadcast(message)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub magic: [u8; 4],
    pub node_address: NodeAddress,
    pub capabilities: Capabilities,
    pub version: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub nonce: u32,
    pub last_round_trip_time_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    pub request_nonce: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BundleOfEnvelopes {
    pub envelopes: Vec<NetworkEnvelope>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AddDataMessage {
    pub protected_storage_entry: ProtectedStorageEntry,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoveDataMessage {
    pub protected_storage_entry: ProtectedStorageEntry,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoveMailboxDataMessage {
    pub protected_mailbox_storage_entry: ProtectedStorageEntry,
}

/// Keeps a stored entry alive without resending its payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RefreshOfferMessage {
    pub hash_of_data_and_seq_nr: [u8; 32],
    pub signature: Vec<u8>,
    pub hash_of_payload: Vec<u8>,
    pub sequence_number: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AddPersistableNetworkPayloadMessage {
    pub payload: PersistableNetworkPayload,
}
