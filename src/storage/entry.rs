use crate::crypto::{canonical_bytes, hash, verify, PubKeyBytes, SignatureKeyPair};
use crate::storage::byte_array::StorageByteArray;
use crate::storage::payload::{OwnershipMode, ProtectedStoragePayload};
use serde::{Deserialize, Serialize};

/// What an entry signature covers. The wrapper fields (timestamp, receiver)
/// are deliberately outside the signed data.
#[derive(Serialize)]
struct DataAndSeqNrPair<'a> {
    payload: &'a ProtectedStoragePayload,
    sequence_number: u32,
}

pub fn data_and_seq_nr_hash(payload: &ProtectedStoragePayload, sequence_number: u32) -> [u8; 32] {
    hash(&canonical_bytes(&DataAndSeqNrPair {
        payload,
        sequence_number,
    }))
}

/// Owner-signed, sequence-numbered record of the replicated map.
///
/// Mailbox entries additionally carry the receiver's key; for them the
/// signing owner is the sender on add and the receiver on remove.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedStorageEntry {
    payload: ProtectedStoragePayload,
    owner_pub_key: PubKeyBytes,
    sequence_number: u32,
    signature: Vec<u8>,
    creation_timestamp: i64,
    receivers_pub_key: Option<PubKeyBytes>,
}

impl ProtectedStorageEntry {
    pub fn new(
        payload: ProtectedStoragePayload,
        owner_pub_key: PubKeyBytes,
        sequence_number: u32,
        signature: Vec<u8>,
        creation_timestamp: i64,
    ) -> Self {
        Self {
            payload,
            owner_pub_key,
            sequence_number,
            signature,
            creation_timestamp,
            receivers_pub_key: None,
        }
    }

    pub fn new_mailbox(
        payload: ProtectedStoragePayload,
        owner_pub_key: PubKeyBytes,
        sequence_number: u32,
        signature: Vec<u8>,
        receivers_pub_key: PubKeyBytes,
        creation_timestamp: i64,
    ) -> Self {
        Self {
            payload,
            owner_pub_key,
            sequence_number,
            signature,
            creation_timestamp,
            receivers_pub_key: Some(receivers_pub_key),
        }
    }

    /// Builds and signs an entry with `keys` as owner.
    pub fn signed(
        payload: ProtectedStoragePayload,
        keys: &SignatureKeyPair,
        sequence_number: u32,
        creation_timestamp: i64,
    ) -> Self {
        let signature = keys.sign(&data_and_seq_nr_hash(&payload, sequence_number));
        Self::new(payload, keys.public(), sequence_number, signature, creation_timestamp)
    }

    pub fn signed_mailbox(
        payload: ProtectedStoragePayload,
        keys: &SignatureKeyPair,
        sequence_number: u32,
        receivers_pub_key: PubKeyBytes,
        creation_timestamp: i64,
    ) -> Self {
        let signature = keys.sign(&data_and_seq_nr_hash(&payload, sequence_number));
        Self::new_mailbox(
            payload,
            keys.public(),
            sequence_number,
            signature,
            receivers_pub_key,
            creation_timestamp,
        )
    }

    pub fn payload(&self) -> &ProtectedStoragePayload {
        &self.payload
    }

    pub fn owner_pub_key(&self) -> &PubKeyBytes {
        &self.owner_pub_key
    }

    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn creation_timestamp(&self) -> i64 {
        self.creation_timestamp
    }

    pub fn receivers_pub_key(&self) -> Option<&PubKeyBytes> {
        self.receivers_pub_key.as_ref()
    }

    pub fn is_mailbox(&self) -> bool {
        self.receivers_pub_key.is_some()
    }

    pub fn hash_of_payload(&self) -> StorageByteArray {
        self.payload.hash()
    }

    /// A peer's clock may run ahead of ours; never keep a future timestamp.
    /// Timestamps before the epoch are not signed over and become zero.
    pub fn clamp_creation_timestamp(&mut self, now_millis: i64) {
        self.creation_timestamp = self.creation_timestamp.min(now_millis).max(0);
    }

    pub fn is_expired(&self, now_millis: i64) -> bool {
        match self.payload.ttl() {
            Some(ttl) => now_millis.saturating_sub(self.creation_timestamp) > ttl.as_millis() as i64,
            None => false,
        }
    }

    /// Pulls the creation time back by half the TTL.
    pub fn back_date(&mut self) {
        if let Some(ttl) = self.payload.ttl() {
            self.creation_timestamp = self.creation_timestamp.saturating_sub((ttl.as_millis() / 2) as i64);
        }
    }

    pub fn is_signature_valid(&self) -> bool {
        verify(
            &self.owner_pub_key,
            &data_and_seq_nr_hash(&self.payload, self.sequence_number),
            &self.signature,
        )
    }

    pub fn is_valid_for_add_operation(&self) -> bool {
        if !self.is_signature_valid() {
            return false;
        }
        match (self.payload.ownership_mode(), &self.payload, self.receivers_pub_key) {
            (OwnershipMode::OwnerKey, _, None) => self.owner_pub_key == *self.payload.owner_pub_key(),
            (OwnershipMode::SenderKey, ProtectedStoragePayload::Mailbox(mailbox), Some(receivers)) => {
                self.owner_pub_key == mailbox.sender_pub_key_for_add_operation
                    && mailbox.owner_pub_key == receivers
            }
            _ => false,
        }
    }

    /// Removal is always signed by the payload owner; for mailbox entries
    /// that is the receiver.
    pub fn is_valid_for_remove_operation(&self) -> bool {
        if !self.is_signature_valid() {
            return false;
        }
        let owner_matches = self.owner_pub_key == *self.payload.owner_pub_key();
        match (self.payload.ownership_mode(), self.receivers_pub_key) {
            (OwnershipMode::OwnerKey, None) => owner_matches,
            (OwnershipMode::SenderKey, Some(receivers)) => {
                owner_matches && receivers == *self.payload.owner_pub_key()
            }
            _ => false,
        }
    }

    /// Whether this entry may replace `stored`. Mailbox entries compare the
    /// receiver since sender and receiver legitimately sign different ops.
    pub fn matches_relevant_pub_key(&self, stored: &ProtectedStorageEntry) -> bool {
        match (self.receivers_pub_key, stored.receivers_pub_key) {
            (Some(mine), Some(theirs)) => mine == theirs,
            (None, None) => self.owner_pub_key == stored.owner_pub_key,
            _ => false,
        }
    }

    pub fn serialized_size(&self) -> usize {
        bincode::serialized_size(self).map(|s| s as usize).unwrap_or(0)
    }
}
