//! Rolling hash chain over per-height state.

use crate::crypto::{hash, Hash256};
use crate::network::node_address::NodeAddress;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StateHash {
    pub height: u32,
    pub hash: Hash256,
    /// Proposal and blind vote hashes carry the number of items they cover.
    pub num_items: Option<u32>,
}

impl StateHash {
    pub fn short_hash(&self) -> String {
        hex::encode(&self.hash[..8])
    }
}

/// `sha256(prev_hash ‖ state)`. The first block hashes the state alone.
pub fn chain_hash(prev_hash: Option<&Hash256>, state: &[u8]) -> Hash256 {
    let mut combined = Vec::with_capacity(32 + state.len());
    if let Some(prev) = prev_hash {
        combined.extend_from_slice(prev);
    }
    combined.extend_from_slice(state);
    hash(&combined)
}

/// Builds a whole chain from per-height state, lowest height first.
pub fn build_chain<'a>(states: impl IntoIterator<Item = (u32, &'a [u8])>) -> Vec<StateHash> {
    let mut chain: Vec<StateHash> = Vec::new();
    for (height, state) in states {
        let hash = chain_hash(chain.last().map(|h| &h.hash), state);
        chain.push(StateHash {
            height,
            hash,
            num_items: None,
        });
    }
    chain
}

/// Our hash at one height next to what peers reported for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateBlock {
    pub my_state_hash: StateHash,
    pub peers_map: BTreeMap<String, StateHash>,
    pub in_conflict_map: BTreeMap<String, StateHash>,
}

impl StateBlock {
    pub fn new(my_state_hash: StateHash) -> Self {
        Self {
            my_state_hash,
            peers_map: BTreeMap::new(),
            in_conflict_map: BTreeMap::new(),
        }
    }

    pub fn height(&self) -> u32 {
        self.my_state_hash.height
    }

    pub fn hash(&self) -> &Hash256 {
        &self.my_state_hash.hash
    }

    /// Records a peer's hash. Returns true if anything changed.
    pub fn put_peer_hash(&mut self, peer: &str, state_hash: StateHash) -> bool {
        let mut changed = self.peers_map.get(peer) != Some(&state_hash);
        if state_hash.hash != self.my_state_hash.hash {
            changed |= self.in_conflict_map.get(peer) != Some(&state_hash);
            self.in_conflict_map.insert(peer.to_string(), state_hash.clone());
        } else {
            changed |= self.in_conflict_map.remove(peer).is_some();
        }
        self.peers_map.insert(peer.to_string(), state_hash);
        changed
    }

    pub fn is_in_conflict_with(&self, peer: &NodeAddress) -> bool {
        self.in_conflict_map.contains_key(&peer.full_address())
    }
}
