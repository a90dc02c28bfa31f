//! Signed account-age witnesses.
//!
//! A witness signed by an arbitrator is trusted as is. A witness signed by
//! a peer is only trusted when the signer itself holds a trusted witness
//! that is at least [`SIGNER_AGE`] older, which makes trust a chain back to
//! some arbitrator.

use crate::clock::SharedClock;
use crate::crypto::{verify, PubKeyBytes, SignatureKeyPair};
use crate::network::node_address::NodeAddress;
use crate::storage::payload::{AccountAgeWitness, PersistableKind, SignedWitness, VerificationMethod};
use crate::storage::{AppendOnlyDataStoreListener, P2PDataStorage, PersistableNetworkPayload};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

pub const SIGNER_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);
/// Bound on signer keys visited while validating one chain.
pub const MAX_VISITED_SIGNERS: usize = 2_000;

#[derive(Default)]
struct WitnessGraph {
    by_witness_hash: HashMap<Vec<u8>, Vec<SignedWitness>>,
    by_owner: HashMap<PubKeyBytes, Vec<SignedWitness>>,
}

impl WitnessGraph {
    fn insert(&mut self, witness: SignedWitness) -> bool {
        let existing = self
            .by_witness_hash
            .entry(witness.account_age_witness_hash.clone())
            .or_default();
        if existing.contains(&witness) {
            return false;
        }
        existing.push(witness.clone());
        self.by_owner
            .entry(witness.witness_owner_pub_key)
            .or_default()
            .push(witness);
        true
    }
}

pub struct SignedWitnessService {
    graph: RwLock<WitnessGraph>,
    banned_signers: HashSet<PubKeyBytes>,
    clock: SharedClock,
}

impl SignedWitnessService {
    /// Indexes what the store already holds and follows new arrivals.
    pub fn new(storage: &P2PDataStorage, banned_signers: HashSet<PubKeyBytes>, clock: SharedClock) -> Arc<Self> {
        let service = Arc::new(Self {
            graph: RwLock::new(WitnessGraph::default()),
            banned_signers,
            clock,
        });
        if let Some(store) = storage.append_only_store().store(PersistableKind::SignedWitness) {
            let mut graph = service.graph.write();
            for payload in store.map().into_values() {
                if let PersistableNetworkPayload::SignedWitness(witness) = payload {
                    graph.insert(witness);
                }
            }
        }
        storage.add_append_only_data_store_listener(service.clone());
        service
    }

    pub fn len(&self) -> usize {
        self.graph.read().by_witness_hash.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_to_map(&self, witness: SignedWitness) -> bool {
        self.graph.write().insert(witness)
    }

    pub fn signed_witnesses_for(&self, account_age_witness_hash: &[u8]) -> Vec<SignedWitness> {
        self.graph
            .read()
            .by_witness_hash
            .get(account_age_witness_hash)
            .cloned()
            .unwrap_or_default()
    }

    /// Signs `witness` for its owner. The result still has to be published.
    pub fn sign_account_age_witness(
        &self,
        witness: &AccountAgeWitness,
        signer: &SignatureKeyPair,
        witness_owner_pub_key: PubKeyBytes,
        verification_method: VerificationMethod,
        trade_amount: i64,
    ) -> SignedWitness {
        SignedWitness {
            verification_method,
            account_age_witness_hash: witness.hash.clone(),
            signature: signer.sign(&witness.hash),
            signer_pub_key: signer.public(),
            witness_owner_pub_key,
            date: self.clock.millis(),
            trade_amount,
        }
    }

    /// Adds a witness locally and gossips it.
    pub fn publish_signed_witness(&self, witness: SignedWitness, own_address: Option<&NodeAddress>, storage: &P2PDataStorage) -> bool {
        self.add_to_map(witness.clone());
        storage.add_persistable_network_payload(
            PersistableNetworkPayload::SignedWitness(witness),
            own_address,
            true,
            false,
            false,
        )
    }

    fn verify_signature(&self, witness: &SignedWitness) -> bool {
        !self.banned_signers.contains(&witness.signer_pub_key)
            && verify(
                &witness.signer_pub_key,
                &witness.account_age_witness_hash,
                &witness.signature,
            )
    }

    /// The signer's witness must predate the child by the full signer age.
    fn is_old_enough_to_sign(signer_witness: &SignedWitness, child_date: i64) -> bool {
        signer_witness.date < child_date.saturating_sub(SIGNER_AGE.as_millis() as i64)
    }

    pub fn is_valid_account_age_witness(&self, witness: &AccountAgeWitness) -> bool {
        self.signed_witnesses_for(&witness.hash)
            .iter()
            .any(|w| self.is_valid_signed_witness(w))
    }

    /// Walks signer chains depth first until one ends at an arbitrator.
    pub fn is_valid_signed_witness(&self, witness: &SignedWitness) -> bool {
        let graph = self.graph.read();
        let mut visited: HashSet<PubKeyBytes> = HashSet::new();
        let mut stack: Vec<SignedWitness> = vec![witness.clone()];

        while let Some(current) = stack.pop() {
            if !self.verify_signature(&current) {
                continue;
            }
            if current.verification_method == VerificationMethod::Arbitrator {
                return true;
            }
            if !visited.insert(current.signer_pub_key) {
                continue;
            }
            if visited.len() > MAX_VISITED_SIGNERS {
                tracing::warn!(
                    "⚠️ Gave up on signer chain of {} after {} signers",
                    hex::encode(&witness.account_age_witness_hash),
                    MAX_VISITED_SIGNERS
                );
                return false;
            }
            if let Some(signer_witnesses) = graph.by_owner.get(&current.signer_pub_key) {
                stack.extend(
                    signer_witnesses
                        .iter()
                        .filter(|w| Self::is_old_enough_to_sign(w, current.date))
                        .cloned(),
                );
            }
        }
        false
    }

    /// Human-readable signing state. A missing witness is a normal state,
    /// not an error.
    pub fn signing_state_description(&self, account_age_witness_hash: &[u8]) -> String {
        let witnesses = self.signed_witnesses_for(account_age_witness_hash);
        if witnesses.is_empty() {
            return format!(
                "No signed witness found for account age witness {}",
                hex::encode(account_age_witness_hash)
            );
        }
        let valid: Vec<&SignedWitness> = witnesses
            .iter()
            .filter(|w| self.is_valid_signed_witness(w))
            .collect();
        if valid
            .iter()
            .any(|w| w.verification_method == VerificationMethod::Arbitrator)
        {
            "Signed by arbitrator".to_string()
        } else if !valid.is_empty() {
            "Signed by peer".to_string()
        } else {
            format!("{} signed witnesses found, none with a valid signer chain", witnesses.len())
        }
    }
}

impl AppendOnlyDataStoreListener for SignedWitnessService {
    fn on_added(&self, payload: &PersistableNetworkPayload) {
        if let PersistableNetworkPayload::SignedWitness(witness) = payload {
            if self.add_to_map(witness.clone()) {
                tracing::debug!(
                    "Signed witness for {} by {:?}",
                    hex::encode(&witness.account_age_witness_hash),
                    witness.verification_method
                );
            }
        }
    }
}
