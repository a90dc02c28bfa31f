//! Feature flags a peer advertises during the handshake.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    SeedNode,
    TradeStatistics,
    AccountAgeWitness,
    SignedAccountAgeWitness,
    Mediation,
    RefundAgent,
    BundleOfEnvelopes,
    DaoState,
    Proposal,
    BlindVote,
}

impl Capability {
    pub const ALL: [Capability; 10] = [
        Capability::SeedNode,
        Capability::TradeStatistics,
        Capability::AccountAgeWitness,
        Capability::SignedAccountAgeWitness,
        Capability::Mediation,
        Capability::RefundAgent,
        Capability::BundleOfEnvelopes,
        Capability::DaoState,
        Capability::Proposal,
        Capability::BlindVote,
    ];
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities(BTreeSet<Capability>);

impl Capabilities {
    pub fn new(capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self(capabilities.into_iter().collect())
    }

    pub fn single(capability: Capability) -> Self {
        Self::new([capability])
    }

    /// Everything a regular (non-seed) node of this release supports.
    pub fn app_defaults() -> Self {
        Self::new(
            Capability::ALL
                .into_iter()
                .filter(|c| *c != Capability::SeedNode),
        )
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn contains_all(&self, required: &Capabilities) -> bool {
        required.0.is_subset(&self.0)
    }

    pub fn insert(&mut self, capability: Capability) {
        self.0.insert(capability);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.0.iter().map(|c| format!("{:?}", c)).collect();
        write!(f, "[{}]", names.join(", "))
    }
}
