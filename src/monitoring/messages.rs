use crate::monitoring::state_hash::StateHash;
use crate::network::capabilities::Capability;
use serde::{Deserialize, Serialize};

/// Which chain of state hashes a message belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MonitorKind {
    Dao,
    Proposal,
    BlindVote,
}

impl MonitorKind {
    pub fn name(&self) -> &'static str {
        match self {
            MonitorKind::Dao => "DaoState",
            MonitorKind::Proposal => "ProposalState",
            MonitorKind::BlindVote => "BlindVoteState",
        }
    }

    pub fn request_message_type(&self) -> &'static str {
        match self {
            MonitorKind::Dao => "GetDaoStateHashesRequest",
            MonitorKind::Proposal => "GetProposalStateHashesRequest",
            MonitorKind::BlindVote => "GetBlindVoteStateHashesRequest",
        }
    }

    pub fn response_message_type(&self) -> &'static str {
        match self {
            MonitorKind::Dao => "GetDaoStateHashesResponse",
            MonitorKind::Proposal => "GetProposalStateHashesResponse",
            MonitorKind::BlindVote => "GetBlindVoteStateHashesResponse",
        }
    }

    pub fn new_hash_message_type(&self) -> &'static str {
        match self {
            MonitorKind::Dao => "NewDaoStateHashMessage",
            MonitorKind::Proposal => "NewProposalStateHashMessage",
            MonitorKind::BlindVote => "NewBlindVoteStateHashMessage",
        }
    }

    pub fn capability(&self) -> Capability {
        match self {
            MonitorKind::Dao => Capability::DaoState,
            MonitorKind::Proposal => Capability::Proposal,
            MonitorKind::BlindVote => Capability::BlindVote,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GetStateHashesRequest {
    pub kind: MonitorKind,
    pub height: u32,
    pub nonce: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GetStateHashesResponse {
    pub kind: MonitorKind,
    pub state_hashes: Vec<StateHash>,
    pub request_nonce: u32,
}

/// Gossiped as soon as a node has computed the hash for a new height.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NewStateHashMessage {
    pub kind: MonitorKind,
    pub state_hash: StateHash,
}
