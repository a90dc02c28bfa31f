//! otcnode: replicated P2P storage for an over-the-counter trading network.
//!
//! Signed entries are gossiped to every node, new nodes pull a bulk snapshot
//! from a seed node, encrypted mailbox messages wait in the network for
//! offline peers, and state hash chains expose nodes whose DAO view drifted.

pub mod account;
pub mod app_context;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod getdata;
pub mod listeners;
pub mod mailbox;
pub mod monitoring;
pub mod network;
pub mod network_type;
pub mod p2p_service;
pub mod seed_nodes;
pub mod shutdown;
pub mod storage;

#[cfg(test)]
mod test_support;
