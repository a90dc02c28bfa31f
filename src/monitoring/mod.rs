//! Detects when our locally computed DAO, proposal or blind vote state has
//! drifted from the rest of the network.

pub mod checkpoint;
pub mod messages;
pub mod monitor;
pub mod network_service;
pub mod state_hash;

pub use checkpoint::Checkpoint;
pub use messages::MonitorKind;
pub use monitor::{StateMonitorListener, StateMonitoringService};
pub use network_service::{StateNetworkListener, StateNetworkService};
pub use state_hash::{StateBlock, StateHash};
