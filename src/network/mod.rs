pub mod capabilities;
pub mod connection;
pub mod keep_alive;
pub mod message;
pub mod node;
pub mod node_address;
pub mod tcp;
pub mod wire;

pub use capabilities::{Capabilities, Capability};
pub use connection::{CloseConnectionReason, Connection};
pub use message::{BroadcastMessage, NetworkEnvelope};
pub use node::{ConnectionListener, MessageListener, NetworkNode};
pub use node_address::NodeAddress;
