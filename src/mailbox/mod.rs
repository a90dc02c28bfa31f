//! Encrypted messages for peers that may be offline.

pub mod ignored;
pub mod item;
pub mod message;
pub mod service;

use crate::network::node_address::NodeAddress;
use message::DecryptedMessageWithPubKey;

pub use item::MailboxItem;
pub use message::{MailboxMessage, PrefixedSealedAndSignedMessage};
pub use service::MailboxMessageService;

pub trait DecryptedMailboxListener: Send + Sync {
    fn on_mailbox_message_added(&self, decrypted: &DecryptedMessageWithPubKey, sender: &NodeAddress);
}

pub trait DecryptedDirectMessageListener: Send + Sync {
    fn on_direct_message(&self, decrypted: &DecryptedMessageWithPubKey, sender: &NodeAddress);
}

/// Outcome of a mailbox send. Exactly one of the three is called.
pub trait SendMailboxMessageListener: Send + Sync {
    /// The peer was online and took the message directly.
    fn on_arrived(&self);

    /// The message was parked in the network for the peer.
    fn on_stored_in_mailbox(&self);

    fn on_fault(&self, error_message: &str);
}
