use crate::crypto::sealed::SealedAndSigned;
use crate::crypto::PubKeyBytes;
use crate::network::node_address::NodeAddress;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_MAILBOX_TTL: Duration = Duration::from_secs(15 * 24 * 60 * 60);

/// Application message delivered directly or through the mailbox.
///
/// `body` is opaque to this layer; `message_type` lets domain listeners pick
/// the messages they understand.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxMessage {
    pub uid: String,
    pub sender_node_address: NodeAddress,
    pub message_type: String,
    pub body: Vec<u8>,
    pub ttl_ms: i64,
}

impl MailboxMessage {
    pub fn new(
        sender_node_address: NodeAddress,
        message_type: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            uid: new_uid(),
            sender_node_address,
            message_type: message_type.into(),
            body,
            ttl_ms: DEFAULT_MAILBOX_TTL.as_millis() as i64,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms.max(0) as u64)
    }
}

/// Random hex identifier for messages and requests.
pub fn new_uid() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Sealed envelope as it travels, either directly or inside a mailbox
/// storage payload. Only the receiver can open `sealed_and_signed`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrefixedSealedAndSignedMessage {
    pub sender_node_address: NodeAddress,
    pub sealed_and_signed: SealedAndSigned,
    pub uid: String,
}

/// Result of opening a sealed envelope addressed to us.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptedMessageWithPubKey {
    pub message: MailboxMessage,
    pub signature_pub_key: PubKeyBytes,
}
