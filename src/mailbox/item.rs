use crate::mailbox::message::{DecryptedMessageWithPubKey, PrefixedSealedAndSignedMessage};
use crate::storage::entry::ProtectedStorageEntry;
use crate::storage::payload::{MailboxStoragePayload, ProtectedStoragePayload};
use serde::{Deserialize, Serialize};

/// A mailbox entry we hold, opened if it was addressed to us.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxItem {
    pub protected_mailbox_storage_entry: ProtectedStorageEntry,
    pub decrypted_message_with_pub_key: Option<DecryptedMessageWithPubKey>,
}

impl MailboxItem {
    pub fn new(
        protected_mailbox_storage_entry: ProtectedStorageEntry,
        decrypted_message_with_pub_key: Option<DecryptedMessageWithPubKey>,
    ) -> Self {
        Self {
            protected_mailbox_storage_entry,
            decrypted_message_with_pub_key,
        }
    }

    pub fn uid(&self) -> &str {
        match &self.decrypted_message_with_pub_key {
            Some(decrypted) => &decrypted.message.uid,
            None => mailbox_payload(&self.protected_mailbox_storage_entry)
                .map(|p| p.prefixed_sealed_and_signed_message.uid.as_str())
                .unwrap_or_default(),
        }
    }

    pub fn is_mine(&self) -> bool {
        self.decrypted_message_with_pub_key.is_some()
    }

    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.protected_mailbox_storage_entry.is_expired(now_millis)
    }

    pub fn creation_timestamp(&self) -> i64 {
        self.protected_mailbox_storage_entry.creation_timestamp()
    }

    pub fn serialized_size(&self) -> usize {
        self.protected_mailbox_storage_entry.serialized_size()
    }
}

pub fn mailbox_payload(entry: &ProtectedStorageEntry) -> Option<&MailboxStoragePayload> {
    match entry.payload() {
        ProtectedStoragePayload::Mailbox(payload) if entry.is_mailbox() => Some(payload),
        _ => None,
    }
}

pub fn prefixed_message(entry: &ProtectedStorageEntry) -> Option<&PrefixedSealedAndSignedMessage> {
    mailbox_payload(entry).map(|p| &p.prefixed_sealed_and_signed_message)
}
