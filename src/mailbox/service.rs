//! Store-and-forward delivery of sealed messages.
//!
//! A message first goes straight to the peer. Only when that fails is it
//! parked in the replicated map under the receiver's storage key, where the
//! receiver picks it up, opens it and cleans it out of the network again.

use crate::broadcast::{BroadcastListener, BroadcastResult};
use crate::clock::SharedClock;
use crate::crypto::sealed::{decrypt_and_verify, encrypt_and_sign, SealedAndSigned};
use crate::crypto::{KeyRing, PubKeyBytes, PubKeyRing};
use crate::error::{CryptoError, MailboxError, StorageError};
use crate::listeners::ListenerList;
use crate::mailbox::ignored::IgnoredMailboxService;
use crate::mailbox::item::{mailbox_payload, prefixed_message, MailboxItem};
use crate::mailbox::message::{DecryptedMessageWithPubKey, MailboxMessage, PrefixedSealedAndSignedMessage};
use crate::mailbox::{
    DecryptedDirectMessageListener, DecryptedMailboxListener, SendMailboxMessageListener,
};
use crate::network::connection::Connection;
use crate::network::message::NetworkEnvelope;
use crate::network::node::{MessageListener, NetworkNode};
use crate::network::node_address::NodeAddress;
use crate::storage::entry::ProtectedStorageEntry;
use crate::storage::payload::{MailboxStoragePayload, ProtectedStoragePayload};
use crate::storage::persistence::{PersistedStore, Persistence, PersistenceRequest};
use crate::storage::{HashMapChangedListener, P2PDataStorage};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const MAX_PERSISTED_ITEMS: usize = 3_000;
/// Larger items are left to be fetched from seed nodes again.
pub const MAX_PERSISTED_ITEM_SIZE: usize = 20_000;
pub const REPUBLISH_CHUNK_SIZE: usize = 50;
pub const REPUBLISH_DELAY: Duration = Duration::from_secs(2 * 60);
pub const REMOVE_DELAY: Duration = Duration::from_secs(1);
pub const REMOVE_RETRY_DELAY: Duration = Duration::from_secs(30);

const SLOT: &str = "mailbox_items";
const NO_PEERS_FAULT: &str =
    "There are no P2P network nodes connected. Please check your internet connection.";

/// Opens a sealed envelope addressed to `key_ring` and decodes the message.
pub fn open_sealed(
    sealed: &SealedAndSigned,
    key_ring: &KeyRing,
) -> Result<DecryptedMessageWithPubKey, CryptoError> {
    let (plaintext, signature_pub_key) = decrypt_and_verify(sealed, key_ring.encryption_key_pair())?;
    let message: MailboxMessage =
        bincode::deserialize(&plaintext).map_err(|e| CryptoError::Serialization(e.to_string()))?;
    Ok(DecryptedMessageWithPubKey {
        message,
        signature_pub_key,
    })
}

/// Seals `message` for the owner of `peers_pub_key_ring`.
pub fn seal_for(
    peers_pub_key_ring: &PubKeyRing,
    message: &MailboxMessage,
    key_ring: &KeyRing,
) -> Result<SealedAndSigned, CryptoError> {
    let plaintext =
        bincode::serialize(message).map_err(|e| CryptoError::Serialization(e.to_string()))?;
    encrypt_and_sign(peers_pub_key_ring, &plaintext, key_ring)
}

struct StoredInMailboxListener {
    listener: Arc<dyn SendMailboxMessageListener>,
}

impl BroadcastListener for StoredInMailboxListener {
    fn on_sufficiently_broadcast(&self, _result: &BroadcastResult) {
        self.listener.on_stored_in_mailbox();
    }

    fn on_not_sufficiently_broadcast(&self, result: &BroadcastResult) {
        self.listener.on_fault(&format!(
            "Message was not sufficiently broadcast. completed={}, failed={}",
            result.num_completed, result.num_failed
        ));
    }
}

pub struct MailboxMessageService {
    me: Weak<MailboxMessageService>,
    network_node: Arc<dyn NetworkNode>,
    storage: Arc<P2PDataStorage>,
    key_ring: KeyRing,
    ignored: IgnoredMailboxService,
    clock: SharedClock,
    persistence: Persistence,
    persistence_request: PersistenceRequest,
    items_by_uid: RwLock<HashMap<String, MailboxItem>>,
    mailbox_listeners: ListenerList<dyn DecryptedMailboxListener>,
    direct_listeners: ListenerList<dyn DecryptedDirectMessageListener>,
    bootstrapped: AtomicBool,
    republish_mailbox_entries: bool,
    shutdown: CancellationToken,
}

impl MailboxMessageService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        network_node: Arc<dyn NetworkNode>,
        storage: Arc<P2PDataStorage>,
        key_ring: KeyRing,
        persistence: Persistence,
        clock: SharedClock,
        republish_mailbox_entries: bool,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let service = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            network_node: network_node.clone(),
            storage,
            key_ring,
            ignored: IgnoredMailboxService::new(persistence.clone(), clock.clone()),
            clock,
            persistence,
            persistence_request: PersistenceRequest::default(),
            items_by_uid: RwLock::new(HashMap::new()),
            mailbox_listeners: ListenerList::new(),
            direct_listeners: ListenerList::new(),
            bootstrapped: AtomicBool::new(false),
            republish_mailbox_entries,
            shutdown,
        });
        service.read_persisted();
        network_node.add_message_listener(service.clone());
        service
    }

    /// Reloads our mailbox items and puts their entries back into the map so
    /// they count as known when we ask seed nodes for data.
    fn read_persisted(&self) {
        let persisted: Vec<MailboxItem> = self.persistence.read_or_default(SLOT);
        let total = persisted.len();
        let now = self.clock.millis();
        let mut items: Vec<MailboxItem> = persisted
            .into_iter()
            .filter(|item| !item.is_expired(now))
            .filter(|item| {
                let size = item.serialized_size();
                if size >= MAX_PERSISTED_ITEM_SIZE {
                    tracing::warn!("⚠️ Skipping persisted mailbox item {} of {} bytes", item.uid(), size);
                    return false;
                }
                true
            })
            .collect();
        items.sort_by_key(MailboxItem::creation_timestamp);
        if items.len() > MAX_PERSISTED_ITEMS {
            items.drain(..items.len() - MAX_PERSISTED_ITEMS);
        }

        let mut by_uid = self.items_by_uid.write();
        for item in items {
            self.storage
                .add_protected_mailbox_storage_entry_to_map(item.protected_mailbox_storage_entry.clone());
            by_uid.insert(item.uid().to_string(), item);
        }
        if by_uid.len() != total {
            self.persistence_request.request();
        }
        if total > 0 {
            tracing::info!("📚 Loaded {} of {} persisted mailbox items", by_uid.len(), total);
        }
    }

    pub fn add_decrypted_mailbox_listener(&self, listener: Arc<dyn DecryptedMailboxListener>) {
        self.mailbox_listeners.add(listener);
    }

    pub fn add_decrypted_direct_message_listener(&self, listener: Arc<dyn DecryptedDirectMessageListener>) {
        self.direct_listeners.add(listener);
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::SeqCst)
    }

    pub fn key_ring(&self) -> &KeyRing {
        &self.key_ring
    }

    pub fn ignored(&self) -> &IgnoredMailboxService {
        &self.ignored
    }

    pub fn mailbox_item(&self, uid: &str) -> Option<MailboxItem> {
        self.items_by_uid.read().get(uid).cloned()
    }

    pub fn mailbox_items_len(&self) -> usize {
        self.items_by_uid.read().len()
    }

    /// Starts listening to the map once the initial data has arrived and
    /// processes everything it already holds.
    pub fn on_bootstrapped(&self) {
        if self.bootstrapped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(me) = self.me.upgrade() {
            self.storage.add_hash_map_changed_listener(me);
        }
        let entries: Vec<ProtectedStorageEntry> = self.storage.map().into_values().collect();
        self.on_added(&entries);
        self.maybe_republish_mailbox_messages();
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Sends directly if the peer is reachable, otherwise parks the message
    /// in the network. The outcome is reported through `listener`.
    pub async fn send_encrypted_mailbox_message(
        &self,
        peer: &NodeAddress,
        peers_pub_key_ring: &PubKeyRing,
        message: MailboxMessage,
        listener: Arc<dyn SendMailboxMessageListener>,
    ) -> Result<(), MailboxError> {
        if *peers_pub_key_ring == self.key_ring.pub_key_ring() {
            return Err(MailboxError::SendToSelf);
        }
        if !self.is_bootstrapped() {
            return Err(MailboxError::NetworkNotReady);
        }
        let own_address = self.network_node.node_address().ok_or(MailboxError::NetworkNotReady)?;
        if self.network_node.confirmed_connections().is_empty() {
            listener.on_fault(NO_PEERS_FAULT);
            return Ok(());
        }

        let sealed_and_signed = seal_for(peers_pub_key_ring, &message, &self.key_ring)?;
        let prefixed = PrefixedSealedAndSignedMessage {
            sender_node_address: own_address,
            sealed_and_signed,
            uid: message.uid.clone(),
        };
        match self
            .network_node
            .send_message_to(peer, NetworkEnvelope::PrefixedSealedAndSigned(prefixed.clone()))
            .await
        {
            Ok(_) => {
                tracing::info!("📤 Mailbox message {} arrived at {}", message.uid, peer);
                listener.on_arrived();
            }
            Err(e) => {
                tracing::info!(
                    "📪 {} not reachable ({}), storing message {} in the mailbox",
                    peer,
                    e,
                    message.uid
                );
                let receivers_pub_key = peers_pub_key_ring.signature_pub_key;
                let payload = MailboxStoragePayload::new(
                    prefixed,
                    self.key_ring.signature_key_pair().public(),
                    receivers_pub_key,
                    message.ttl(),
                );
                self.add_mailbox_data(payload, receivers_pub_key, listener)?;
            }
        }
        Ok(())
    }

    fn add_mailbox_data(
        &self,
        payload: MailboxStoragePayload,
        receivers_pub_key: PubKeyBytes,
        listener: Arc<dyn SendMailboxMessageListener>,
    ) -> Result<(), MailboxError> {
        if !self.is_bootstrapped() {
            return Err(MailboxError::NetworkNotReady);
        }
        if self.network_node.confirmed_connections().is_empty() {
            listener.on_fault(NO_PEERS_FAULT);
            return Ok(());
        }
        let entry = self.storage.get_mailbox_data_with_signed_seq_nr(
            ProtectedStoragePayload::Mailbox(payload),
            self.key_ring.signature_key_pair(),
            receivers_pub_key,
        );
        let own_address = self.network_node.node_address();
        let broadcast_listener = Arc::new(StoredInMailboxListener {
            listener: listener.clone(),
        });
        if !self
            .storage
            .add_protected_storage_entry(entry, own_address.as_ref(), Some(broadcast_listener), true)
        {
            // Only a concurrent add of the very same entry gets here.
            tracing::error!("❌ Adding a fresh mailbox entry to the local map failed");
            listener.on_fault("Data already exists in our local database");
        }
        Ok(())
    }

    /// Sends a sealed message straight to `peer`, without mailbox fallback.
    pub async fn send_encrypted_direct_message(
        &self,
        peer: &NodeAddress,
        peers_pub_key_ring: &PubKeyRing,
        message: MailboxMessage,
    ) -> Result<(), MailboxError> {
        let own_address = self.network_node.node_address().ok_or(MailboxError::NetworkNotReady)?;
        let sealed_and_signed = seal_for(peers_pub_key_ring, &message, &self.key_ring)?;
        let envelope = NetworkEnvelope::PrefixedSealedAndSigned(PrefixedSealedAndSignedMessage {
            sender_node_address: own_address,
            sealed_and_signed,
            uid: message.uid,
        });
        self.network_node.send_message_to(peer, envelope).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Receiving
    // -----------------------------------------------------------------------

    fn try_decrypt(&self, entry: ProtectedStorageEntry) -> Option<MailboxItem> {
        let prefixed = prefixed_message(&entry)?;
        let uid = prefixed.uid.clone();
        if self.ignored.is_ignored(&uid) {
            return Some(MailboxItem::new(entry, None));
        }
        match open_sealed(&prefixed.sealed_and_signed, &self.key_ring) {
            Ok(decrypted) => Some(MailboxItem::new(entry, Some(decrypted))),
            Err(CryptoError::Serialization(e)) => {
                tracing::error!("❌ Mailbox message {} opened but did not decode: {}", uid, e);
                Some(MailboxItem::new(entry, None))
            }
            Err(_) => {
                // Not for us; never try this one again.
                self.ignored.ignore(&uid, entry.creation_timestamp());
                Some(MailboxItem::new(entry, None))
            }
        }
    }

    fn process_batch(&self, entries: Vec<ProtectedStorageEntry>) {
        let (Some(me), Ok(runtime)) = (self.me.upgrade(), tokio::runtime::Handle::try_current()) else {
            for item in entries.into_iter().filter_map(|e| self.try_decrypt(e)) {
                self.handle_mailbox_item(item);
            }
            return;
        };
        runtime.spawn(async move {
            let started = Instant::now();
            let count = entries.len();
            let worker = me.clone();
            let opened = tokio::task::spawn_blocking(move || {
                entries
                    .into_iter()
                    .filter_map(|e| worker.try_decrypt(e))
                    .collect::<Vec<_>>()
            })
            .await;
            match opened {
                Ok(items) => {
                    tracing::debug!("🔓 Processed {} mailbox entries in {:?}", count, started.elapsed());
                    for item in items {
                        me.handle_mailbox_item(item);
                    }
                }
                Err(e) => tracing::error!("❌ Mailbox batch decryption failed: {}", e),
            }
        });
    }

    fn handle_mailbox_item(&self, item: MailboxItem) {
        let uid = item.uid().to_string();
        let is_new = {
            let mut items = self.items_by_uid.write();
            if items.contains_key(&uid) {
                false
            } else {
                items.insert(uid.clone(), item.clone());
                true
            }
        };
        if is_new {
            tracing::debug!("📬 Stored mailbox item {} (mine: {})", uid, item.is_mine());
            self.persistence_request.request();
        }
        // Known items are applied again; consumers deal with duplicates.
        if item.is_mine() {
            self.process_my_mailbox_item(&item);
        }
    }

    fn process_my_mailbox_item(&self, item: &MailboxItem) {
        let Some(decrypted) = &item.decrypted_message_with_pub_key else {
            return;
        };
        let sender = &decrypted.message.sender_node_address;
        tracing::info!(
            "📥 Mailbox message {} ({}) from {}",
            decrypted.message.uid,
            decrypted.message.message_type,
            sender
        );
        for listener in self.mailbox_listeners.snapshot().iter() {
            listener.on_mailbox_message_added(decrypted, sender);
        }
        // The local item stays until the consumer calls remove_mailbox_msg.
        if self.is_bootstrapped() {
            self.remove_mailbox_entry_from_network(&item.protected_mailbox_storage_entry);
        }
    }

    pub fn get_my_decrypted_mailbox_messages(&self) -> Vec<DecryptedMessageWithPubKey> {
        let items = self.items_by_uid.read();
        let mut mine: Vec<&MailboxItem> = items.values().filter(|i| i.is_mine()).collect();
        mine.sort_by_key(|i| i.creation_timestamp());
        mine.into_iter()
            .filter_map(|i| i.decrypted_message_with_pub_key.clone())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Removal
    // -----------------------------------------------------------------------

    fn remove_mailbox_entry_from_network(&self, entry: &ProtectedStorageEntry) -> bool {
        let (Some(payload), Some(receivers_pub_key)) = (mailbox_payload(entry), entry.receivers_pub_key()) else {
            return false;
        };
        if !self.storage.contains(&entry.hash_of_payload()) {
            tracing::debug!("Mailbox entry {} was already removed", payload.prefixed_sealed_and_signed_message.uid);
            return false;
        }
        let updated = self.storage.get_mailbox_data_with_signed_seq_nr(
            ProtectedStoragePayload::Mailbox(payload.clone()),
            self.key_ring.signature_key_pair(),
            *receivers_pub_key,
        );
        let own_address = self.network_node.node_address();
        let removed = self.storage.remove(updated, own_address.as_ref());
        if removed {
            tracing::info!("🧹 Removed mailbox entry {} from the network", payload.prefixed_sealed_and_signed_message.uid);
        } else {
            tracing::warn!("⚠️ Removing mailbox entry {} from the network failed", payload.prefixed_sealed_and_signed_message.uid);
        }
        removed
    }

    fn remove_item_from_local_store(&self, uid: &str) {
        if self.items_by_uid.write().remove(uid).is_some() {
            tracing::debug!("Removed mailbox item {}", uid);
            self.persistence_request.request();
        }
    }

    /// Called by the consumer once a message has been processed. Waits for
    /// bootstrap if needed, then removes the entry from the network and the
    /// item from the local store.
    pub fn remove_mailbox_msg(&self, uid: &str) -> Option<JoinHandle<()>> {
        let me = self.me.upgrade()?;
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let uid = uid.to_string();
        Some(runtime.spawn(async move {
            loop {
                let delay = if me.is_bootstrapped() {
                    REMOVE_DELAY
                } else {
                    REMOVE_RETRY_DELAY
                };
                tokio::select! {
                    _ = me.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                if me.is_bootstrapped() {
                    me.remove_mailbox_msg_now(&uid);
                    return;
                }
                tracing::debug!("Not bootstrapped yet, retrying removal of {} in {:?}", uid, REMOVE_RETRY_DELAY);
            }
        }))
    }

    fn remove_mailbox_msg_now(&self, uid: &str) {
        let entry = self
            .items_by_uid
            .read()
            .get(uid)
            .map(|i| i.protected_mailbox_storage_entry.clone());
        let Some(entry) = entry else {
            return;
        };
        // Removal at delivery time is skipped before bootstrap, so try again.
        self.remove_mailbox_entry_from_network(&entry);
        self.remove_item_from_local_store(uid);
    }

    // -----------------------------------------------------------------------
    // Republishing
    // -----------------------------------------------------------------------

    fn maybe_republish_mailbox_messages(&self) {
        if !self.republish_mailbox_entries {
            return;
        }
        let now = self.clock.millis();
        let mut entries: Vec<ProtectedStorageEntry> = self
            .items_by_uid
            .read()
            .values()
            .filter(|i| !i.is_expired(now))
            .map(|i| i.protected_mailbox_storage_entry.clone())
            .collect();
        if entries.is_empty() {
            return;
        }
        entries.sort_by_key(ProtectedStorageEntry::creation_timestamp);
        let (Some(me), Ok(runtime)) = (self.me.upgrade(), tokio::runtime::Handle::try_current()) else {
            return;
        };
        tracing::info!("📡 Republishing {} mailbox entries", entries.len());
        let mut queue: VecDeque<ProtectedStorageEntry> = entries.into();
        runtime.spawn(async move {
            loop {
                me.republish_chunk(&mut queue);
                if queue.is_empty() {
                    break;
                }
                tokio::select! {
                    _ = me.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(REPUBLISH_DELAY) => {}
                }
            }
        });
    }

    fn republish_chunk(&self, queue: &mut VecDeque<ProtectedStorageEntry>) -> usize {
        let own_address = self.network_node.node_address();
        let mut sent = 0;
        while sent < REPUBLISH_CHUNK_SIZE {
            let Some(entry) = queue.pop_front() else {
                break;
            };
            // The broadcaster bundles these into one envelope per peer.
            self.storage
                .republish_existing_protected_mailbox_storage_entry(entry, own_address.as_ref(), None);
            sent += 1;
        }
        tracing::debug!("📡 Republished {} mailbox entries, {} left", sent, queue.len());
        sent
    }
}

impl HashMapChangedListener for MailboxMessageService {
    fn on_added(&self, entries: &[ProtectedStorageEntry]) {
        let mailbox_entries: Vec<ProtectedStorageEntry> = entries
            .iter()
            .filter(|e| prefixed_message(e).is_some())
            .cloned()
            .collect();
        match mailbox_entries.len() {
            0 => {}
            1 => {
                for item in mailbox_entries.into_iter().filter_map(|e| self.try_decrypt(e)) {
                    self.handle_mailbox_item(item);
                }
            }
            _ => self.process_batch(mailbox_entries),
        }
    }

    fn on_removed(&self, entries: &[ProtectedStorageEntry]) {
        // Own items leave the local store through remove_mailbox_msg only.
        for prefixed in entries.iter().filter_map(prefixed_message) {
            let foreign = self
                .items_by_uid
                .read()
                .get(&prefixed.uid)
                .is_some_and(|i| !i.is_mine());
            if foreign {
                self.remove_item_from_local_store(&prefixed.uid);
            }
        }
    }
}

impl MessageListener for MailboxMessageService {
    fn on_message(&self, envelope: &NetworkEnvelope, connection: &Arc<Connection>) {
        let NetworkEnvelope::PrefixedSealedAndSigned(prefixed) = envelope else {
            return;
        };
        match open_sealed(&prefixed.sealed_and_signed, &self.key_ring) {
            Ok(decrypted) => {
                tracing::info!(
                    "📥 Direct message {} ({}) from {}",
                    decrypted.message.uid,
                    decrypted.message.message_type,
                    prefixed.sender_node_address
                );
                for listener in self.direct_listeners.snapshot().iter() {
                    listener.on_direct_message(&decrypted, &prefixed.sender_node_address);
                }
            }
            Err(e) => tracing::warn!(
                "⚠️ Could not open direct message {} from {:?}: {}",
                prefixed.uid,
                connection.peers_node_address(),
                e
            ),
        }
    }
}

impl PersistedStore for MailboxMessageService {
    fn store_name(&self) -> &'static str {
        SLOT
    }

    fn persist_if_requested(&self) -> Result<bool, StorageError> {
        let ignored_written = self.ignored.persist_if_requested()?;
        if !self.persistence_request.take() {
            return Ok(ignored_written);
        }
        let mut items: Vec<MailboxItem> = self.items_by_uid.read().values().cloned().collect();
        items.sort_by_key(MailboxItem::creation_timestamp);
        if items.len() > MAX_PERSISTED_ITEMS {
            items.drain(..items.len() - MAX_PERSISTED_ITEMS);
        }
        self.persistence.write(SLOT, &items)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::network::message::BroadcastMessage;
    use crate::storage::P2PDataStorageConfig;
    use crate::test_support::{RecordingBroadcaster, StaticNode};
    use parking_lot::Mutex;

    const NOW: i64 = 1_700_000_000_000;

    #[derive(Default)]
    struct Inbox {
        received: Mutex<Vec<String>>,
    }

    impl DecryptedMailboxListener for Inbox {
        fn on_mailbox_message_added(&self, decrypted: &DecryptedMessageWithPubKey, _sender: &NodeAddress) {
            self.received.lock().push(decrypted.message.uid.clone());
        }
    }

    #[derive(Default)]
    struct SendOutcome {
        faults: Mutex<Vec<String>>,
    }

    impl SendMailboxMessageListener for SendOutcome {
        fn on_arrived(&self) {}

        fn on_stored_in_mailbox(&self) {}

        fn on_fault(&self, error_message: &str) {
            self.faults.lock().push(error_message.to_string());
        }
    }

    /// Connected to one unrelated peer, so direct sends to anyone else fail.
    fn service(address: &str, storage: Arc<P2PDataStorage>, persistence: Persistence) -> Arc<MailboxMessageService> {
        MailboxMessageService::new(
            StaticNode::new(address, &["peer:1"]),
            storage,
            KeyRing::generate(),
            persistence,
            Arc::new(ManualClock::new(NOW)),
            false,
            CancellationToken::new(),
        )
    }

    fn shared_storage() -> Arc<P2PDataStorage> {
        Arc::new(P2PDataStorage::new(
            Persistence::in_memory(),
            Arc::new(RecordingBroadcaster::default()),
            Arc::new(ManualClock::new(NOW)),
            P2PDataStorageConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_unreachable_peer_gets_message_through_mailbox() {
        let storage = shared_storage();
        let alice = service("alice:1", storage.clone(), Persistence::in_memory());
        let bob = service("bob:1", storage.clone(), Persistence::in_memory());
        let inbox = Arc::new(Inbox::default());
        bob.add_decrypted_mailbox_listener(inbox.clone());
        alice.on_bootstrapped();
        bob.on_bootstrapped();

        let message = MailboxMessage::new("alice:1".parse().unwrap(), "trade", b"hello".to_vec());
        let uid = message.uid.clone();
        let outcome = Arc::new(SendOutcome::default());
        alice
            .send_encrypted_mailbox_message(&"bob:1".parse().unwrap(), &bob.key_ring().pub_key_ring(), message, outcome.clone())
            .await
            .unwrap();

        assert!(outcome.faults.lock().is_empty());
        assert_eq!(*inbox.received.lock(), vec![uid.clone()]);
        // Bob removed it from the shared map, but keeps his own copy.
        assert!(storage.is_empty());
        assert!(bob.mailbox_item(&uid).is_some_and(|i| i.is_mine()));
        assert!(alice.ignored().is_ignored(&uid));
        assert_eq!(bob.get_my_decrypted_mailbox_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_send_requires_bootstrap_and_foreign_key() {
        let storage = shared_storage();
        let alice = service("alice:1", storage, Persistence::in_memory());
        let message = MailboxMessage::new("alice:1".parse().unwrap(), "trade", vec![]);
        let own_ring = alice.key_ring().pub_key_ring();
        let err = alice
            .send_encrypted_mailbox_message(&"bob:1".parse().unwrap(), &own_ring, message.clone(), Arc::new(SendOutcome::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, MailboxError::SendToSelf));

        let other = KeyRing::generate().pub_key_ring();
        let err = alice
            .send_encrypted_mailbox_message(&"bob:1".parse().unwrap(), &other, message, Arc::new(SendOutcome::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, MailboxError::NetworkNotReady));
    }

    #[tokio::test]
    async fn test_items_survive_restart() {
        let storage = shared_storage();
        let persistence = Persistence::in_memory();
        let alice = service("alice:1", storage.clone(), Persistence::in_memory());
        let bob = service("bob:1", storage.clone(), persistence.clone());
        alice.on_bootstrapped();

        let message = MailboxMessage::new("alice:1".parse().unwrap(), "trade", b"later".to_vec());
        let uid = message.uid.clone();
        alice
            .send_encrypted_mailbox_message(&"bob:1".parse().unwrap(), &bob.key_ring().pub_key_ring(), message, Arc::new(SendOutcome::default()))
            .await
            .unwrap();
        // Bob is not bootstrapped, so the entry stays in the map.
        assert_eq!(storage.len(), 1);
        bob.on_bootstrapped();
        assert!(bob.persist_if_requested().unwrap());

        let fresh_storage = shared_storage();
        let restarted = service("bob:1", fresh_storage.clone(), persistence);
        assert!(restarted.mailbox_item(&uid).is_some());
        assert_eq!(fresh_storage.len(), 1);
    }

    /// A mailbox entry for somebody else, with `padding` bytes of ciphertext.
    fn foreign_item(uid: &str, creation_timestamp: i64, padding: usize) -> MailboxItem {
        let key = PubKeyBytes([7; 32]);
        let prefixed = PrefixedSealedAndSignedMessage {
            sender_node_address: "carol:1".parse().unwrap(),
            sealed_and_signed: SealedAndSigned {
                ephemeral_pub_key: [0; 32],
                nonce: [0; 12],
                ciphertext: vec![0; padding],
                signature: vec![],
                sig_public_key: key,
            },
            uid: uid.to_string(),
        };
        let payload = ProtectedStoragePayload::Mailbox(MailboxStoragePayload::new(
            prefixed,
            key,
            key,
            Duration::from_secs(24 * 60 * 60),
        ));
        MailboxItem::new(
            ProtectedStorageEntry::new_mailbox(payload, key, 1, vec![], key, creation_timestamp),
            None,
        )
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_reload_keeps_newest_items_and_skips_oversized() {
        let persistence = Persistence::in_memory();
        let total = MAX_PERSISTED_ITEMS + 5;
        let mut items: Vec<MailboxItem> = (0..total)
            .map(|i| foreign_item(&format!("item-{}", i), NOW - (total - i) as i64 * 1_000, 16))
            .collect();
        let oversized = foreign_item("oversized", NOW, MAX_PERSISTED_ITEM_SIZE);
        assert!(oversized.serialized_size() >= MAX_PERSISTED_ITEM_SIZE);
        items.push(oversized);
        items.push(foreign_item("expired", NOW - 2 * 24 * 60 * 60 * 1_000, 16));
        persistence.write(SLOT, &items).unwrap();

        let storage = shared_storage();
        let bob = service("bob:1", storage.clone(), persistence.clone());
        assert_eq!(bob.mailbox_items_len(), MAX_PERSISTED_ITEMS);
        assert_eq!(storage.len(), MAX_PERSISTED_ITEMS);
        for dropped in ["item-0", "item-4", "oversized", "expired"] {
            assert!(bob.mailbox_item(dropped).is_none(), "{} was kept", dropped);
        }
        assert!(bob.mailbox_item("item-5").is_some());
        assert!(bob.mailbox_item(&format!("item-{}", total - 1)).is_some());

        // The trimmed set is written back.
        assert!(bob.persist_if_requested().unwrap());
        let rewritten: Vec<MailboxItem> = persistence.read_or_default(SLOT);
        assert_eq!(rewritten.len(), MAX_PERSISTED_ITEMS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_republish_sends_one_chunk_per_delay() {
        let persistence = Persistence::in_memory();
        let items: Vec<MailboxItem> = (0..120)
            .map(|i| foreign_item(&format!("item-{}", i), NOW - (120 - i) as i64 * 1_000, 16))
            .collect();
        persistence.write(SLOT, &items).unwrap();

        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let storage = Arc::new(P2PDataStorage::new(
            Persistence::in_memory(),
            broadcaster.clone(),
            Arc::new(ManualClock::new(NOW)),
            P2PDataStorageConfig::default(),
        ));
        let service = MailboxMessageService::new(
            StaticNode::new("bob:1", &["peer:1"]),
            storage,
            KeyRing::generate(),
            persistence,
            Arc::new(ManualClock::new(NOW)),
            true,
            CancellationToken::new(),
        );

        service.on_bootstrapped();
        settle().await;
        assert_eq!(broadcaster.len(), REPUBLISH_CHUNK_SIZE);
        let first_uid = match &broadcaster.messages.lock()[0].0 {
            BroadcastMessage::AddData(m) => prefixed_message(&m.protected_storage_entry).map(|p| p.uid.clone()),
            _ => None,
        };
        assert_eq!(first_uid.as_deref(), Some("item-0"));

        tokio::time::advance(REPUBLISH_DELAY - Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(broadcaster.len(), REPUBLISH_CHUNK_SIZE);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(broadcaster.len(), 2 * REPUBLISH_CHUNK_SIZE);

        tokio::time::advance(REPUBLISH_DELAY).await;
        settle().await;
        assert_eq!(broadcaster.len(), 120);

        tokio::time::advance(REPUBLISH_DELAY * 3).await;
        settle().await;
        assert_eq!(broadcaster.len(), 120);
    }
}
