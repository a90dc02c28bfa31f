//! The replicated map.
//!
//! Holds every live protected entry and routes append-only payloads to their
//! stores. All writes go through the validated operations below; a rejected
//! operation returns `false` and is logged, it never errors.

use crate::broadcast::{BroadcastListener, MessageBroadcaster};
use crate::clock::SharedClock;
use crate::crypto::{PubKeyBytes, SignatureKeyPair};
use crate::error::StorageError;
use crate::getdata::messages::{GetDataRequest, GetDataResponse};
use crate::listeners::ListenerList;
use crate::network::capabilities::Capabilities;
use crate::network::connection::{CloseConnectionReason, Connection};
use crate::network::message::{
    AddDataMessage, AddPersistableNetworkPayloadMessage, BroadcastMessage, NetworkEnvelope, RefreshOfferMessage,
    RemoveDataMessage, RemoveMailboxDataMessage,
};
use crate::network::node::{ConnectionListener, MessageListener};
use crate::network::node_address::NodeAddress;
use crate::storage::append_only::{AppendOnlyDataStoreService, ReleaseVersion};
use crate::storage::byte_array::StorageByteArray;
use crate::storage::entry::{data_and_seq_nr_hash, ProtectedStorageEntry};
use crate::storage::payload::{PersistableNetworkPayload, ProtectedStoragePayload};
use crate::storage::persistence::{PersistedStore, Persistence, PersistenceRequest};
use crate::storage::protected_store::ProtectedDataStoreService;
use crate::storage::removed_payloads::RemovedPayloadsService;
use crate::storage::sequence_number_map::{SequenceNumberMap, PURGE_AGE};
use crate::storage::truncation::{self, TruncationCandidate};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SEQUENCE_NUMBER_SLOT: &str = "sequence_numbers";

pub const CHECK_TTL_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_SEQUENCE_NUMBER_MAP_SIZE_BEFORE_PURGE: usize = 1_000;

pub trait HashMapChangedListener: Send + Sync {
    fn on_added(&self, entries: &[ProtectedStorageEntry]);

    fn on_removed(&self, entries: &[ProtectedStorageEntry]);
}

pub trait AppendOnlyDataStoreListener: Send + Sync {
    fn on_added(&self, payload: &PersistableNetworkPayload);
}

/// Returns false to refuse a payload (bans, privileged publishers).
pub type FilterPredicate = Arc<dyn Fn(&ProtectedStoragePayload) -> bool + Send + Sync>;

/// Only keys on `allowed` may publish privileged payloads.
pub fn privileged_key_filter(allowed: HashSet<PubKeyBytes>) -> FilterPredicate {
    Arc::new(move |payload| !payload.is_privileged() || allowed.contains(payload.owner_pub_key()))
}

#[derive(Debug, Clone)]
pub struct P2PDataStorageConfig {
    pub max_sequence_number_map_size_before_purge: usize,
    pub check_ttl_interval: Duration,
}

impl Default for P2PDataStorageConfig {
    fn default() -> Self {
        Self {
            max_sequence_number_map_size_before_purge: DEFAULT_MAX_SEQUENCE_NUMBER_MAP_SIZE_BEFORE_PURGE,
            check_ttl_interval: CHECK_TTL_INTERVAL,
        }
    }
}

#[derive(Default)]
struct StorageState {
    map: HashMap<StorageByteArray, ProtectedStorageEntry>,
    sequence_number_map: SequenceNumberMap,
}

impl StorageState {
    fn has_sequence_nr_increased(&self, new_sequence_number: u32, hash: &StorageByteArray) -> bool {
        match self.sequence_number_map.get(hash) {
            Some(stored) if new_sequence_number > stored.sequence_nr => true,
            Some(stored) if new_sequence_number == stored.sequence_nr => {
                tracing::trace!("Sequence number {} for {:?} already seen", new_sequence_number, hash);
                false
            }
            Some(stored) => {
                tracing::debug!(
                    "Sequence number {} for {:?} older than stored {}",
                    new_sequence_number,
                    hash,
                    stored.sequence_nr
                );
                false
            }
            None => true,
        }
    }

    fn next_sequence_number(&self, hash: &StorageByteArray) -> u32 {
        self.sequence_number_map
            .get(hash)
            .map(|v| v.sequence_nr.saturating_add(1))
            .unwrap_or(1)
    }
}

pub struct P2PDataStorage {
    state: Mutex<StorageState>,
    broadcaster: Arc<dyn MessageBroadcaster>,
    append_only_store: Arc<AppendOnlyDataStoreService>,
    protected_store: Arc<ProtectedDataStoreService>,
    removed_payloads: Arc<RemovedPayloadsService>,
    persistence: Persistence,
    persistence_request: PersistenceRequest,
    hash_map_changed_listeners: ListenerList<dyn HashMapChangedListener>,
    append_only_listeners: ListenerList<dyn AppendOnlyDataStoreListener>,
    filter_predicate: RwLock<Option<FilterPredicate>>,
    clock: SharedClock,
    config: P2PDataStorageConfig,
    expiry_task: Mutex<Option<CancellationToken>>,
}

impl P2PDataStorage {
    pub fn new(
        persistence: Persistence,
        broadcaster: Arc<dyn MessageBroadcaster>,
        clock: SharedClock,
        config: P2PDataStorageConfig,
    ) -> Self {
        let append_only_store = Arc::new(AppendOnlyDataStoreService::new(persistence.clone()));
        let protected_store = Arc::new(ProtectedDataStoreService::new(persistence.clone()));
        let removed_payloads = Arc::new(RemovedPayloadsService::new(persistence.clone(), clock.clone()));
        let storage = Self {
            state: Mutex::new(StorageState::default()),
            broadcaster,
            append_only_store,
            protected_store,
            removed_payloads,
            persistence,
            persistence_request: PersistenceRequest::default(),
            hash_map_changed_listeners: ListenerList::new(),
            append_only_listeners: ListenerList::new(),
            filter_predicate: RwLock::new(None),
            clock,
            config,
            expiry_task: Mutex::new(None),
        };
        storage.read_persisted();
        storage
    }

    /// Restores sequence numbers and the locally persisted protected
    /// entries. Expired entries are not restored.
    fn read_persisted(&self) {
        let mut sequence_number_map: SequenceNumberMap = self.persistence.read_or_default(SEQUENCE_NUMBER_SLOT);
        let now = self.clock.millis();
        if sequence_number_map.len() > self.config.max_sequence_number_map_size_before_purge {
            let purged = sequence_number_map.purge_older_than(now, PURGE_AGE);
            if purged > 0 {
                tracing::info!("🧹 Purged {} old sequence numbers at startup", purged);
                self.persistence_request.request();
            }
        }

        let mut state = self.state.lock();
        state.sequence_number_map = sequence_number_map;
        let mut restored = 0;
        for entry in self.protected_store.entries() {
            let hash = entry.hash_of_payload();
            if entry.is_expired(now) {
                self.protected_store.remove(&hash);
                continue;
            }
            state.map.insert(hash, entry);
            restored += 1;
        }
        if restored > 0 {
            tracing::info!("💾 Restored {} persisted protected entries", restored);
        }
    }

    pub fn append_only_store(&self) -> &Arc<AppendOnlyDataStoreService> {
        &self.append_only_store
    }

    pub fn protected_store(&self) -> &Arc<ProtectedDataStoreService> {
        &self.protected_store
    }

    pub fn removed_payloads(&self) -> &Arc<RemovedPayloadsService> {
        &self.removed_payloads
    }

    pub fn set_filter_predicate(&self, predicate: FilterPredicate) {
        *self.filter_predicate.write() = Some(predicate);
    }

    pub fn add_hash_map_changed_listener(&self, listener: Arc<dyn HashMapChangedListener>) {
        self.hash_map_changed_listeners.add(listener);
    }

    pub fn remove_hash_map_changed_listener(&self, listener: &Arc<dyn HashMapChangedListener>) {
        self.hash_map_changed_listeners.remove(listener);
    }

    pub fn add_append_only_data_store_listener(&self, listener: Arc<dyn AppendOnlyDataStoreListener>) {
        self.append_only_listeners.add(listener);
    }

    /// Snapshot of the live map.
    pub fn map(&self) -> HashMap<StorageByteArray, ProtectedStorageEntry> {
        self.state.lock().map.clone()
    }

    pub fn get(&self, hash: &StorageByteArray) -> Option<ProtectedStorageEntry> {
        self.state.lock().map.get(hash).cloned()
    }

    pub fn contains(&self, hash: &StorageByteArray) -> bool {
        self.state.lock().map.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.state.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sequence_number(&self, hash: &StorageByteArray) -> Option<u32> {
        self.state.lock().sequence_number_map.get(hash).map(|v| v.sequence_nr)
    }

    fn notify_added(&self, entries: &[ProtectedStorageEntry]) {
        for listener in self.hash_map_changed_listeners.snapshot().iter() {
            listener.on_added(entries);
        }
    }

    fn notify_removed(&self, entries: &[ProtectedStorageEntry]) {
        for listener in self.hash_map_changed_listeners.snapshot().iter() {
            listener.on_removed(entries);
        }
    }

    fn passes_filter(&self, payload: &ProtectedStoragePayload) -> bool {
        match self.filter_predicate.read().as_ref() {
            Some(predicate) => predicate(payload),
            None => true,
        }
    }

    // -----------------------------------------------------------------------
    // Protected entries
    // -----------------------------------------------------------------------

    pub fn add_protected_storage_entry(
        &self,
        mut entry: ProtectedStorageEntry,
        sender: Option<&NodeAddress>,
        listener: Option<Arc<dyn BroadcastListener>>,
        allow_broadcast: bool,
    ) -> bool {
        let now = self.clock.millis();
        entry.clamp_creation_timestamp(now);
        let hash = entry.hash_of_payload();
        {
            let mut state = self.state.lock();
            let stored = state.map.get(&hash);

            if stored.is_some() && !state.has_sequence_nr_increased(entry.sequence_number(), &hash) {
                tracing::trace!("Already have {:?} with an equal or newer sequence number", hash);
                return false;
            }

            if entry.payload().is_add_once() && self.removed_payloads.was_removed(&hash) {
                tracing::debug!("Refusing re-add of removed {} {:?}", entry.payload().kind_name(), hash);
                return false;
            }

            if entry.is_expired(now) {
                tracing::debug!("Refusing expired {} {:?}", entry.payload().kind_name(), hash);
                return false;
            }

            // Equal sequence numbers are accepted when the entry is not held
            // locally so non-persisted payloads can be rebuilt after restart.
            if let Some(seen) = state.sequence_number_map.get(&hash) {
                if entry.sequence_number() < seen.sequence_nr {
                    tracing::debug!("Refusing {:?}: sequence number below {}", hash, seen.sequence_nr);
                    return false;
                }
            }

            if !entry.is_valid_for_add_operation() {
                tracing::debug!("Refusing {} {:?}: not valid for add", entry.payload().kind_name(), hash);
                return false;
            }

            if let Some(stored) = stored {
                if !entry.matches_relevant_pub_key(stored) {
                    tracing::warn!("⚠️ Refusing {:?}: owner key does not match stored entry", hash);
                    return false;
                }
            }

            if !self.passes_filter(entry.payload()) {
                tracing::debug!("🚫 Filter refused {} {:?}", entry.payload().kind_name(), hash);
                return false;
            }

            state.map.insert(hash.clone(), entry.clone());
            state
                .sequence_number_map
                .put(hash.clone(), entry.sequence_number(), now);
        }
        self.persistence_request.request();
        self.notify_added(std::slice::from_ref(&entry));

        if entry.payload().is_persistable() {
            self.protected_store.put(hash, entry.clone());
        }

        if allow_broadcast {
            self.broadcaster.broadcast(
                BroadcastMessage::AddData(AddDataMessage {
                    protected_storage_entry: entry,
                }),
                sender.cloned(),
                listener,
            );
        }
        true
    }

    /// Applies a remove. The remove is broadcast even when we never held the
    /// entry, so peers that do hold it still converge.
    pub fn remove(&self, entry: ProtectedStorageEntry, sender: Option<&NodeAddress>) -> bool {
        let hash = entry.hash_of_payload();
        let removed = {
            let mut state = self.state.lock();
            if !state.has_sequence_nr_increased(entry.sequence_number(), &hash) {
                return false;
            }

            if !entry.is_valid_for_remove_operation() {
                tracing::debug!("Refusing remove of {:?}: not valid for remove", hash);
                return false;
            }

            if let Some(stored) = state.map.get(&hash) {
                if !entry.matches_relevant_pub_key(stored) {
                    tracing::warn!("⚠️ Refusing remove of {:?}: owner key does not match", hash);
                    return false;
                }
            }

            let now = self.clock.millis();
            state
                .sequence_number_map
                .put(hash.clone(), entry.sequence_number(), now);
            state.map.remove(&hash)
        };
        self.persistence_request.request();

        if entry.payload().is_add_once() {
            self.removed_payloads.add_hash(hash.clone());
        }

        match removed {
            Some(stored) => {
                if stored.payload().is_persistable() {
                    self.protected_store.remove(&hash);
                }
                self.notify_removed(std::slice::from_ref(&stored));
            }
            None => tracing::debug!("Remove of {:?} which we do not hold", hash),
        }

        let message = if entry.is_mailbox() {
            BroadcastMessage::RemoveMailboxData(RemoveMailboxDataMessage {
                protected_mailbox_storage_entry: entry,
            })
        } else {
            BroadcastMessage::RemoveData(RemoveDataMessage {
                protected_storage_entry: entry,
            })
        };
        self.broadcaster.broadcast(message, sender.cloned(), None);
        true
    }

    /// Extends the life of a stored entry. Unknown hashes return false: the
    /// refresh may simply have overtaken the add.
    pub fn refresh_ttl(&self, message: RefreshOfferMessage, sender: Option<&NodeAddress>) -> bool {
        let hash = StorageByteArray::new(message.hash_of_payload.clone());
        let now = self.clock.millis();
        {
            let mut state = self.state.lock();
            let Some(stored) = state.map.get(&hash) else {
                tracing::debug!("Refresh for unknown {:?}", hash);
                return false;
            };

            let updated = ProtectedStorageEntry::new(
                stored.payload().clone(),
                *stored.owner_pub_key(),
                message.sequence_number,
                message.signature.clone(),
                now,
            );

            if !state.has_sequence_nr_increased(updated.sequence_number(), &hash) {
                return false;
            }

            if !updated.is_valid_for_add_operation() {
                tracing::debug!("Refusing refresh of {:?}: invalid signature", hash);
                return false;
            }

            if updated.payload().is_persistable() {
                self.protected_store.put(hash.clone(), updated.clone());
            }
            state.map.insert(hash.clone(), updated);
            state
                .sequence_number_map
                .put(hash, message.sequence_number, now);
        }
        self.persistence_request.request();

        self.broadcaster
            .broadcast(BroadcastMessage::RefreshOffer(message), sender.cloned(), None);
        true
    }

    // -----------------------------------------------------------------------
    // Append-only payloads
    // -----------------------------------------------------------------------

    pub fn add_persistable_network_payload(
        &self,
        payload: PersistableNetworkPayload,
        sender: Option<&NodeAddress>,
        allow_broadcast: bool,
        re_broadcast: bool,
        check_date: bool,
    ) -> bool {
        let hash = payload.hash();
        let already_stored = self.append_only_store.contains(&payload, &hash);
        if already_stored && !re_broadcast {
            tracing::trace!("Already have {} {:?}", payload.kind().name(), hash);
            return false;
        }

        if !payload.verify_hash_size() {
            tracing::warn!("⚠️ {} has an invalid hash size {}", payload.kind().name(), hash.len());
            return false;
        }

        if check_date && !payload.is_date_in_tolerance(self.clock.millis()) {
            tracing::debug!("Refusing {} {:?}: date out of tolerance", payload.kind().name(), hash);
            return false;
        }

        let mut was_added = false;
        if !already_stored {
            was_added = self.append_only_store.put(hash, payload.clone());
            if was_added {
                for listener in self.append_only_listeners.snapshot().iter() {
                    listener.on_added(&payload);
                }
            }
        }

        if allow_broadcast && (was_added || re_broadcast) {
            self.broadcaster.broadcast(
                BroadcastMessage::AddPersistableNetworkPayload(AddPersistableNetworkPayloadMessage { payload }),
                sender.cloned(),
                None,
            );
        }
        true
    }

    // -----------------------------------------------------------------------
    // Builders for our own entries
    // -----------------------------------------------------------------------

    /// Signs `payload` with the next sequence number for its hash.
    pub fn get_protected_storage_entry(
        &self,
        payload: ProtectedStoragePayload,
        owner: &SignatureKeyPair,
    ) -> ProtectedStorageEntry {
        let sequence_number = self.state.lock().next_sequence_number(&payload.hash());
        ProtectedStorageEntry::signed(payload, owner, sequence_number, self.clock.millis())
    }

    pub fn get_refresh_ttl_message(
        &self,
        payload: &ProtectedStoragePayload,
        owner: &SignatureKeyPair,
    ) -> RefreshOfferMessage {
        let hash = payload.hash();
        let sequence_number = self.state.lock().next_sequence_number(&hash);
        let hash_of_data_and_seq_nr = data_and_seq_nr_hash(payload, sequence_number);
        RefreshOfferMessage {
            hash_of_data_and_seq_nr,
            signature: owner.sign(&hash_of_data_and_seq_nr),
            hash_of_payload: hash.as_bytes().to_vec(),
            sequence_number,
        }
    }

    /// Mailbox entry signed by `signer`, the sender on add or the receiver on
    /// remove.
    pub fn get_mailbox_data_with_signed_seq_nr(
        &self,
        payload: ProtectedStoragePayload,
        signer: &SignatureKeyPair,
        receivers_pub_key: PubKeyBytes,
    ) -> ProtectedStorageEntry {
        let sequence_number = self.state.lock().next_sequence_number(&payload.hash());
        ProtectedStorageEntry::signed_mailbox(payload, signer, sequence_number, receivers_pub_key, self.clock.millis())
    }

    /// Puts a persisted mailbox entry back without validation, notification
    /// or broadcast.
    pub fn add_protected_mailbox_storage_entry_to_map(&self, entry: ProtectedStorageEntry) {
        let hash = entry.hash_of_payload();
        self.state.lock().map.insert(hash, entry);
    }

    pub fn republish_existing_protected_mailbox_storage_entry(
        &self,
        entry: ProtectedStorageEntry,
        sender: Option<&NodeAddress>,
        listener: Option<Arc<dyn BroadcastListener>>,
    ) {
        let hash = entry.hash_of_payload();
        if self.removed_payloads.was_removed(&hash) {
            tracing::warn!("⚠️ Not republishing removed mailbox entry {:?}", hash);
            return;
        }
        self.broadcaster.broadcast(
            BroadcastMessage::AddData(AddDataMessage {
                protected_storage_entry: entry,
            }),
            sender.cloned(),
            listener,
        );
    }

    // -----------------------------------------------------------------------
    // Bulk sync
    // -----------------------------------------------------------------------

    /// Hashes we send as exclusions when asking a peer for data.
    pub fn get_known_payload_hashes(&self) -> Vec<Vec<u8>> {
        let mut keys: Vec<Vec<u8>> = self
            .append_only_store
            .live_keys()
            .into_iter()
            .map(|k| k.as_bytes().to_vec())
            .collect();
        keys.extend(self.state.lock().map.keys().map(|k| k.as_bytes().to_vec()));
        keys
    }

    pub fn build_get_data_response(
        &self,
        request: &GetDataRequest,
        peer_capabilities: &Capabilities,
    ) -> GetDataResponse {
        let excluded = request.excluded_keys();
        let version = ReleaseVersion::parse(request.version());

        let payload_candidates = filter_known(
            self.append_only_store.map_since_version(Some(&version)),
            &excluded,
            peer_capabilities,
            |p| p.required_capabilities(),
        );
        let entry_candidates = filter_known(self.map(), &excluded, peer_capabilities, |e| {
            e.payload().required_capabilities()
        });

        let payloads = truncation::truncate(
            payload_candidates,
            truncation::persistable_payloads_budget(),
            truncation::MAX_ENTRIES,
        );
        let entries = truncation::truncate(
            entry_candidates,
            truncation::protected_entries_budget(),
            truncation::MAX_ENTRIES,
        );

        let was_truncated = payloads.was_truncated || entries.was_truncated;
        let truncated_kinds: Vec<String> = payloads
            .truncated_kinds
            .iter()
            .chain(entries.truncated_kinds.iter())
            .map(|k| k.to_string())
            .collect();
        if was_truncated {
            tracing::info!(
                "✂️ Truncated data response for nonce {}: kinds {:?}",
                request.nonce(),
                truncated_kinds
            );
        }

        GetDataResponse {
            data_set: entries.items,
            persistable_network_payload_set: payloads.items,
            request_nonce: request.nonce(),
            is_get_updated_data_response: request.is_updated(),
            was_truncated,
            truncated_kinds,
        }
    }

    // -----------------------------------------------------------------------
    // Expiry
    // -----------------------------------------------------------------------

    /// Evicts expired entries. Their sequence numbers stay so a replayed add
    /// of the same entry is still refused.
    pub fn remove_expired_entries(&self) -> usize {
        let now = self.clock.millis();
        let (expired, purge_sequence_numbers) = {
            let mut state = self.state.lock();
            let expired_hashes: Vec<StorageByteArray> = state
                .map
                .iter()
                .filter(|(_, e)| e.is_expired(now))
                .map(|(h, _)| h.clone())
                .collect();
            let expired: Vec<ProtectedStorageEntry> = expired_hashes
                .iter()
                .filter_map(|h| state.map.remove(h))
                .collect();
            let purge = state.sequence_number_map.len() > self.config.max_sequence_number_map_size_before_purge;
            if purge {
                let purged = state.sequence_number_map.purge_older_than(now, PURGE_AGE);
                tracing::debug!("🧹 Purged {} old sequence numbers", purged);
            }
            (expired, purge)
        };

        if purge_sequence_numbers {
            self.persistence_request.request();
        }
        if expired.is_empty() {
            return 0;
        }

        for entry in &expired {
            if entry.payload().is_persistable() {
                self.protected_store.remove(&entry.hash_of_payload());
            }
        }
        tracing::debug!("🧹 Removed {} expired entries", expired.len());
        self.notify_removed(&expired);
        expired.len()
    }

    /// Starts the periodic expiry sweep. Further calls are ignored.
    pub fn on_bootstrapped(self: &Arc<Self>) {
        let mut task = self.expiry_task.lock();
        if task.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *task = Some(token.clone());
        let storage = Arc::downgrade(self);
        let period = self.config.check_ttl_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(storage) = storage.upgrade() else { break };
                        storage.remove_expired_entries();
                    }
                }
            }
        });
    }

    pub fn shut_down(&self) {
        if let Some(token) = self.expiry_task.lock().take() {
            token.cancel();
        }
    }
}

fn filter_known<T: TruncationCandidate>(
    map: HashMap<StorageByteArray, T>,
    excluded: &HashSet<StorageByteArray>,
    peer_capabilities: &Capabilities,
    required_capabilities: impl Fn(&T) -> Option<Capabilities>,
) -> Vec<T> {
    map.into_iter()
        .filter(|(hash, _)| !excluded.contains(hash))
        .map(|(_, item)| item)
        .filter(|item| match required_capabilities(item) {
            Some(required) => peer_capabilities.contains_all(&required),
            None => true,
        })
        .collect()
}

impl MessageListener for P2PDataStorage {
    fn on_message(&self, envelope: &NetworkEnvelope, connection: &Arc<Connection>) {
        let NetworkEnvelope::Broadcast(message) = envelope else {
            return;
        };
        let Some(peer) = connection.peers_node_address() else {
            return;
        };
        match message {
            BroadcastMessage::AddData(m) => {
                self.add_protected_storage_entry(m.protected_storage_entry.clone(), Some(&peer), None, true);
            }
            BroadcastMessage::RemoveData(m) => {
                self.remove(m.protected_storage_entry.clone(), Some(&peer));
            }
            BroadcastMessage::RemoveMailboxData(m) => {
                self.remove(m.protected_mailbox_storage_entry.clone(), Some(&peer));
            }
            BroadcastMessage::RefreshOffer(m) => {
                self.refresh_ttl(m.clone(), Some(&peer));
            }
            BroadcastMessage::AddPersistableNetworkPayload(m) => {
                self.add_persistable_network_payload(m.payload.clone(), Some(&peer), true, false, true);
            }
            BroadcastMessage::NewStateHash(_) => {}
        }
    }
}

impl ConnectionListener for P2PDataStorage {
    /// A peer that dropped off unexpectedly gets half the TTL of grace on
    /// the entries that need it online.
    fn on_disconnect(&self, reason: CloseConnectionReason, connection: &Arc<Connection>) {
        if reason.is_intended() {
            return;
        }
        let Some(peer) = connection.peers_node_address() else {
            return;
        };
        let back_dated = {
            let mut state = self.state.lock();
            let mut count = 0;
            for entry in state.map.values_mut() {
                if entry.payload().owner_node_address() == Some(&peer) {
                    entry.back_date();
                    count += 1;
                }
            }
            count
        };
        if back_dated > 0 {
            tracing::debug!("🔌 Back-dated {} entries owned by {}", back_dated, peer);
            self.remove_expired_entries();
        }
    }
}

impl PersistedStore for P2PDataStorage {
    fn store_name(&self) -> &'static str {
        SEQUENCE_NUMBER_SLOT
    }

    fn persist_if_requested(&self) -> Result<bool, StorageError> {
        if !self.persistence_request.take() {
            return Ok(false);
        }
        let snapshot = self.state.lock().sequence_number_map.clone();
        self.persistence.write(SEQUENCE_NUMBER_SLOT, &snapshot)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::storage::payload::{
        Alert, DisputeAgent, DisputeAgentRole, Filter, OfferDirection, OfferPayload, TradeStatistics,
    };

    #[derive(Default)]
    struct RecordingBroadcaster {
        messages: Mutex<Vec<BroadcastMessage>>,
    }

    impl RecordingBroadcaster {
        fn count(&self) -> usize {
            self.messages.lock().len()
        }

        fn last_type(&self) -> Option<&'static str> {
            self.messages.lock().last().map(|m| m.message_type())
        }
    }

    impl MessageBroadcaster for RecordingBroadcaster {
        fn broadcast(
            &self,
            message: BroadcastMessage,
            _sender: Option<NodeAddress>,
            _listener: Option<Arc<dyn BroadcastListener>>,
        ) {
            self.messages.lock().push(message);
        }
    }

    #[derive(Default)]
    struct ChangeCounter {
        added: Mutex<usize>,
        removed: Mutex<usize>,
    }

    impl HashMapChangedListener for ChangeCounter {
        fn on_added(&self, entries: &[ProtectedStorageEntry]) {
            *self.added.lock() += entries.len();
        }

        fn on_removed(&self, entries: &[ProtectedStorageEntry]) {
            *self.removed.lock() += entries.len();
        }
    }

    const NOW: i64 = 1_700_000_000_000;

    fn setup() -> (P2PDataStorage, Arc<RecordingBroadcaster>, Arc<ManualClock>) {
        setup_with(Persistence::in_memory())
    }

    fn setup_with(persistence: Persistence) -> (P2PDataStorage, Arc<RecordingBroadcaster>, Arc<ManualClock>) {
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let clock = Arc::new(ManualClock::new(NOW));
        let storage = P2PDataStorage::new(
            persistence,
            broadcaster.clone(),
            clock.clone(),
            P2PDataStorageConfig::default(),
        );
        (storage, broadcaster, clock)
    }

    fn alert(owner: &SignatureKeyPair) -> ProtectedStoragePayload {
        ProtectedStoragePayload::Alert(Alert {
            message: "upgrade".to_string(),
            version: "1.9.0".to_string(),
            is_update_info: true,
            owner_pub_key: owner.public(),
            extra_data: None,
        })
    }

    fn offer(owner: &SignatureKeyPair, address: &NodeAddress) -> ProtectedStoragePayload {
        ProtectedStoragePayload::Offer(OfferPayload {
            id: "offer-1".to_string(),
            owner_node_address: address.clone(),
            direction: OfferDirection::Buy,
            currency_code: "EUR".to_string(),
            price: 30_000,
            amount: 100,
            min_amount: 50,
            date: NOW,
            owner_pub_key: owner.public(),
            extra_data: None,
        })
    }

    #[test]
    fn test_add_then_stale_add_is_rejected() {
        let (storage, broadcaster, _) = setup();
        let keys = SignatureKeyPair::generate();
        let payload = alert(&keys);

        let first = ProtectedStorageEntry::signed(payload.clone(), &keys, 2, NOW);
        assert!(storage.add_protected_storage_entry(first.clone(), None, None, true));
        assert_eq!(broadcaster.last_type(), Some("AddDataMessage"));

        assert!(!storage.add_protected_storage_entry(first, None, None, true));
        let older = ProtectedStorageEntry::signed(payload.clone(), &keys, 1, NOW);
        assert!(!storage.add_protected_storage_entry(older, None, None, true));
        let newer = ProtectedStorageEntry::signed(payload.clone(), &keys, 3, NOW);
        assert!(storage.add_protected_storage_entry(newer, None, None, true));
        assert_eq!(storage.sequence_number(&payload.hash()), Some(3));
        assert_eq!(broadcaster.count(), 2);
    }

    #[test]
    fn test_remove_twice_only_broadcasts_once() {
        let (storage, broadcaster, _) = setup();
        let keys = SignatureKeyPair::generate();
        let payload = alert(&keys);
        let counter = Arc::new(ChangeCounter::default());
        storage.add_hash_map_changed_listener(counter.clone());

        assert!(storage.add_protected_storage_entry(
            ProtectedStorageEntry::signed(payload.clone(), &keys, 1, NOW),
            None,
            None,
            false
        ));
        let removal = ProtectedStorageEntry::signed(payload.clone(), &keys, 2, NOW);
        assert!(storage.remove(removal.clone(), None));
        assert!(!storage.contains(&payload.hash()));
        assert!(!storage.remove(removal, None));

        assert_eq!(broadcaster.count(), 1);
        assert_eq!(broadcaster.last_type(), Some("RemoveDataMessage"));
        assert_eq!(*counter.added.lock(), 1);
        assert_eq!(*counter.removed.lock(), 1);

        let as_listener: Arc<dyn HashMapChangedListener> = counter.clone();
        storage.remove_hash_map_changed_listener(&as_listener);
        let readded = ProtectedStorageEntry::signed(payload, &keys, 3, NOW);
        assert!(storage.add_protected_storage_entry(readded, None, None, false));
        assert_eq!(*counter.added.lock(), 1);
    }

    #[test]
    fn test_remove_of_unknown_entry_still_broadcasts() {
        let (storage, broadcaster, _) = setup();
        let keys = SignatureKeyPair::generate();
        let removal = ProtectedStorageEntry::signed(alert(&keys), &keys, 2, NOW);
        assert!(storage.remove(removal, None));
        assert_eq!(broadcaster.count(), 1);
        // the recorded sequence number now blocks the late add
        assert!(!storage.add_protected_storage_entry(
            ProtectedStorageEntry::signed(alert(&keys), &keys, 1, NOW),
            None,
            None,
            true
        ));
    }

    #[test]
    fn test_owner_mismatch_is_rejected() {
        let (storage, _, _) = setup();
        let owner = SignatureKeyPair::generate();
        let intruder = SignatureKeyPair::generate();
        let payload = alert(&owner);
        let forged = ProtectedStorageEntry::signed(payload, &intruder, 1, NOW);
        assert!(!storage.add_protected_storage_entry(forged, None, None, true));
        assert!(storage.is_empty());
    }

    #[test]
    fn test_expired_entry_is_rejected_and_sweep_keeps_sequence_number() {
        let (storage, _, clock) = setup();
        let keys = SignatureKeyPair::generate();
        let address: NodeAddress = "peer.onion:9999".parse().unwrap();
        let payload = offer(&keys, &address);
        let ttl = payload.ttl().unwrap().as_millis() as i64;

        let stale = ProtectedStorageEntry::signed(payload.clone(), &keys, 1, NOW - ttl - 1);
        assert!(!storage.add_protected_storage_entry(stale, None, None, true));

        let fresh = ProtectedStorageEntry::signed(payload.clone(), &keys, 1, NOW);
        assert!(storage.add_protected_storage_entry(fresh.clone(), None, None, true));
        clock.advance(Duration::from_millis(ttl as u64 + 1));
        assert_eq!(storage.remove_expired_entries(), 1);
        assert!(storage.is_empty());
        assert_eq!(storage.sequence_number(&payload.hash()), Some(1));

        assert!(!storage.add_protected_storage_entry(fresh, None, None, true));
        let lower = ProtectedStorageEntry::signed(payload, &keys, 0, clock.millis());
        assert!(!storage.add_protected_storage_entry(lower, None, None, true));
    }

    #[test]
    fn test_pre_epoch_timestamp_is_treated_as_expired() {
        let (storage, broadcaster, _) = setup();
        let keys = SignatureKeyPair::generate();
        let payload = alert(&keys);

        let ancient = ProtectedStorageEntry::signed(payload.clone(), &keys, 1, i64::MIN);
        assert!(!storage.add_protected_storage_entry(ancient, None, None, true));
        assert!(storage.is_empty());
        assert_eq!(broadcaster.count(), 0);

        let fresh = ProtectedStorageEntry::signed(payload, &keys, 1, NOW);
        assert!(storage.add_protected_storage_entry(fresh, None, None, true));
    }

    #[test]
    fn test_refresh_requires_stored_entry_and_increasing_sequence() {
        let (storage, broadcaster, clock) = setup();
        let keys = SignatureKeyPair::generate();
        let address: NodeAddress = "peer.onion:9999".parse().unwrap();
        let payload = offer(&keys, &address);

        let early = storage.get_refresh_ttl_message(&payload, &keys);
        assert!(!storage.refresh_ttl(early, None));

        let entry = storage.get_protected_storage_entry(payload.clone(), &keys);
        assert_eq!(entry.sequence_number(), 1);
        assert!(storage.add_protected_storage_entry(entry, None, None, false));

        clock.advance(Duration::from_secs(60));
        let refresh = storage.get_refresh_ttl_message(&payload, &keys);
        assert_eq!(refresh.sequence_number, 2);
        assert!(storage.refresh_ttl(refresh.clone(), None));
        assert_eq!(broadcaster.last_type(), Some("RefreshOfferMessage"));
        let stored = storage.get(&payload.hash()).unwrap();
        assert_eq!(stored.creation_timestamp(), clock.millis());
        assert!(!storage.refresh_ttl(refresh, None));
    }

    #[test]
    fn test_disconnect_back_dates_owner_online_entries() {
        let (storage, _, clock) = setup();
        let keys = SignatureKeyPair::generate();
        let address: NodeAddress = "maker.onion:9999".parse().unwrap();
        let payload = offer(&keys, &address);
        let ttl = payload.ttl().unwrap();
        assert!(storage.add_protected_storage_entry(
            ProtectedStorageEntry::signed(payload.clone(), &keys, 1, NOW),
            None,
            None,
            false
        ));

        let connection = Arc::new(Connection::new(Some(address), Capabilities::default()));
        storage.on_disconnect(CloseConnectionReason::Shutdown, &connection);
        assert_eq!(storage.get(&payload.hash()).unwrap().creation_timestamp(), NOW);

        storage.on_disconnect(CloseConnectionReason::Reset, &connection);
        assert!(storage.contains(&payload.hash()));

        clock.advance(ttl / 2 + Duration::from_secs(1));
        storage.on_disconnect(CloseConnectionReason::Timeout, &connection);
        assert!(!storage.contains(&payload.hash()));
    }

    #[test]
    fn test_persistable_payload_dedup_and_date_check() {
        let (storage, broadcaster, _) = setup();
        let trade = PersistableNetworkPayload::TradeStatistics(TradeStatistics {
            currency: "USD".to_string(),
            price: 1,
            amount: 2,
            payment_method: "ZELLE".to_string(),
            date: NOW,
            extra_data: None,
        });
        assert!(storage.add_persistable_network_payload(trade.clone(), None, true, false, true));
        assert!(!storage.add_persistable_network_payload(trade.clone(), None, true, false, true));
        assert!(storage.add_persistable_network_payload(trade, None, true, true, true));
        assert_eq!(broadcaster.count(), 2);

        let old = PersistableNetworkPayload::TradeStatistics(TradeStatistics {
            currency: "USD".to_string(),
            price: 1,
            amount: 2,
            payment_method: "ZELLE".to_string(),
            date: NOW - 3 * 24 * 60 * 60 * 1000,
            extra_data: None,
        });
        assert!(!storage.add_persistable_network_payload(old.clone(), None, true, false, true));
        assert!(storage.add_persistable_network_payload(old, None, false, false, false));
    }

    #[test]
    fn test_privileged_filter() {
        let (storage, _, _) = setup();
        let trusted = SignatureKeyPair::generate();
        let stranger = SignatureKeyPair::generate();
        storage.set_filter_predicate(privileged_key_filter([trusted.public()].into_iter().collect()));

        assert!(!storage.add_protected_storage_entry(
            ProtectedStorageEntry::signed(alert(&stranger), &stranger, 1, NOW),
            None,
            None,
            false
        ));
        assert!(storage.add_protected_storage_entry(
            ProtectedStorageEntry::signed(alert(&trusted), &trusted, 1, NOW),
            None,
            None,
            false
        ));
    }

    #[test]
    fn test_refreshed_filter_survives_restart() {
        let persistence = Persistence::in_memory();
        let keys = SignatureKeyPair::generate();
        let filter = ProtectedStoragePayload::Filter(Filter {
            banned_node_addresses: vec![],
            banned_offer_ids: vec![],
            banned_signer_pub_keys: vec![],
            creation_date: NOW,
            owner_pub_key: keys.public(),
            extra_data: None,
        });
        let hash = filter.hash();
        {
            let (storage, _, clock) = setup_with(persistence.clone());
            assert!(storage.add_protected_storage_entry(
                storage.get_protected_storage_entry(filter.clone(), &keys),
                None,
                None,
                false
            ));
            clock.advance(Duration::from_secs(60));
            let refresh = storage.get_refresh_ttl_message(&filter, &keys);
            assert!(storage.refresh_ttl(refresh, None));

            let kept = storage.protected_store().entries();
            assert_eq!(kept.len(), 1);
            assert_eq!(kept[0].sequence_number(), 2);
            assert_eq!(kept[0].creation_timestamp(), clock.millis());
            assert!(storage.persist_if_requested().unwrap());
            assert!(storage.protected_store().persist_if_requested().unwrap());
        }

        let (restarted, _, _) = setup_with(persistence);
        assert_eq!(restarted.get(&hash).unwrap().sequence_number(), 2);
        assert_eq!(restarted.sequence_number(&hash), Some(2));
    }

    #[test]
    fn test_persistable_entries_and_sequence_numbers_survive_restart() {
        let persistence = Persistence::in_memory();
        let keys = SignatureKeyPair::generate();
        let filter = ProtectedStoragePayload::Filter(Filter {
            banned_node_addresses: vec![],
            banned_offer_ids: vec!["bad".to_string()],
            banned_signer_pub_keys: vec![],
            creation_date: NOW,
            owner_pub_key: keys.public(),
            extra_data: None,
        });
        let alert_payload = alert(&keys);
        {
            let (storage, _, _) = setup_with(persistence.clone());
            assert!(storage.add_protected_storage_entry(
                ProtectedStorageEntry::signed(filter.clone(), &keys, 4, NOW),
                None,
                None,
                false
            ));
            assert!(storage.add_protected_storage_entry(
                ProtectedStorageEntry::signed(alert_payload.clone(), &keys, 1, NOW),
                None,
                None,
                false
            ));
            assert!(storage.persist_if_requested().unwrap());
            assert!(storage.protected_store().persist_if_requested().unwrap());
        }

        let (restarted, _, _) = setup_with(persistence);
        assert!(restarted.contains(&filter.hash()));
        assert!(!restarted.contains(&alert_payload.hash()));
        assert_eq!(restarted.sequence_number(&alert_payload.hash()), Some(1));
    }

    #[test]
    fn test_get_data_response_filters_known_and_capabilities() {
        let (storage, _, _) = setup();
        let keys = SignatureKeyPair::generate();
        let mediator = ProtectedStoragePayload::DisputeAgent(DisputeAgent {
            role: DisputeAgentRole::Mediator,
            node_address: "mediator.onion:9999".parse().unwrap(),
            language_codes: vec!["en".to_string()],
            registration_date: NOW,
            owner_pub_key: keys.public(),
            extra_data: None,
        });
        let alert_payload = alert(&keys);
        for payload in [mediator.clone(), alert_payload.clone()] {
            assert!(storage.add_protected_storage_entry(
                ProtectedStorageEntry::signed(payload, &keys, 1, NOW),
                None,
                None,
                false
            ));
        }

        let request = GetDataRequest::Preliminary(crate::getdata::messages::PreliminaryGetDataRequest {
            nonce: 7,
            excluded_keys: vec![],
            supported_capabilities: Capabilities::default(),
            version: "1.9.0".to_string(),
        });
        let response = storage.build_get_data_response(&request, &Capabilities::default());
        assert_eq!(response.request_nonce, 7);
        assert_eq!(response.data_set.len(), 1);
        assert!(!response.was_truncated);

        let response = storage.build_get_data_response(&request, &Capabilities::app_defaults());
        assert_eq!(response.data_set.len(), 2);

        let request = GetDataRequest::Preliminary(crate::getdata::messages::PreliminaryGetDataRequest {
            nonce: 8,
            excluded_keys: vec![alert_payload.hash().as_bytes().to_vec()],
            supported_capabilities: Capabilities::default(),
            version: "1.9.0".to_string(),
        });
        let response = storage.build_get_data_response(&request, &Capabilities::app_defaults());
        assert_eq!(response.data_set.len(), 1);
        assert_eq!(response.data_set[0].payload(), &mediator);
    }
}
