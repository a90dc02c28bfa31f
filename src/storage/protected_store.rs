//! Local copy of protected entries whose payload is marked persistable
//! (filters, dispute agents). They are put back into the live map at startup
//! so a restarted node serves them before it has synced.

use crate::error::StorageError;
use crate::storage::byte_array::StorageByteArray;
use crate::storage::entry::ProtectedStorageEntry;
use crate::storage::persistence::{PersistedStore, Persistence, PersistenceRequest};
use parking_lot::RwLock;
use std::collections::HashMap;

const SLOT: &str = "protected_data_store";

pub struct ProtectedDataStoreService {
    map: RwLock<HashMap<StorageByteArray, ProtectedStorageEntry>>,
    persistence: Persistence,
    persistence_request: PersistenceRequest,
}

impl ProtectedDataStoreService {
    pub fn new(persistence: Persistence) -> Self {
        let entries: Vec<ProtectedStorageEntry> = persistence.read_or_default(SLOT);
        let map = entries
            .into_iter()
            .map(|e| (e.hash_of_payload(), e))
            .collect();
        Self {
            map: RwLock::new(map),
            persistence,
            persistence_request: PersistenceRequest::default(),
        }
    }

    pub fn put(&self, hash: StorageByteArray, entry: ProtectedStorageEntry) {
        self.map.write().insert(hash, entry);
        self.persistence_request.request();
    }

    pub fn remove(&self, hash: &StorageByteArray) -> Option<ProtectedStorageEntry> {
        let removed = self.map.write().remove(hash);
        if removed.is_some() {
            self.persistence_request.request();
        }
        removed
    }

    pub fn entries(&self) -> Vec<ProtectedStorageEntry> {
        self.map.read().values().cloned().collect()
    }

    pub fn contains(&self, hash: &StorageByteArray) -> bool {
        self.map.read().contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistedStore for ProtectedDataStoreService {
    fn store_name(&self) -> &'static str {
        SLOT
    }

    fn persist_if_requested(&self) -> Result<bool, StorageError> {
        if !self.persistence_request.take() {
            return Ok(false);
        }
        let entries = self.entries();
        self.persistence.write(SLOT, &entries)?;
        Ok(true)
    }
}
