//! Hashes of add-once payloads that were removed.
//!
//! Survives restarts so a removed mailbox message cannot be re-added by a
//! peer that still holds an old copy.

use crate::clock::SharedClock;
use crate::error::StorageError;
use crate::storage::byte_array::StorageByteArray;
use crate::storage::payload::MAILBOX_TTL_MAX;
use crate::storage::persistence::{PersistedStore, Persistence, PersistenceRequest};
use parking_lot::RwLock;
use std::collections::HashMap;

const SLOT: &str = "removed_payloads";

pub struct RemovedPayloadsService {
    removed_at_by_hash: RwLock<HashMap<StorageByteArray, i64>>,
    persistence: Persistence,
    persistence_request: PersistenceRequest,
    clock: SharedClock,
}

impl RemovedPayloadsService {
    /// Loads the persisted set, dropping hashes older than the longest
    /// possible mailbox lifetime (those payloads are expired anyway).
    pub fn new(persistence: Persistence, clock: SharedClock) -> Self {
        let mut map: HashMap<StorageByteArray, i64> = persistence.read_or_default(SLOT);
        let horizon = clock.millis() - MAILBOX_TTL_MAX.as_millis() as i64;
        let before = map.len();
        map.retain(|_, removed_at| *removed_at > horizon);
        let service = Self {
            removed_at_by_hash: RwLock::new(map),
            persistence,
            persistence_request: PersistenceRequest::default(),
            clock,
        };
        if before != service.removed_at_by_hash.read().len() {
            service.persistence_request.request();
        }
        service
    }

    pub fn was_removed(&self, hash: &StorageByteArray) -> bool {
        self.removed_at_by_hash.read().contains_key(hash)
    }

    pub fn add_hash(&self, hash: StorageByteArray) {
        self.removed_at_by_hash
            .write()
            .insert(hash, self.clock.millis());
        self.persistence_request.request();
    }

    pub fn len(&self) -> usize {
        self.removed_at_by_hash.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistedStore for RemovedPayloadsService {
    fn store_name(&self) -> &'static str {
        SLOT
    }

    fn persist_if_requested(&self) -> Result<bool, StorageError> {
        if !self.persistence_request.take() {
            return Ok(false);
        }
        let snapshot = self.removed_at_by_hash.read().clone();
        self.persistence.write(SLOT, &snapshot)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_removed_hashes_survive_reload_until_horizon() {
        let persistence = Persistence::in_memory();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let service = RemovedPayloadsService::new(persistence.clone(), clock.clone());
        let hash = StorageByteArray::new(vec![7u8; 32]);
        service.add_hash(hash.clone());
        assert!(service.persist_if_requested().unwrap());

        let reloaded = RemovedPayloadsService::new(persistence.clone(), clock.clone());
        assert!(reloaded.was_removed(&hash));

        clock.advance(MAILBOX_TTL_MAX + Duration::from_secs(1));
        let expired = RemovedPayloadsService::new(persistence, clock);
        assert!(!expired.was_removed(&hash));
    }
}
