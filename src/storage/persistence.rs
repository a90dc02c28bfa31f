//! Named whole-value slots on disk.
//!
//! Each stateful service owns one or more slots and asks for a write with
//! [`PersistenceRequest::request`]; the [`PersistenceManager`] flushes
//! requested writes every few seconds and once more on shutdown.

use crate::error::StorageError;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

pub trait SlotStore: Send + Sync {
    fn read_slot(&self, slot: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn write_slot(&self, slot: &str, bytes: Vec<u8>) -> Result<(), StorageError>;
    fn remove_slot(&self, slot: &str) -> Result<(), StorageError>;
    fn slots_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
    fn flush(&self) -> Result<(), StorageError>;
}

#[derive(Default)]
pub struct InMemorySlotStore {
    slots: RwLock<HashMap<String, Vec<u8>>>,
}

impl SlotStore for InMemorySlotStore {
    fn read_slot(&self, slot: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.slots.read().get(slot).cloned())
    }

    fn write_slot(&self, slot: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.slots.write().insert(slot.to_string(), bytes);
        Ok(())
    }

    fn remove_slot(&self, slot: &str) -> Result<(), StorageError> {
        self.slots.write().remove(slot);
        Ok(())
    }

    fn slots_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .slots
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

pub struct SledSlotStore {
    db: sled::Db,
}

impl SledSlotStore {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::DatabaseOpen {
            name: path.display().to_string(),
            source: e,
        })?;
        Ok(Self { db })
    }
}

impl SlotStore for SledSlotStore {
    fn read_slot(&self, slot: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(slot.as_bytes())?.map(|v| v.to_vec()))
    }

    fn write_slot(&self, slot: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.db.insert(slot.as_bytes(), bytes)?;
        Ok(())
    }

    fn remove_slot(&self, slot: &str) -> Result<(), StorageError> {
        self.db.remove(slot.as_bytes())?;
        Ok(())
    }

    fn slots_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.db
            .scan_prefix(prefix.as_bytes())
            .keys()
            .map(|key| {
                let key = key?;
                Ok(String::from_utf8_lossy(&key).into_owned())
            })
            .collect()
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Typed access to a slot store. Cheap to clone.
#[derive(Clone)]
pub struct Persistence {
    store: Arc<dyn SlotStore>,
}

impl Persistence {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        Ok(Self {
            store: Arc::new(SledSlotStore::open(path)?),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemorySlotStore::default()),
        }
    }

    pub fn read<T: DeserializeOwned>(&self, slot: &str) -> Result<Option<T>, StorageError> {
        match self.store.read_slot(slot)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Like [`read`](Self::read) but a corrupt slot is logged and treated as
    /// empty, so one bad file never prevents startup.
    pub fn read_or_default<T: DeserializeOwned + Default>(&self, slot: &str) -> T {
        match self.read(slot) {
            Ok(Some(value)) => value,
            Ok(None) => T::default(),
            Err(e) => {
                tracing::warn!("⚠️ Could not read persisted {}: {}", slot, e);
                T::default()
            }
        }
    }

    pub fn write<T: Serialize + ?Sized>(&self, slot: &str, value: &T) -> Result<(), StorageError> {
        let bytes = bincode::serialize(value)?;
        self.store.write_slot(slot, bytes)
    }

    pub fn remove(&self, slot: &str) -> Result<(), StorageError> {
        self.store.remove_slot(slot)
    }

    pub fn remove_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        let slots = self.store.slots_with_prefix(prefix)?;
        for slot in &slots {
            self.store.remove_slot(slot)?;
        }
        Ok(slots.len())
    }

    pub fn slots_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.store.slots_with_prefix(prefix)
    }

    pub fn contains(&self, slot: &str) -> Result<bool, StorageError> {
        Ok(self.store.read_slot(slot)?.is_some())
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.store.flush()
    }
}

/// Dirty flag a service sets when its persisted state changed.
#[derive(Default)]
pub struct PersistenceRequest(AtomicBool);

impl PersistenceRequest {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Clears the flag and reports whether a write was pending.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub trait PersistedStore: Send + Sync {
    fn store_name(&self) -> &'static str;

    /// Writes the current state if a write was requested. Returns whether
    /// anything was written.
    fn persist_if_requested(&self) -> Result<bool, StorageError>;
}

pub struct PersistenceManager {
    persistence: Persistence,
    stores: RwLock<Vec<Arc<dyn PersistedStore>>>,
}

impl PersistenceManager {
    pub fn new(persistence: Persistence) -> Arc<Self> {
        Arc::new(Self {
            persistence,
            stores: RwLock::new(Vec::new()),
        })
    }

    pub fn register(&self, store: Arc<dyn PersistedStore>) {
        self.stores.write().push(store);
    }

    pub fn flush_all(&self) -> Result<usize, StorageError> {
        let stores = self.stores.read().clone();
        let mut written = 0;
        for store in stores {
            match store.persist_if_requested() {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("❌ Persisting {} failed: {}", store.store_name(), e);
                }
            }
        }
        if written > 0 {
            self.persistence.flush()?;
        }
        Ok(written)
    }

    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = manager.flush_all() {
                            tracing::error!("❌ Flushing persisted state failed: {}", e);
                        }
                    }
                }
            }
            match manager.flush_all() {
                Ok(n) => tracing::info!("💾 Final flush wrote {} stores", n),
                Err(e) => tracing::error!("❌ Final flush failed: {}", e),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sled_slots_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let persistence = Persistence::open(dir.path()).unwrap();
            persistence.write("numbers", &vec![1u32, 2, 3]).unwrap();
            persistence.flush().unwrap();
        }
        let persistence = Persistence::open(dir.path()).unwrap();
        let numbers: Option<Vec<u32>> = persistence.read("numbers").unwrap();
        assert_eq!(numbers, Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_remove_prefix() {
        let persistence = Persistence::in_memory();
        persistence.write("dao_state_hashes", &1u8).unwrap();
        persistence.write("dao_blocks", &2u8).unwrap();
        persistence.write("sequence_numbers", &3u8).unwrap();

        assert_eq!(persistence.remove_prefix("dao_").unwrap(), 2);
        assert!(!persistence.contains("dao_blocks").unwrap());
        assert!(persistence.contains("sequence_numbers").unwrap());
    }

    #[test]
    fn test_corrupt_slot_reads_as_default() {
        let persistence = Persistence::in_memory();
        persistence.write("numbers", &"not a vec").unwrap();
        let numbers: Vec<u64> = persistence.read_or_default("numbers");
        assert!(numbers.is_empty());
    }

    #[test]
    fn test_persistence_request_flag() {
        let request = PersistenceRequest::default();
        assert!(!request.take());
        request.request();
        assert!(request.is_requested());
        assert!(request.take());
        assert!(!request.take());
    }
}
