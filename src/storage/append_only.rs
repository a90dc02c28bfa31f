//! Append-only stores for persistable network payloads, one per kind.
//!
//! Entries are never mutated. The only removal path is the explicit
//! `purge_old_entries` admin call.

use crate::error::StorageError;
use crate::storage::byte_array::StorageByteArray;
use crate::storage::payload::{PersistableKind, PersistableNetworkPayload};
use crate::storage::persistence::{PersistedStore, Persistence, PersistenceRequest};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

const HISTORICAL_SLOT_PREFIX: &str = "historical_";

/// Dotted numeric release version (`1.9.12`), compared numerically.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReleaseVersion(Vec<u32>);

impl ReleaseVersion {
    /// Non-numeric components parse as zero so a garbage version from a
    /// peer sorts before every real release. Trailing zeros are dropped so
    /// `1.9` and `1.9.0` are the same version.
    pub fn parse(version: &str) -> Self {
        let mut parts: Vec<u32> = version
            .trim()
            .split('.')
            .map(|part| part.parse::<u32>().unwrap_or(0))
            .collect();
        while parts.len() > 1 && parts.last() == Some(&0) {
            parts.pop();
        }
        Self(parts)
    }
}

impl Ord for ReleaseVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for ReleaseVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", parts.join("."))
    }
}

pub type PayloadMap = HashMap<StorageByteArray, PersistableNetworkPayload>;

pub trait AppendOnlyStore: Send + Sync {
    fn kind(&self) -> PersistableKind;

    fn contains(&self, hash: &StorageByteArray) -> bool;

    fn get(&self, hash: &StorageByteArray) -> Option<PersistableNetworkPayload>;

    /// Returns false if the hash was already present.
    fn put(&self, hash: StorageByteArray, payload: PersistableNetworkPayload) -> bool;

    fn remove(&self, hash: &StorageByteArray) -> Option<PersistableNetworkPayload>;

    /// Everything this store knows.
    fn map(&self) -> PayloadMap;

    /// What a peer running `version` does not already ship with.
    fn map_since_version(&self, _version: Option<&ReleaseVersion>) -> PayloadMap {
        self.map()
    }

    /// Keys sent as exclusions in our own data requests.
    fn live_keys(&self) -> Vec<StorageByteArray>;

    fn len(&self) -> usize;

    fn persist_if_requested(&self) -> Result<bool, StorageError>;
}

pub struct MapStore {
    kind: PersistableKind,
    slot: String,
    map: RwLock<PayloadMap>,
    persistence: Persistence,
    persistence_request: PersistenceRequest,
}

impl MapStore {
    pub fn new(kind: PersistableKind, persistence: Persistence) -> Self {
        let slot = format!("store_{}", kind.name());
        let entries: Vec<PersistableNetworkPayload> = persistence.read_or_default(&slot);
        let map = entries.into_iter().map(|p| (p.hash(), p)).collect();
        Self {
            kind,
            slot,
            map: RwLock::new(map),
            persistence,
            persistence_request: PersistenceRequest::default(),
        }
    }
}

impl AppendOnlyStore for MapStore {
    fn kind(&self) -> PersistableKind {
        self.kind
    }

    fn contains(&self, hash: &StorageByteArray) -> bool {
        self.map.read().contains_key(hash)
    }

    fn get(&self, hash: &StorageByteArray) -> Option<PersistableNetworkPayload> {
        self.map.read().get(hash).cloned()
    }

    fn put(&self, hash: StorageByteArray, payload: PersistableNetworkPayload) -> bool {
        let mut map = self.map.write();
        if map.contains_key(&hash) {
            return false;
        }
        map.insert(hash, payload);
        self.persistence_request.request();
        true
    }

    fn remove(&self, hash: &StorageByteArray) -> Option<PersistableNetworkPayload> {
        let removed = self.map.write().remove(hash);
        if removed.is_some() {
            self.persistence_request.request();
        }
        removed
    }

    fn map(&self) -> PayloadMap {
        self.map.read().clone()
    }

    fn live_keys(&self) -> Vec<StorageByteArray> {
        self.map.read().keys().cloned().collect()
    }

    fn len(&self) -> usize {
        self.map.read().len()
    }

    fn persist_if_requested(&self) -> Result<bool, StorageError> {
        if !self.persistence_request.take() {
            return Ok(false);
        }
        let entries: Vec<PersistableNetworkPayload> = self.map.read().values().cloned().collect();
        self.persistence.write(&self.slot, &entries)?;
        Ok(true)
    }
}

/// A live [`MapStore`] plus read-only partitions, one per release that
/// shipped them. Peers never receive partitions their release already
/// contains.
pub struct HistoricalDataStore {
    live: MapStore,
    partitions: RwLock<BTreeMap<ReleaseVersion, PayloadMap>>,
}

impl HistoricalDataStore {
    pub fn new(kind: PersistableKind, persistence: Persistence) -> Self {
        let mut partitions = BTreeMap::new();
        let prefix = Self::partition_slot(kind, "");
        if let Ok(slots) = persistence.slots_with_prefix(&prefix) {
            for slot in slots {
                let version = ReleaseVersion::parse(&slot[prefix.len()..]);
                let entries: Vec<PersistableNetworkPayload> = persistence.read_or_default(&slot);
                let map: PayloadMap = entries.into_iter().map(|p| (p.hash(), p)).collect();
                tracing::debug!("📚 Loaded {} historical {} entries for {}", map.len(), kind.name(), version);
                partitions.insert(version, map);
            }
        }
        Self {
            live: MapStore::new(kind, persistence),
            partitions: RwLock::new(partitions),
        }
    }

    /// Slot name under which a release's partition is stored.
    pub fn partition_slot(kind: PersistableKind, version: &str) -> String {
        format!("{}{}_{}", HISTORICAL_SLOT_PREFIX, kind.name(), version)
    }

    pub fn add_partition(&self, version: ReleaseVersion, payloads: Vec<PersistableNetworkPayload>) {
        let map = payloads.into_iter().map(|p| (p.hash(), p)).collect();
        self.partitions.write().insert(version, map);
    }
}

impl AppendOnlyStore for HistoricalDataStore {
    fn kind(&self) -> PersistableKind {
        self.live.kind()
    }

    fn contains(&self, hash: &StorageByteArray) -> bool {
        self.live.contains(hash) || self.partitions.read().values().any(|p| p.contains_key(hash))
    }

    fn get(&self, hash: &StorageByteArray) -> Option<PersistableNetworkPayload> {
        self.live.get(hash).or_else(|| {
            self.partitions
                .read()
                .values()
                .find_map(|p| p.get(hash).cloned())
        })
    }

    fn put(&self, hash: StorageByteArray, payload: PersistableNetworkPayload) -> bool {
        if self.contains(&hash) {
            return false;
        }
        self.live.put(hash, payload)
    }

    fn remove(&self, hash: &StorageByteArray) -> Option<PersistableNetworkPayload> {
        self.live.remove(hash)
    }

    fn map(&self) -> PayloadMap {
        let mut all = self.live.map();
        for partition in self.partitions.read().values() {
            all.extend(partition.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        all
    }

    fn map_since_version(&self, version: Option<&ReleaseVersion>) -> PayloadMap {
        let Some(version) = version else {
            return self.map();
        };
        let mut result = self.live.map();
        for (partition_version, partition) in self.partitions.read().iter() {
            if partition_version > version {
                result.extend(partition.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        result
    }

    fn live_keys(&self) -> Vec<StorageByteArray> {
        self.live.live_keys()
    }

    fn len(&self) -> usize {
        self.live.len() + self.partitions.read().values().map(|p| p.len()).sum::<usize>()
    }

    fn persist_if_requested(&self) -> Result<bool, StorageError> {
        self.live.persist_if_requested()
    }
}

/// Routes payloads to the store for their kind.
pub struct AppendOnlyDataStoreService {
    stores: BTreeMap<PersistableKind, Box<dyn AppendOnlyStore>>,
}

impl AppendOnlyDataStoreService {
    pub fn new(persistence: Persistence) -> Self {
        let mut stores: BTreeMap<PersistableKind, Box<dyn AppendOnlyStore>> = BTreeMap::new();
        for kind in PersistableKind::ALL {
            let store: Box<dyn AppendOnlyStore> = match kind {
                PersistableKind::TradeStatistics => Box::new(HistoricalDataStore::new(kind, persistence.clone())),
                _ => Box::new(MapStore::new(kind, persistence.clone())),
            };
            stores.insert(kind, store);
        }
        Self { stores }
    }

    pub fn store(&self, kind: PersistableKind) -> Option<&dyn AppendOnlyStore> {
        self.stores.get(&kind).map(|s| s.as_ref())
    }

    pub fn contains(&self, payload: &PersistableNetworkPayload, hash: &StorageByteArray) -> bool {
        self.store(payload.kind()).is_some_and(|s| s.contains(hash))
    }

    pub fn put(&self, hash: StorageByteArray, payload: PersistableNetworkPayload) -> bool {
        match self.store(payload.kind()) {
            Some(store) => store.put(hash, payload),
            None => false,
        }
    }

    pub fn get(&self, hash: &StorageByteArray) -> Option<PersistableNetworkPayload> {
        self.stores.values().find_map(|s| s.get(hash))
    }

    pub fn map(&self) -> PayloadMap {
        let mut all = PayloadMap::new();
        for store in self.stores.values() {
            all.extend(store.map());
        }
        all
    }

    pub fn map_since_version(&self, version: Option<&ReleaseVersion>) -> PayloadMap {
        let mut all = PayloadMap::new();
        for store in self.stores.values() {
            all.extend(store.map_since_version(version));
        }
        all
    }

    pub fn live_keys(&self) -> Vec<StorageByteArray> {
        self.stores.values().flat_map(|s| s.live_keys()).collect()
    }

    pub fn len(&self) -> usize {
        self.stores.values().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes payloads of `kind` dated more than `max_age` before `now`.
    /// Historical partitions are left alone.
    pub fn purge_old_entries(&self, kind: PersistableKind, max_age: Duration, now_millis: i64) -> usize {
        let Some(store) = self.store(kind) else {
            return 0;
        };
        let min_date = now_millis - max_age.as_millis() as i64;
        let stale: Vec<StorageByteArray> = store
            .live_keys()
            .into_iter()
            .filter(|hash| store.get(hash).is_some_and(|p| p.date() < min_date))
            .collect();
        for hash in &stale {
            store.remove(hash);
        }
        if !stale.is_empty() {
            tracing::info!("🧹 Purged {} old {} entries", stale.len(), kind.name());
        }
        stale.len()
    }
}

impl PersistedStore for AppendOnlyDataStoreService {
    fn store_name(&self) -> &'static str {
        "append_only_stores"
    }

    fn persist_if_requested(&self) -> Result<bool, StorageError> {
        let mut written = false;
        for store in self.stores.values() {
            written |= store.persist_if_requested()?;
        }
        Ok(written)
    }
}
