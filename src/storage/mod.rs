pub mod append_only;
pub mod byte_array;
pub mod entry;
pub mod p2p_data_storage;
pub mod payload;
pub mod persistence;
pub mod protected_store;
pub mod removed_payloads;
pub mod sequence_number_map;
pub mod truncation;

pub use byte_array::StorageByteArray;
pub use entry::ProtectedStorageEntry;
pub use p2p_data_storage::{
    AppendOnlyDataStoreListener, HashMapChangedListener, P2PDataStorage, P2PDataStorageConfig,
};
pub use payload::{PersistableNetworkPayload, ProtectedStoragePayload};
pub use persistence::{PersistenceManager, Persistence};
