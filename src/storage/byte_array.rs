use serde::{Deserialize, Serialize};
use std::fmt;

/// Map key for the replicated stores: an immutable hash value.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageByteArray(Vec<u8>);

impl StorageByteArray {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl From<[u8; 32]> for StorageByteArray {
    fn from(hash: [u8; 32]) -> Self {
        Self(hash.to_vec())
    }
}

impl fmt::Debug for StorageByteArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        let short = if hex.len() > 16 { &hex[..16] } else { &hex };
        write!(f, "ByteArray({})", short)
    }
}

impl fmt::Display for StorageByteArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
