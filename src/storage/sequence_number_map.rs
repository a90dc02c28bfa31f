use crate::storage::byte_array::StorageByteArray;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Sequence history survives eviction from the live map for this long.
pub const PURGE_AGE: Duration = Duration::from_secs(10 * 24 * 60 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapValue {
    pub sequence_nr: u32,
    pub time_stamp: i64,
}

/// Last seen sequence number per payload hash.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SequenceNumberMap {
    map: HashMap<StorageByteArray, MapValue>,
}

impl SequenceNumberMap {
    pub fn get(&self, hash: &StorageByteArray) -> Option<&MapValue> {
        self.map.get(hash)
    }

    pub fn put(&mut self, hash: StorageByteArray, sequence_nr: u32, time_stamp: i64) {
        self.map.insert(
            hash,
            MapValue {
                sequence_nr,
                time_stamp,
            },
        );
    }

    pub fn contains_key(&self, hash: &StorageByteArray) -> bool {
        self.map.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drops entries not touched within [`PURGE_AGE`]. Returns how many.
    pub fn purge_older_than(&mut self, now_millis: i64, max_age: Duration) -> usize {
        let min_time_stamp = now_millis - max_age.as_millis() as i64;
        let before = self.map.len();
        self.map.retain(|_, value| value.time_stamp > min_time_stamp);
        before - self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purge_keeps_recent_entries() {
        let day = 24 * 60 * 60 * 1000;
        let now = 100 * day;
        let mut map = SequenceNumberMap::default();
        map.put(StorageByteArray::new(vec![1]), 3, now - 11 * day);
        map.put(StorageByteArray::new(vec![2]), 7, now - day);

        assert_eq!(map.purge_older_than(now, PURGE_AGE), 1);
        assert!(!map.contains_key(&StorageByteArray::new(vec![1])));
        assert_eq!(map.get(&StorageByteArray::new(vec![2])).map(|v| v.sequence_nr), Some(7));
    }
}
