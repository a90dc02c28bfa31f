//! Uids of mailbox messages we failed to open.
//!
//! They were sealed for someone else; remembering them means we never try
//! to decrypt them again, not even after a restart.

use crate::clock::SharedClock;
use crate::error::StorageError;
use crate::storage::payload::MAILBOX_TTL_MAX;
use crate::storage::persistence::{PersistedStore, Persistence, PersistenceRequest};
use parking_lot::RwLock;
use std::collections::HashMap;

const SLOT: &str = "ignored_mailbox";

pub struct IgnoredMailboxService {
    creation_by_uid: RwLock<HashMap<String, i64>>,
    persistence: Persistence,
    persistence_request: PersistenceRequest,
}

impl IgnoredMailboxService {
    pub fn new(persistence: Persistence, clock: SharedClock) -> Self {
        let mut map: HashMap<String, i64> = persistence.read_or_default(SLOT);
        let horizon = clock.millis() - MAILBOX_TTL_MAX.as_millis() as i64;
        let before = map.len();
        map.retain(|_, created| *created > horizon);
        let purged = before - map.len();
        let service = Self {
            creation_by_uid: RwLock::new(map),
            persistence,
            persistence_request: PersistenceRequest::default(),
        };
        if purged > 0 {
            tracing::debug!("🧹 Dropped {} stale ignored mailbox uids", purged);
            service.persistence_request.request();
        }
        service
    }

    pub fn is_ignored(&self, uid: &str) -> bool {
        self.creation_by_uid.read().contains_key(uid)
    }

    pub fn ignore(&self, uid: &str, creation_timestamp: i64) {
        self.creation_by_uid
            .write()
            .insert(uid.to_string(), creation_timestamp);
        self.persistence_request.request();
    }

    pub fn len(&self) -> usize {
        self.creation_by_uid.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistedStore for IgnoredMailboxService {
    fn store_name(&self) -> &'static str {
        SLOT
    }

    fn persist_if_requested(&self) -> Result<bool, StorageError> {
        if !self.persistence_request.take() {
            return Ok(false);
        }
        let snapshot = self.creation_by_uid.read().clone();
        self.persistence.write(SLOT, &snapshot)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_ignored_uids_expire_after_max_ttl() {
        let persistence = Persistence::in_memory();
        let clock = Arc::new(ManualClock::new(100 * 24 * 60 * 60 * 1000));
        let service = IgnoredMailboxService::new(persistence.clone(), clock.clone());
        service.ignore("not-for-us", clock.millis());
        service.persist_if_requested().unwrap();

        clock.advance(Duration::from_secs(24 * 60 * 60));
        let reloaded = IgnoredMailboxService::new(persistence.clone(), clock.clone());
        assert!(reloaded.is_ignored("not-for-us"));

        clock.advance(MAILBOX_TTL_MAX);
        let reloaded = IgnoredMailboxService::new(persistence, clock);
        assert!(reloaded.is_empty());
    }
}
