//! Bandwidth-bounded selection of items for a bulk data response.
//!
//! Rules, applied to the candidates the requester does not know yet:
//! 1. every `Mid` item,
//! 2. `Low` items without a date until the byte budget runs out,
//! 3. if budget remains, date-sortable `Low` items per kind, newest first,
//!    capped at the kind's `max_items` and the budget,
//! 4. the list so far capped at `max_entries`,
//! 5. every `High` item, regardless of budget.

use crate::network::wire::MAX_PERMITTED_MESSAGE_SIZE;
use crate::storage::entry::ProtectedStorageEntry;
use crate::storage::payload::{DateSortable, GetDataResponsePriority, PersistableNetworkPayload};
use std::collections::{BTreeMap, BTreeSet};

pub const MAX_ENTRIES: usize = 20_000;

/// A response may fill 60% of the max message size; a quarter of that goes
/// to persistable payloads and the rest to protected entries.
pub fn persistable_payloads_budget() -> usize {
    MAX_PERMITTED_MESSAGE_SIZE * 6 / 10 / 4
}

pub fn protected_entries_budget() -> usize {
    MAX_PERMITTED_MESSAGE_SIZE * 6 / 10 * 3 / 4
}

pub trait TruncationCandidate {
    fn priority(&self) -> GetDataResponsePriority;

    fn date_sortable(&self) -> Option<DateSortable>;

    fn kind_name(&self) -> &'static str;

    fn serialized_size(&self) -> usize;
}

impl TruncationCandidate for ProtectedStorageEntry {
    fn priority(&self) -> GetDataResponsePriority {
        self.payload().priority()
    }

    fn date_sortable(&self) -> Option<DateSortable> {
        None
    }

    fn kind_name(&self) -> &'static str {
        self.payload().kind_name()
    }

    fn serialized_size(&self) -> usize {
        ProtectedStorageEntry::serialized_size(self)
    }
}

impl TruncationCandidate for PersistableNetworkPayload {
    fn priority(&self) -> GetDataResponsePriority {
        PersistableNetworkPayload::priority(self)
    }

    fn date_sortable(&self) -> Option<DateSortable> {
        PersistableNetworkPayload::date_sortable(self)
    }

    fn kind_name(&self) -> &'static str {
        self.kind().name()
    }

    fn serialized_size(&self) -> usize {
        bincode::serialized_size(self).map(|s| s as usize).unwrap_or(0)
    }
}

#[derive(Debug)]
pub struct Truncated<T> {
    pub items: Vec<T>,
    pub was_truncated: bool,
    pub truncated_kinds: BTreeSet<&'static str>,
}

pub fn truncate<T: TruncationCandidate>(candidates: Vec<T>, byte_budget: usize, max_entries: usize) -> Truncated<T> {
    let mut mid = Vec::new();
    let mut low_plain = Vec::new();
    let mut low_sortable: BTreeMap<&'static str, Vec<(DateSortable, T)>> = BTreeMap::new();
    let mut high = Vec::new();
    for item in candidates {
        match (item.priority(), item.date_sortable()) {
            (GetDataResponsePriority::High, _) => high.push(item),
            (GetDataResponsePriority::Mid, _) => mid.push(item),
            (GetDataResponsePriority::Low, None) => low_plain.push(item),
            (GetDataResponsePriority::Low, Some(sortable)) => {
                low_sortable.entry(item.kind_name()).or_default().push((sortable, item))
            }
        }
    }

    let mut truncated_kinds = BTreeSet::new();
    let mut total_size = 0usize;
    let mut exceeded_size_limit = false;
    let mut result = mid;

    for item in low_plain {
        if exceeded_size_limit {
            truncated_kinds.insert(item.kind_name());
            continue;
        }
        total_size += item.serialized_size();
        if total_size > byte_budget {
            exceeded_size_limit = true;
            truncated_kinds.insert(item.kind_name());
            continue;
        }
        result.push(item);
    }

    for (kind, mut items) in low_sortable {
        if exceeded_size_limit {
            truncated_kinds.insert(kind);
            continue;
        }
        items.sort_by(|a, b| b.0.date.cmp(&a.0.date));
        let max_items = items.first().map(|(s, _)| s.max_items).unwrap_or(usize::MAX);
        if items.len() > max_items {
            items.truncate(max_items);
            truncated_kinds.insert(kind);
        }
        for (_, item) in items {
            if exceeded_size_limit {
                break;
            }
            total_size += item.serialized_size();
            if total_size > byte_budget {
                exceeded_size_limit = true;
                truncated_kinds.insert(kind);
                break;
            }
            result.push(item);
        }
    }

    let mut was_truncated = exceeded_size_limit || !truncated_kinds.is_empty();
    if result.len() > max_entries {
        for item in &result[max_entries..] {
            truncated_kinds.insert(item.kind_name());
        }
        result.truncate(max_entries);
        was_truncated = true;
    }

    result.extend(high);
    Truncated {
        items: result,
        was_truncated,
        truncated_kinds,
    }
}
