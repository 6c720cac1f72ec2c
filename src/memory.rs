//! Memory layer: small derived values, rebuilt whenever a cluster's disk
//! fields change.

use crate::types::ClusterId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A small in-process value: a count, a float vector, or a channel list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MemoryValue {
    Count(usize),
    F32(Vec<f32>),
    Channels(Vec<usize>),
}

/// Key-value store for per-cluster statistics.
///
/// Values live only for the process lifetime. Each producer writes its
/// fields as one batch so they can never be partially stale; fields stored
/// by other producers for the same cluster are left untouched.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<ClusterId, HashMap<&'static str, MemoryValue>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a batch of fields for a cluster, replacing the named fields
    /// under one lock. Fields outside the batch keep their previous values.
    pub fn store(&self, cluster: ClusterId, fields: Vec<(&'static str, MemoryValue)>) {
        let mut values = self.values.lock();
        values.entry(cluster).or_default().extend(fields);
    }

    /// Load one field for a cluster.
    pub fn load(&self, cluster: ClusterId, field: &str) -> Option<MemoryValue> {
        self.values.lock().get(&cluster)?.get(field).cloned()
    }

    /// Whether any fields are stored for this cluster.
    pub fn contains(&self, cluster: ClusterId) -> bool {
        self.values.lock().contains_key(&cluster)
    }

    /// Drop all fields for a cluster (explicit cleanup only).
    pub fn remove_cluster(&self, cluster: ClusterId) -> bool {
        self.values.lock().remove(&cluster).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_load() {
        let store = MemoryStore::new();
        store.store(
            ClusterId(1),
            vec![
                ("n_unmasked_channels", MemoryValue::Count(3)),
                ("mean_masks", MemoryValue::F32(vec![0.5, 0.6])),
            ],
        );

        assert_eq!(
            store.load(ClusterId(1), "n_unmasked_channels"),
            Some(MemoryValue::Count(3))
        );
        assert_eq!(store.load(ClusterId(1), "missing"), None);
        assert_eq!(store.load(ClusterId(2), "mean_masks"), None);
    }

    #[test]
    fn test_batch_overwrites_only_its_own_fields() {
        let store = MemoryStore::new();
        store.store(
            ClusterId(1),
            vec![("a", MemoryValue::Count(1)), ("b", MemoryValue::Count(2))],
        );
        store.store(ClusterId(1), vec![("a", MemoryValue::Count(3))]);

        assert_eq!(store.load(ClusterId(1), "a"), Some(MemoryValue::Count(3)));
        assert_eq!(store.load(ClusterId(1), "b"), Some(MemoryValue::Count(2)));
    }

    #[test]
    fn test_batches_from_different_producers_coexist() {
        // Two items derive statistics for the same cluster; the second
        // batch must not erase the first.
        let store = MemoryStore::new();
        store.store(
            ClusterId(1),
            vec![
                ("n_unmasked_channels", MemoryValue::Count(2)),
                ("mean_masks", MemoryValue::F32(vec![0.2, 0.8])),
            ],
        );
        store.store(
            ClusterId(1),
            vec![("mean_waveforms", MemoryValue::F32(vec![0.0; 4]))],
        );

        assert_eq!(
            store.load(ClusterId(1), "n_unmasked_channels"),
            Some(MemoryValue::Count(2))
        );
        assert!(store.load(ClusterId(1), "mean_masks").is_some());
        assert!(store.load(ClusterId(1), "mean_waveforms").is_some());
    }

    #[test]
    fn test_remove_cluster() {
        let store = MemoryStore::new();
        store.store(ClusterId(1), vec![("a", MemoryValue::Count(1))]);
        assert!(store.remove_cluster(ClusterId(1)));
        assert!(!store.contains(ClusterId(1)));
        assert!(!store.remove_cluster(ClusterId(1)));
    }
}
