//! Core types for the cluster store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Unique identifier for a cluster (a group of spikes).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterId(pub u32);

impl fmt::Debug for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClusterId({})", self.0)
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Global index of a spike in the source model.
///
/// Spikes are immutable; their global ascending order is the canonical
/// record order for every per-cluster array.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpikeId(pub u64);

impl fmt::Debug for SpikeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpikeId({})", self.0)
    }
}

impl fmt::Display for SpikeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Spike membership per cluster, each list in ascending spike order.
pub type SpikesPerCluster = BTreeMap<ClusterId, Vec<SpikeId>>;

/// How `store_all_clusters` decides which clusters to (re)generate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreMode {
    /// Regenerate only missing or inconsistent clusters.
    Default,

    /// Regenerate every known cluster unconditionally.
    Force,

    /// Never write; serve whatever is on disk as final.
    ReadOnly,
}

impl Default for StoreMode {
    fn default() -> Self {
        StoreMode::Default
    }
}

/// Marks a partition-change event as an undo/redo replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryKind {
    Undo,
    Redo,
}

/// Discriminator for a partition-change event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateKind {
    /// Exactly one new cluster absorbing two or more old ones.
    Merge,

    /// Arbitrary many-to-many reassignment (split, move, ...).
    Assign,
}

/// A partition-change event: the transition from an old clustering to a
/// new one.
///
/// Old clusters' data is never deleted by an update; it stays on disk and
/// in memory so that a later undo/redo replay can reuse it as-is.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterUpdate {
    pub kind: UpdateKind,

    /// Old cluster ids removed from the partition.
    pub deleted: Vec<ClusterId>,

    /// New cluster ids added to the partition.
    pub added: Vec<ClusterId>,

    /// (old, new) pairs: which old clusters contributed spikes to which
    /// new cluster.
    pub descendants: Vec<(ClusterId, ClusterId)>,

    /// Membership of the deleted clusters before the change.
    pub old_spikes_per_cluster: SpikesPerCluster,

    /// Membership of the added clusters after the change.
    pub new_spikes_per_cluster: SpikesPerCluster,

    /// `Some` when this event is an undo/redo replay of a past change.
    pub history: Option<HistoryKind>,
}

impl ClusterUpdate {
    /// Build a merge event: `old` clusters collapse into `new`.
    ///
    /// The new cluster's membership is the ascending union of the old
    /// clusters' spikes.
    pub fn merge(old: SpikesPerCluster, new: ClusterId) -> Self {
        let deleted: Vec<ClusterId> = old.keys().copied().collect();
        let descendants = deleted.iter().map(|&o| (o, new)).collect();

        let mut union: Vec<SpikeId> = old.values().flatten().copied().collect();
        union.sort_unstable();

        let mut new_spc = SpikesPerCluster::new();
        new_spc.insert(new, union);

        Self {
            kind: UpdateKind::Merge,
            deleted,
            added: vec![new],
            descendants,
            old_spikes_per_cluster: old,
            new_spikes_per_cluster: new_spc,
            history: None,
        }
    }

    /// Build an assign event from old and new memberships.
    ///
    /// The descendant relation is derived from spike overlap between old
    /// and new clusters.
    pub fn assign(old: SpikesPerCluster, new: SpikesPerCluster) -> Self {
        let mut descendants = Vec::new();
        for (&o, old_spikes) in &old {
            for (&n, new_spikes) in &new {
                if !crate::recombine::sorted_intersection(old_spikes, new_spikes).is_empty() {
                    descendants.push((o, n));
                }
            }
        }

        Self {
            kind: UpdateKind::Assign,
            deleted: old.keys().copied().collect(),
            added: new.keys().copied().collect(),
            descendants,
            old_spikes_per_cluster: old,
            new_spikes_per_cluster: new,
            history: None,
        }
    }

    /// Mark this event as an undo/redo replay.
    pub fn with_history(mut self, history: HistoryKind) -> Self {
        self.history = Some(history);
        self
    }

    /// True when the store must not touch any data for this event.
    pub fn is_replay(&self) -> bool {
        self.history.is_some()
    }
}
