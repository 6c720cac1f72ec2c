//! Store items: each item owns a set of derived fields and knows how to
//! generate, verify, and incrementally update them.

pub mod feature_masks;
pub mod waveforms;

pub use feature_masks::FeatureMasks;
pub use waveforms::Waveforms;

use crate::error::Result;
use crate::schema::FieldDecl;
use crate::types::{ClusterId, ClusterUpdate, SpikeId, SpikesPerCluster, StoreMode};

/// Common contract of a store item.
pub trait StoreItem {
    /// Human-readable item name, also its on-disk namespace.
    fn name(&self) -> &'static str;

    /// Field declarations, for the driver to know what is available.
    fn fields(&self) -> &'static [FieldDecl];

    /// Whether the persisted disk fields match the sizes implied by the
    /// cluster's current membership. Stat-only, no reads.
    fn is_consistent(&self, cluster: ClusterId, spikes: &[SpikeId]) -> bool;

    /// Bulk (re)generation entry point.
    fn store_all_clusters(&self, spc: &SpikesPerCluster, mode: StoreMode) -> Result<()>;

    /// Incremental entry point, invoked after every partition-change event.
    fn on_cluster(&self, update: Option<&ClusterUpdate>) -> Result<()>;
}

/// Which clusters need (re)generation under the given mode.
pub(crate) fn to_generate(
    item: &dyn StoreItem,
    spc: &SpikesPerCluster,
    mode: StoreMode,
) -> Vec<ClusterId> {
    match mode {
        StoreMode::ReadOnly => Vec::new(),
        StoreMode::Force => spc.keys().copied().collect(),
        StoreMode::Default => spc
            .iter()
            .filter(|(&cluster, spikes)| !item.is_consistent(cluster, spikes))
            .map(|(&cluster, _)| cluster)
            .collect(),
    }
}
