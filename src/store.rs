//! Main ClusterStore struct tying all components together.

use crate::disk::DiskStore;
use crate::error::{Result, StoreError};
use crate::items::{FeatureMasks, StoreItem, Waveforms};
use crate::memory::MemoryStore;
use crate::schema::FieldDecl;
use crate::source::{Selector, SpikeSource};
use crate::types::{ClusterId, ClusterUpdate, SpikeId, SpikesPerCluster, StoreMode};
use fs2::FileExt;
use parking_lot::RwLock;
use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Store configuration. Every option is validated at construction.
#[derive(Clone, Debug)]
pub struct ClusterStoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Spikes per chunk when streaming the source during bulk generation.
    pub chunk_size: usize,

    /// Subsampling budget for the waveforms item.
    pub max_waveforms_per_cluster: usize,

    /// Contiguous excerpt size used by the subsampling selector.
    pub excerpt_size: usize,

    /// Per-item read cache size (number of field arrays).
    pub cache_size: usize,
}

impl Default for ClusterStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./cluster-store"),
            chunk_size: 100_000,
            max_waveforms_per_cluster: 100,
            excerpt_size: 20,
            cache_size: 64,
        }
    }
}

impl ClusterStoreConfig {
    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(StoreError::InvalidConfig("chunk_size must be positive".into()));
        }
        if self.excerpt_size == 0 {
            return Err(StoreError::InvalidConfig("excerpt_size must be positive".into()));
        }
        if self.max_waveforms_per_cluster < self.excerpt_size {
            return Err(StoreError::InvalidConfig(
                "max_waveforms_per_cluster must be at least excerpt_size".into(),
            ));
        }
        if self.cache_size == 0 {
            return Err(StoreError::InvalidConfig("cache_size must be positive".into()));
        }
        Ok(())
    }
}

/// The derived-data cache: per-cluster arrays on disk, statistics in
/// memory, regenerated only when stale and recombined incrementally on
/// partition changes.
pub struct ClusterStore<S> {
    config: ClusterStoreConfig,

    /// Lock file for exclusive access (single logical writer).
    _lock_file: File,

    memory: Arc<MemoryStore>,

    feature_masks: FeatureMasks<S>,
    waveforms: Waveforms<S>,

    /// Current partition: membership of every live cluster.
    spikes_per_cluster: RwLock<SpikesPerCluster>,
}

impl<S: SpikeSource> ClusterStore<S> {
    /// Open or create a store for the given source.
    ///
    /// Builds the spikes-per-cluster map by a chunked scan of the source's
    /// cluster assignments, so memory stays bounded for any source size.
    pub fn open_or_create(config: ClusterStoreConfig, source: Arc<S>) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let memory = Arc::new(MemoryStore::new());
        let feature_masks = FeatureMasks::new(
            Arc::clone(&source),
            Arc::new(DiskStore::new(config.path.join("features_masks"), config.cache_size)?),
            Arc::clone(&memory),
            config.chunk_size,
        )?;
        let waveforms = Waveforms::new(
            Arc::clone(&source),
            Arc::new(DiskStore::new(config.path.join("waveforms"), config.cache_size)?),
            Arc::clone(&memory),
            Selector::new(config.max_waveforms_per_cluster, config.excerpt_size),
        )?;

        let spikes_per_cluster = Self::scan_partition(&*source, config.chunk_size)?;
        info!(
            n_clusters = spikes_per_cluster.len(),
            n_spikes = source.n_spikes(),
            "opened cluster store"
        );

        Ok(Self {
            config,
            _lock_file: lock_file,
            memory,
            feature_masks,
            waveforms,
            spikes_per_cluster: RwLock::new(spikes_per_cluster),
        })
    }

    fn acquire_lock(path: &std::path::Path) -> Result<File> {
        let lock_file = File::create(path.join("lock"))?;
        lock_file.try_lock_exclusive().map_err(|_| StoreError::Locked)?;
        Ok(lock_file)
    }

    /// One chunked pass over the source's cluster assignments.
    fn scan_partition(source: &S, chunk_size: usize) -> Result<SpikesPerCluster> {
        let mut spc = SpikesPerCluster::new();
        let mut a = 0usize;
        loop {
            let assignments = source.spike_clusters(a..a + chunk_size)?;
            if assignments.is_empty() {
                break;
            }
            for (r, &cluster) in assignments.iter().enumerate() {
                spc.entry(cluster).or_default().push(SpikeId((a + r) as u64));
            }
            a += assignments.len();
        }
        Ok(spc)
    }

    fn items(&self) -> [&dyn StoreItem; 2] {
        [&self.feature_masks, &self.waveforms]
    }

    // --- Bulk generation ---

    /// Ensure the store is valid: (re)generate what the mode requires, then
    /// derive statistics.
    pub fn store_all_clusters(&self, mode: StoreMode) -> Result<()> {
        let spc = self.spikes_per_cluster.read();
        info!(?mode, n_clusters = spc.len(), "storing all clusters");
        for item in self.items() {
            item.store_all_clusters(&spc, mode)?;
        }
        Ok(())
    }

    // --- Incremental updates ---

    /// React to a partition-change event.
    ///
    /// Undo/redo replays are a no-op: the data written by the original
    /// forward pass is still on disk and in memory and is reused as-is.
    /// Old clusters' data is retained; pruning it is a separate, explicit
    /// operation.
    pub fn on_cluster(&self, update: Option<&ClusterUpdate>) -> Result<()> {
        for item in self.items() {
            item.on_cluster(update)?;
        }

        if let Some(up) = update.filter(|up| !up.is_replay()) {
            let mut spc = self.spikes_per_cluster.write();
            for old in &up.deleted {
                spc.remove(old);
            }
            for (&new, spikes) in &up.new_spikes_per_cluster {
                spc.insert(new, spikes.clone());
            }
            debug!(
                deleted = up.deleted.len(),
                added = up.added.len(),
                "applied partition change"
            );
        }
        Ok(())
    }

    // --- Queries ---

    /// Spot-check a cluster's persisted data across all items, without
    /// triggering generation.
    pub fn is_consistent(&self, cluster: ClusterId) -> Result<bool> {
        let spc = self.spikes_per_cluster.read();
        let spikes = spc.get(&cluster).ok_or(StoreError::UnknownCluster(cluster))?;
        Ok(self.items().iter().all(|item| item.is_consistent(cluster, spikes)))
    }

    /// Field schema per item, for the driver to know what is available.
    pub fn fields(&self) -> Vec<(&'static str, &'static [FieldDecl])> {
        self.items()
            .iter()
            .map(|item| (item.name(), item.fields()))
            .collect()
    }

    /// Ids of the current partition's clusters, ascending.
    pub fn cluster_ids(&self) -> Vec<ClusterId> {
        self.spikes_per_cluster.read().keys().copied().collect()
    }

    /// Membership of one cluster, ascending.
    pub fn spikes_per_cluster(&self, cluster: ClusterId) -> Result<Vec<SpikeId>> {
        self.spikes_per_cluster
            .read()
            .get(&cluster)
            .cloned()
            .ok_or(StoreError::UnknownCluster(cluster))
    }

    /// The features-and-masks item (progress handles, diagnostics).
    pub fn feature_masks(&self) -> &FeatureMasks<S> {
        &self.feature_masks
    }

    /// The waveforms item.
    pub fn waveforms(&self) -> &Waveforms<S> {
        &self.waveforms
    }

    /// The in-memory statistics layer.
    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// The store's configuration.
    pub fn config(&self) -> &ClusterStoreConfig {
        &self.config
    }
}
