//! The features-and-masks store item.
//!
//! Disk fields are generated by streaming the whole source once in
//! fixed-size chunks and appending each chunk's rows to every pending
//! cluster, so within-cluster row order always equals ascending global
//! spike order. Partition changes are handled by recombining previously
//! stored arrays instead of re-streaming the source.

use crate::disk::{bytes_from_f32, f32_from_bytes, DiskStore};
use crate::error::{Result, StoreError};
use crate::items::{to_generate, StoreItem};
use crate::memory::{MemoryStore, MemoryValue};
use crate::progress::ProgressReporter;
use crate::recombine::{concatenate_per_cluster, index_of, sorted_intersection};
use crate::schema::{Dim, DiskField, DType, FieldDecl};
use crate::source::SpikeSource;
use crate::types::{ClusterId, ClusterUpdate, SpikeId, SpikesPerCluster, StoreMode, UpdateKind};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// A channel is unmasked when its mean mask exceeds this cutoff.
const UNMASKED_THRESHOLD: f32 = 0.1;

/// Field schema: two large disk arrays plus derived statistics in memory.
const FIELDS: &[FieldDecl] = &[
    FieldDecl::disk("features", DType::F32, &[Dim::Records, Dim::Channels, Dim::Features]),
    FieldDecl::disk("masks", DType::F32, &[Dim::Records, Dim::Channels]),
    FieldDecl::memory("mean_masks"),
    FieldDecl::memory("sum_masks"),
    FieldDecl::memory("n_unmasked_channels"),
    FieldDecl::memory("main_channels"),
    FieldDecl::memory("mean_probe_position"),
];

/// Manages the features and masks of all clusters.
pub struct FeatureMasks<S> {
    source: Arc<S>,
    disk: Arc<DiskStore>,
    memory: Arc<MemoryStore>,

    /// Spikes per chunk when streaming the source.
    chunk_size: usize,

    features: DiskField,
    masks: DiskField,

    pr_disk: ProgressReporter,
    pr_memory: ProgressReporter,
}

impl<S: SpikeSource> FeatureMasks<S> {
    pub fn new(
        source: Arc<S>,
        disk: Arc<DiskStore>,
        memory: Arc<MemoryStore>,
        chunk_size: usize,
    ) -> Result<Self> {
        let geometry = source.geometry();
        let features = FIELDS[0].resolve(&geometry)?;
        let masks = FIELDS[1].resolve(&geometry)?;

        Ok(Self {
            source,
            disk,
            memory,
            chunk_size,
            features,
            masks,
            pr_disk: ProgressReporter::new("features and masks: disk"),
            pr_memory: ProgressReporter::new("features and masks: statistics"),
        })
    }

    /// Progress over chunks during bulk generation.
    pub fn disk_progress(&self) -> &ProgressReporter {
        &self.pr_disk
    }

    /// Progress over clusters during statistics derivation.
    pub fn memory_progress(&self) -> &ProgressReporter {
        &self.pr_memory
    }

    /// Append one chunk's rows for one cluster to its disk fields.
    ///
    /// `rows` are row indices relative to the chunk, ascending, so the
    /// append preserves canonical order.
    fn append_chunk_rows(&self, cluster: ClusterId, rows: &[usize], chunk: &[f32]) -> Result<()> {
        let nc = self.source.n_channels();
        let nf = self.source.n_features_per_channel();
        let row_elems = self.source.features_masks_row_elems();

        let mut features = Vec::with_capacity(rows.len() * nc * nf);
        let mut masks = Vec::with_capacity(rows.len() * nc);
        for &r in rows {
            let row = &chunk[r * row_elems..(r + 1) * row_elems];
            // Interleaved (value, mask) pairs: features are the values of
            // every slot, the channel mask is the mask of the channel's
            // first feature slot.
            for k in 0..nc * nf {
                features.push(row[2 * k]);
            }
            for c in 0..nc {
                masks.push(row[2 * (c * nf) + 1]);
            }
        }

        self.disk.store(
            cluster,
            &[
                ("features", &bytes_from_f32(&features)),
                ("masks", &bytes_from_f32(&masks)),
            ],
            true,
        )
    }

    /// Derive the in-memory statistics of each cluster from its masks.
    ///
    /// All fields of a cluster are stored as one batch; they are a pure
    /// function of the disk fields and must never be partially stale.
    fn store_extra_fields(&self, clusters: &[ClusterId]) -> Result<()> {
        self.pr_memory.set_max(clusters.len() as u64);

        let nc = self.source.n_channels();
        let positions = self.source.channel_positions();

        for &cluster in clusters {
            let bytes = self.disk.load(cluster, "masks", self.masks.row_bytes())?;
            let masks = f32_from_bytes(&bytes);
            let n = masks.len() / nc;

            let mut sum_masks = vec![0.0f32; nc];
            for row in masks.chunks_exact(nc) {
                for (sum, &value) in sum_masks.iter_mut().zip(row) {
                    *sum += value;
                }
            }
            let mean_masks: Vec<f32> = if n > 0 {
                sum_masks.iter().map(|&s| s / n as f32).collect()
            } else {
                vec![0.0; nc]
            };

            let unmasked: BTreeSet<usize> = (0..nc)
                .filter(|&c| mean_masks[c] > UNMASKED_THRESHOLD)
                .collect();

            // Channel centroid weighted by the mean masks.
            let mut mean_probe_position = vec![0.0f32; 2];
            for (c, pos) in positions.iter().enumerate() {
                mean_probe_position[0] += pos[0] * mean_masks[c];
                mean_probe_position[1] += pos[1] * mean_masks[c];
            }
            mean_probe_position[0] /= nc as f32;
            mean_probe_position[1] /= nc as f32;

            // Channels ranked by mean mask descending, then filtered to the
            // unmasked set (sort first, filter second).
            let mut ranked: Vec<usize> = (0..nc).collect();
            ranked.sort_by(|&a, &b| mean_masks[b].total_cmp(&mean_masks[a]));
            let main_channels: Vec<usize> = ranked
                .into_iter()
                .filter(|c| unmasked.contains(c))
                .collect();

            self.memory.store(
                cluster,
                vec![
                    ("mean_masks", MemoryValue::F32(mean_masks)),
                    ("sum_masks", MemoryValue::F32(sum_masks)),
                    ("n_unmasked_channels", MemoryValue::Count(unmasked.len())),
                    ("main_channels", MemoryValue::Channels(main_channels)),
                    ("mean_probe_position", MemoryValue::F32(mean_probe_position)),
                ],
            );

            self.pr_memory.increment();
        }

        self.pr_memory.set_complete();
        Ok(())
    }

    /// Load one disk field for every cluster in `clusters`.
    fn load_all(
        &self,
        field: &DiskField,
        clusters: &[ClusterId],
    ) -> Result<BTreeMap<ClusterId, Arc<Vec<u8>>>> {
        let mut arrays = BTreeMap::new();
        for &cluster in clusters {
            arrays.insert(cluster, self.disk.load(cluster, field.name, field.row_bytes())?);
        }
        Ok(arrays)
    }

    /// Merge: interleave the deleted clusters' arrays into the single added
    /// cluster, in canonical spike order.
    fn merge(&self, up: &ClusterUpdate) -> Result<()> {
        let new = *up
            .added
            .first()
            .ok_or_else(|| StoreError::InconsistentUpdate("merge with no added cluster".into()))?;

        let mut spc = SpikesPerCluster::new();
        for &old in &up.deleted {
            let spikes = up
                .old_spikes_per_cluster
                .get(&old)
                .ok_or(StoreError::UnknownCluster(old))?;
            spc.insert(old, spikes.clone());
        }

        for field in [&self.features, &self.masks] {
            let arrays = self.load_all(field, &up.deleted)?;
            let concat = concatenate_per_cluster(&spc, &arrays, field.row_bytes())?;
            self.disk.store(new, &[(field.name, &concat)], false)?;
        }
        debug!(new = %new, n_old = up.deleted.len(), "merged cluster arrays");
        Ok(())
    }

    /// Assign: re-split the deleted clusters' arrays and recombine the
    /// pieces into each added cluster.
    fn assign(&self, up: &ClusterUpdate) -> Result<()> {
        for field in [&self.features, &self.masks] {
            let row_bytes = field.row_bytes();
            let old_arrays = self.load_all(field, &up.deleted)?;

            for &new in &up.added {
                let new_spikes = up
                    .new_spikes_per_cluster
                    .get(&new)
                    .ok_or(StoreError::UnknownCluster(new))?;

                let mut spc = SpikesPerCluster::new();
                let mut pieces: BTreeMap<ClusterId, Arc<Vec<u8>>> = BTreeMap::new();
                for &(old, n) in &up.descendants {
                    if n != new {
                        continue;
                    }
                    let old_spikes = up
                        .old_spikes_per_cluster
                        .get(&old)
                        .ok_or(StoreError::UnknownCluster(old))?;

                    // This old cluster's spikes that moved into `new`, and
                    // their positions in the old cluster's stored order.
                    let subset = sorted_intersection(old_spikes, new_spikes);
                    let rel = index_of(&subset, old_spikes)?;

                    let source = &old_arrays[&old];
                    let mut piece = Vec::with_capacity(rel.len() * row_bytes);
                    for &pos in &rel {
                        piece.extend_from_slice(&source[pos * row_bytes..(pos + 1) * row_bytes]);
                    }
                    spc.insert(old, subset);
                    pieces.insert(old, Arc::new(piece));
                }

                let concat = concatenate_per_cluster(&spc, &pieces, row_bytes)?;
                self.disk.store(new, &[(field.name, &concat)], false)?;
            }
        }
        debug!(
            n_old = up.deleted.len(),
            n_new = up.added.len(),
            "reassigned cluster arrays"
        );
        Ok(())
    }
}

impl<S: SpikeSource> StoreItem for FeatureMasks<S> {
    fn name(&self) -> &'static str {
        "features_masks"
    }

    fn fields(&self) -> &'static [FieldDecl] {
        FIELDS
    }

    fn is_consistent(&self, cluster: ClusterId, spikes: &[SpikeId]) -> bool {
        for field in [&self.features, &self.masks] {
            match self.disk.size(cluster, field.name) {
                Some(size) if size == field.expected_bytes(spikes.len()) => {}
                _ => return false,
            }
        }
        true
    }

    fn store_all_clusters(&self, spc: &SpikesPerCluster, mode: StoreMode) -> Result<()> {
        let pending: BTreeSet<ClusterId> = to_generate(self, spc, mode).into_iter().collect();

        if !pending.is_empty() {
            // The chunk loop appends; stale or partial files must go first.
            for &cluster in &pending {
                self.disk.remove(cluster, "features")?;
                self.disk.remove(cluster, "masks")?;
            }

            let n_spikes = self.source.n_spikes();
            let n_chunks = (n_spikes / self.chunk_size + 1) as u64;
            self.pr_disk.set_max(n_chunks);
            debug!(n_pending = pending.len(), n_chunks, "generating disk fields");

            for i in 0..n_chunks as usize {
                let a = i * self.chunk_size;
                let b = (i + 1) * self.chunk_size;

                let chunk = self.source.features_masks(a..b)?;
                if chunk.is_empty() {
                    // Source exhausted: normal stream termination.
                    break;
                }
                let n_rows = chunk.len() / self.source.features_masks_row_elems();
                let assignments = self.source.spike_clusters(a..a + n_rows)?;

                // Rows of this chunk per pending cluster, ascending id order.
                let mut chunk_rows: BTreeMap<ClusterId, Vec<usize>> = BTreeMap::new();
                for (r, &cluster) in assignments.iter().enumerate() {
                    if pending.contains(&cluster) {
                        chunk_rows.entry(cluster).or_default().push(r);
                    }
                }
                for (&cluster, rows) in &chunk_rows {
                    self.append_chunk_rows(cluster, rows, &chunk)?;
                }

                self.pr_disk.increment();
            }
        }
        self.pr_disk.set_complete();

        // Statistics for the full cluster set, not just the regenerated
        // part, so memory fields match whatever is currently on disk.
        let all: Vec<ClusterId> = spc.keys().copied().collect();
        self.store_extra_fields(&all)
    }

    fn on_cluster(&self, update: Option<&ClusterUpdate>) -> Result<()> {
        let up = match update {
            // Undo/redo replays reuse the prior forward pass's data as-is.
            Some(up) if !up.is_replay() => up,
            _ => return Ok(()),
        };

        match up.kind {
            UpdateKind::Merge => self.merge(up)?,
            UpdateKind::Assign => self.assign(up)?,
        }

        // Statistics only for the newly created clusters.
        self.store_extra_fields(&up.added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ModelGeometry;
    use crate::source::InMemorySource;
    use tempfile::TempDir;

    fn test_source(assignments: &[u32]) -> Arc<InMemorySource> {
        let geometry = ModelGeometry {
            n_channels: 2,
            n_features_per_channel: 1,
            n_samples_waveforms: 1,
        };
        let n_spikes = assignments.len();
        Arc::new(InMemorySource::new(
            geometry,
            vec![[0.0, 0.0], [1.0, 0.0]],
            vec![0.5; n_spikes * 4],
            assignments.iter().map(|&c| ClusterId(c)).collect(),
            vec![0.0; n_spikes * 2],
        ))
    }

    fn test_item(dir: &TempDir, assignments: &[u32]) -> FeatureMasks<InMemorySource> {
        FeatureMasks::new(
            test_source(assignments),
            Arc::new(DiskStore::new(dir.path().join("features_masks"), 16).unwrap()),
            Arc::new(MemoryStore::new()),
            3,
        )
        .unwrap()
    }

    fn partition(assignments: &[u32]) -> SpikesPerCluster {
        let mut spc = SpikesPerCluster::new();
        for (s, &c) in assignments.iter().enumerate() {
            spc.entry(ClusterId(c)).or_default().push(SpikeId(s as u64));
        }
        spc
    }

    #[test]
    fn test_to_generate_modes() {
        let dir = TempDir::new().unwrap();
        let assignments = [1u32, 2, 1, 2, 1];
        let item = test_item(&dir, &assignments);
        let spc = partition(&assignments);

        // Nothing stored yet: everything is pending in default mode.
        assert_eq!(
            to_generate(&item, &spc, StoreMode::Default),
            vec![ClusterId(1), ClusterId(2)]
        );
        assert!(to_generate(&item, &spc, StoreMode::ReadOnly).is_empty());

        item.store_all_clusters(&spc, StoreMode::Default).unwrap();

        // Consistent clusters are skipped; force takes them all anyway.
        assert!(to_generate(&item, &spc, StoreMode::Default).is_empty());
        assert_eq!(
            to_generate(&item, &spc, StoreMode::Force),
            vec![ClusterId(1), ClusterId(2)]
        );
    }

    #[test]
    fn test_read_only_pass_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let assignments = [1u32, 2, 1];
        let item = test_item(&dir, &assignments);
        let spc = partition(&assignments);

        item.store_all_clusters(&spc, StoreMode::Default).unwrap();

        // Truncate cluster 1's masks to a single record.
        item.disk
            .store(ClusterId(1), &[("masks", &bytes_from_f32(&[0.9, 0.9]))], false)
            .unwrap();
        let truncated = item.disk.size(ClusterId(1), "masks");

        // Read-only serves the inconsistent data as final: no regeneration.
        item.store_all_clusters(&spc, StoreMode::ReadOnly).unwrap();
        assert!(!item.is_consistent(ClusterId(1), &spc[&ClusterId(1)]));
        assert_eq!(item.disk.size(ClusterId(1), "masks"), truncated);
    }

    #[test]
    fn test_consistency_tracks_membership() {
        let dir = TempDir::new().unwrap();
        let assignments = [1u32, 1, 1];
        let item = test_item(&dir, &assignments);
        let spc = partition(&assignments);

        item.store_all_clusters(&spc, StoreMode::Default).unwrap();
        let spikes = &spc[&ClusterId(1)];
        assert!(item.is_consistent(ClusterId(1), spikes));

        // The same files are stale for a different membership size.
        assert!(!item.is_consistent(ClusterId(1), &spikes[..2]));
        assert!(!item.is_consistent(ClusterId(9), spikes));
    }
}
