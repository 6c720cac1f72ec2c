//! The waveforms store item.
//!
//! Waveforms are too large to materialize fully, so each cluster stores a
//! representative subsample chosen by the `Selector`, together with the
//! selected spike ids. Partition changes regenerate the added clusters from
//! the source directly: a subsample of a merged cluster cannot be built by
//! recombining the old clusters' subsamples.

use crate::disk::{bytes_from_f32, bytes_from_i64, DiskStore};
use crate::error::{Result, StoreError};
use crate::items::{to_generate, StoreItem};
use crate::memory::{MemoryStore, MemoryValue};
use crate::progress::ProgressReporter;
use crate::schema::{Dim, DiskField, DType, FieldDecl};
use crate::source::{Selector, SpikeSource};
use crate::types::{ClusterId, ClusterUpdate, SpikeId, SpikesPerCluster, StoreMode};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

const FIELDS: &[FieldDecl] = &[
    FieldDecl::disk("waveforms", DType::F32, &[Dim::Records, Dim::Samples, Dim::Channels]),
    FieldDecl::disk("waveforms_spikes", DType::I64, &[Dim::Records]),
    FieldDecl::memory("mean_waveforms"),
];

/// Manages the subsampled waveforms of all clusters.
pub struct Waveforms<S> {
    source: Arc<S>,
    disk: Arc<DiskStore>,
    memory: Arc<MemoryStore>,
    selector: Selector,

    waveforms: DiskField,
    spikes_field: DiskField,

    pr: ProgressReporter,
}

impl<S: SpikeSource> Waveforms<S> {
    pub fn new(
        source: Arc<S>,
        disk: Arc<DiskStore>,
        memory: Arc<MemoryStore>,
        selector: Selector,
    ) -> Result<Self> {
        let geometry = source.geometry();
        let waveforms = FIELDS[0].resolve(&geometry)?;
        let spikes_field = FIELDS[1].resolve(&geometry)?;

        Ok(Self {
            source,
            disk,
            memory,
            selector,
            waveforms,
            spikes_field,
            pr: ProgressReporter::new("waveforms"),
        })
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.pr
    }

    /// Generate one cluster's subsample, overwriting any previous data.
    fn store_cluster(&self, cluster: ClusterId, spikes: &[SpikeId], mode: StoreMode) -> Result<()> {
        if mode == StoreMode::ReadOnly {
            return Err(StoreError::ReadOnlyViolation);
        }

        let selected = self.selector.select(spikes);
        let waveforms = self.source.waveforms(&selected)?;
        let spike_ids: Vec<i64> = selected.iter().map(|s| s.0 as i64).collect();

        self.disk.store(
            cluster,
            &[
                ("waveforms", &bytes_from_f32(&waveforms)),
                ("waveforms_spikes", &bytes_from_i64(&spike_ids)),
            ],
            false,
        )?;

        // Per-sample mean across the subsample.
        let row = self.waveforms.row_elems();
        let n = selected.len();
        let mut mean = vec![0.0f32; row];
        for spike_row in waveforms.chunks_exact(row) {
            for (m, &value) in mean.iter_mut().zip(spike_row) {
                *m += value;
            }
        }
        if n > 0 {
            for m in &mut mean {
                *m /= n as f32;
            }
        }
        self.memory
            .store(cluster, vec![("mean_waveforms", MemoryValue::F32(mean))]);
        Ok(())
    }
}

impl<S: SpikeSource> StoreItem for Waveforms<S> {
    fn name(&self) -> &'static str {
        "waveforms"
    }

    fn fields(&self) -> &'static [FieldDecl] {
        FIELDS
    }

    /// The subsample size is not implied by the membership, so consistency
    /// here is cross-field: both files must agree on the record count.
    fn is_consistent(&self, cluster: ClusterId, _spikes: &[SpikeId]) -> bool {
        let (size_w, size_s) = match (
            self.disk.size(cluster, "waveforms"),
            self.disk.size(cluster, "waveforms_spikes"),
        ) {
            (Some(w), Some(s)) => (w, s),
            _ => return false,
        };

        let row_w = self.waveforms.row_bytes() as u64;
        let row_s = self.spikes_field.row_bytes() as u64;
        if size_w % row_w != 0 || size_s % row_s != 0 {
            return false;
        }
        size_w / row_w == size_s / row_s
    }

    fn store_all_clusters(&self, spc: &SpikesPerCluster, mode: StoreMode) -> Result<()> {
        let pending: BTreeSet<ClusterId> = to_generate(self, spc, mode).into_iter().collect();

        self.pr.set_max(pending.len() as u64);
        for &cluster in &pending {
            debug!(%cluster, "loading waveforms");
            let spikes = spc.get(&cluster).ok_or(StoreError::UnknownCluster(cluster))?;
            self.store_cluster(cluster, spikes, mode)?;
            self.pr.increment();
        }
        self.pr.set_complete();
        Ok(())
    }

    fn on_cluster(&self, update: Option<&ClusterUpdate>) -> Result<()> {
        let up = match update {
            Some(up) if !up.is_replay() => up,
            _ => return Ok(()),
        };

        for &cluster in &up.added {
            let spikes = up
                .new_spikes_per_cluster
                .get(&cluster)
                .ok_or(StoreError::UnknownCluster(cluster))?;
            self.store_cluster(cluster, spikes, StoreMode::Default)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::f32_from_bytes;
    use crate::schema::ModelGeometry;
    use crate::source::InMemorySource;
    use tempfile::TempDir;

    /// 4 spikes, 2 channels, 3 samples; waveform values encode the spike id.
    fn test_source() -> Arc<InMemorySource> {
        let geometry = ModelGeometry {
            n_channels: 2,
            n_features_per_channel: 1,
            n_samples_waveforms: 3,
        };
        let n_spikes = 4;
        let fm_row = 2 * 1 * 2;
        let w_row = 3 * 2;
        let waveforms: Vec<f32> = (0..n_spikes)
            .flat_map(|s| std::iter::repeat(s as f32).take(w_row))
            .collect();
        Arc::new(InMemorySource::new(
            geometry,
            vec![[0.0, 0.0], [1.0, 0.0]],
            vec![0.0; n_spikes * fm_row],
            vec![ClusterId(1), ClusterId(1), ClusterId(2), ClusterId(2)],
            waveforms,
        ))
    }

    fn spikes(ids: &[u64]) -> Vec<SpikeId> {
        ids.iter().copied().map(SpikeId).collect()
    }

    fn test_item(dir: &TempDir) -> Waveforms<InMemorySource> {
        Waveforms::new(
            test_source(),
            Arc::new(DiskStore::new(dir.path().join("waveforms"), 16).unwrap()),
            Arc::new(MemoryStore::new()),
            Selector::new(100, 10),
        )
        .unwrap()
    }

    #[test]
    fn test_store_cluster_and_mean() {
        let dir = TempDir::new().unwrap();
        let item = test_item(&dir);

        item.store_cluster(ClusterId(1), &spikes(&[0, 1]), StoreMode::Default)
            .unwrap();

        let bytes = item.disk.load(ClusterId(1), "waveforms", item.waveforms.row_bytes()).unwrap();
        assert_eq!(f32_from_bytes(&bytes).len(), 2 * 6);

        // Spikes 0 and 1 have constant waveforms 0.0 and 1.0.
        match item.memory.load(ClusterId(1), "mean_waveforms").unwrap() {
            MemoryValue::F32(mean) => assert!(mean.iter().all(|&m| (m - 0.5).abs() < 1e-6)),
            other => panic!("unexpected value: {:?}", other),
        }
    }

    #[test]
    fn test_cross_field_consistency() {
        let dir = TempDir::new().unwrap();
        let item = test_item(&dir);

        item.store_cluster(ClusterId(1), &spikes(&[0, 1]), StoreMode::Default)
            .unwrap();
        assert!(item.is_consistent(ClusterId(1), &[]));

        // Drop one spike id: record counts no longer agree.
        item.disk
            .store(ClusterId(1), &[("waveforms_spikes", &bytes_from_i64(&[0]))], false)
            .unwrap();
        assert!(!item.is_consistent(ClusterId(1), &[]));
    }

    #[test]
    fn test_read_only_store_is_a_contract_violation() {
        let dir = TempDir::new().unwrap();
        let item = test_item(&dir);

        let err = item
            .store_cluster(ClusterId(1), &spikes(&[0]), StoreMode::ReadOnly)
            .unwrap_err();
        assert!(matches!(err, StoreError::ReadOnlyViolation));
    }
}
