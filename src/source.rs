//! The external spike source: the immutable record model the store derives
//! its per-cluster arrays from.
//!
//! The source is only ever read in bounded slices; the store never assumes
//! the full derived array fits in memory.

use crate::error::Result;
use crate::schema::ModelGeometry;
use crate::types::{ClusterId, SpikeId};
use std::ops::Range;

/// Read-only access to the source model.
///
/// `features_masks` rows hold `n_channels * n_features_per_channel`
/// interleaved `(value, mask)` pairs per spike; the per-channel mask is the
/// mask of the channel's first feature slot. `waveforms` rows hold
/// `n_samples_waveforms * n_channels` values per spike.
pub trait SpikeSource {
    fn n_spikes(&self) -> usize;
    fn n_channels(&self) -> usize;
    fn n_features_per_channel(&self) -> usize;
    fn n_samples_waveforms(&self) -> usize;

    /// 2D position of each channel on the probe.
    fn channel_positions(&self) -> &[[f32; 2]];

    /// A slice of the derived feature/mask array for a global spike range.
    ///
    /// May return fewer rows than requested; an empty result signals that
    /// the source is exhausted (normal stream termination, not an error).
    fn features_masks(&self, range: Range<usize>) -> Result<Vec<f32>>;

    /// Current cluster assignment for a global spike range.
    fn spike_clusters(&self, range: Range<usize>) -> Result<Vec<ClusterId>>;

    /// Waveform rows for an explicit set of spikes.
    fn waveforms(&self, spikes: &[SpikeId]) -> Result<Vec<f32>>;

    fn geometry(&self) -> ModelGeometry {
        ModelGeometry {
            n_channels: self.n_channels(),
            n_features_per_channel: self.n_features_per_channel(),
            n_samples_waveforms: self.n_samples_waveforms(),
        }
    }

    /// Elements per `features_masks` row.
    fn features_masks_row_elems(&self) -> usize {
        self.n_channels() * self.n_features_per_channel() * 2
    }

    /// Elements per `waveforms` row.
    fn waveforms_row_elems(&self) -> usize {
        self.n_samples_waveforms() * self.n_channels()
    }
}

/// A source held entirely in memory. Used by tests and small sessions.
pub struct InMemorySource {
    geometry: ModelGeometry,
    channel_positions: Vec<[f32; 2]>,
    features_masks: Vec<f32>,
    spike_clusters: Vec<ClusterId>,
    waveforms: Vec<f32>,
}

impl InMemorySource {
    pub fn new(
        geometry: ModelGeometry,
        channel_positions: Vec<[f32; 2]>,
        features_masks: Vec<f32>,
        spike_clusters: Vec<ClusterId>,
        waveforms: Vec<f32>,
    ) -> Self {
        let row = geometry.n_channels * geometry.n_features_per_channel * 2;
        let n_spikes = spike_clusters.len();
        assert_eq!(channel_positions.len(), geometry.n_channels);
        assert_eq!(features_masks.len(), n_spikes * row);
        assert_eq!(
            waveforms.len(),
            n_spikes * geometry.n_samples_waveforms * geometry.n_channels
        );

        Self {
            geometry,
            channel_positions,
            features_masks,
            spike_clusters,
            waveforms,
        }
    }

    fn clamp(&self, range: Range<usize>) -> Range<usize> {
        let end = range.end.min(self.spike_clusters.len());
        range.start.min(end)..end
    }
}

impl SpikeSource for InMemorySource {
    fn n_spikes(&self) -> usize {
        self.spike_clusters.len()
    }

    fn n_channels(&self) -> usize {
        self.geometry.n_channels
    }

    fn n_features_per_channel(&self) -> usize {
        self.geometry.n_features_per_channel
    }

    fn n_samples_waveforms(&self) -> usize {
        self.geometry.n_samples_waveforms
    }

    fn channel_positions(&self) -> &[[f32; 2]] {
        &self.channel_positions
    }

    fn features_masks(&self, range: Range<usize>) -> Result<Vec<f32>> {
        let range = self.clamp(range);
        let row = self.features_masks_row_elems();
        Ok(self.features_masks[range.start * row..range.end * row].to_vec())
    }

    fn spike_clusters(&self, range: Range<usize>) -> Result<Vec<ClusterId>> {
        let range = self.clamp(range);
        Ok(self.spike_clusters[range].to_vec())
    }

    fn waveforms(&self, spikes: &[SpikeId]) -> Result<Vec<f32>> {
        let row = self.waveforms_row_elems();
        let mut out = Vec::with_capacity(spikes.len() * row);
        for &spike in spikes {
            let i = spike.0 as usize;
            out.extend_from_slice(&self.waveforms[i * row..(i + 1) * row]);
        }
        Ok(out)
    }
}

/// Subsampling selection: a representative subset of a cluster's spikes.
///
/// Items that would be too large to materialize fully (waveforms) store an
/// excerpt-based subsample instead: under budget the whole cluster is kept,
/// otherwise evenly spaced excerpts of `excerpt_size` spikes are taken
/// until `max_spikes` is reached.
pub struct Selector {
    max_spikes: usize,
    excerpt_size: usize,
}

impl Selector {
    pub fn new(max_spikes: usize, excerpt_size: usize) -> Self {
        Self {
            max_spikes,
            excerpt_size,
        }
    }

    /// Select an ascending subset of `spikes` (itself ascending).
    pub fn select(&self, spikes: &[SpikeId]) -> Vec<SpikeId> {
        if spikes.len() <= self.max_spikes {
            return spikes.to_vec();
        }

        let n_excerpts = (self.max_spikes / self.excerpt_size).max(1);
        let mut out = Vec::with_capacity(self.max_spikes);
        let mut prev_end = 0usize;
        for k in 0..n_excerpts {
            let start = (k * spikes.len() / n_excerpts).max(prev_end);
            let end = (start + self.excerpt_size).min(spikes.len());
            out.extend_from_slice(&spikes[start..end]);
            prev_end = end;
        }
        out.truncate(self.max_spikes);
        out
    }
}
