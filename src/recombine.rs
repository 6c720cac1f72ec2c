//! Order-preserving recombination of per-cluster arrays.
//!
//! Every per-cluster disk array is stored in canonical order: ascending
//! global spike index. Merging or re-splitting clusters therefore never
//! rescans the source; it interleaves rows of previously stored arrays so
//! that the result is again in canonical order. Rows are opaque fixed-size
//! byte slices, so the same code serves every field type.

use crate::error::{Result, StoreError};
use crate::types::{ClusterId, SpikeId, SpikesPerCluster};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Positions of each element of `subset` within the ascending list `within`.
///
/// Both inputs are ascending. Implemented as one binary search per subset
/// element; a subset element absent from `within` means the caller's
/// partition-change event is malformed.
pub fn index_of(subset: &[SpikeId], within: &[SpikeId]) -> Result<Vec<usize>> {
    let mut positions = Vec::with_capacity(subset.len());
    for &spike in subset {
        match within.binary_search(&spike) {
            Ok(pos) => positions.push(pos),
            Err(_) => {
                return Err(StoreError::InconsistentUpdate(format!(
                    "spike {} is not in the cluster's stored order",
                    spike
                )))
            }
        }
    }
    Ok(positions)
}

/// Intersection of two ascending spike lists, ascending.
pub fn sorted_intersection(a: &[SpikeId], b: &[SpikeId]) -> Vec<SpikeId> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

/// Interleave per-cluster arrays into one array in canonical spike order.
///
/// `spc` gives each contributing cluster's spikes (ascending, matching the
/// row order of its array in `arrays`); `row_bytes` is the fixed per-record
/// size. This is NOT plain concatenation: rows from different clusters are
/// merged by ascending global spike id.
pub fn concatenate_per_cluster(
    spc: &SpikesPerCluster,
    arrays: &BTreeMap<ClusterId, Arc<Vec<u8>>>,
    row_bytes: usize,
) -> Result<Vec<u8>> {
    let mut total_rows = 0usize;
    for (&cluster, spikes) in spc {
        let array = arrays.get(&cluster).ok_or(StoreError::MissingField {
            cluster,
            field: "<recombination input>".to_string(),
        })?;
        if array.len() != spikes.len() * row_bytes {
            return Err(StoreError::InconsistentUpdate(format!(
                "cluster {}: {} bytes for {} spikes of {} bytes each",
                cluster,
                array.len(),
                spikes.len(),
                row_bytes
            )));
        }
        total_rows += spikes.len();
    }

    // (spike, cluster, row within that cluster's array), merged by spike.
    let mut order: Vec<(SpikeId, ClusterId, usize)> =
        Vec::with_capacity(total_rows);
    for (&cluster, spikes) in spc {
        for (row, &spike) in spikes.iter().enumerate() {
            order.push((spike, cluster, row));
        }
    }
    order.sort_by_key(|&(spike, _, _)| spike);

    let mut out = Vec::with_capacity(total_rows * row_bytes);
    for (_, cluster, row) in order {
        let array = &arrays[&cluster];
        out.extend_from_slice(&array[row * row_bytes..(row + 1) * row_bytes]);
    }
    Ok(out)
}
