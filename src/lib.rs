//! # Cluster Store
//!
//! A derived-data cache for clustered event data. Source records (spikes)
//! are immutable and live in an external model; clusters are a mutable
//! partition of them. Recomputing per-cluster arrays means streaming the
//! whole source, so the store materializes them exactly once, persists the
//! large ones as headerless raw files, keeps small statistics in memory,
//! detects stale or corrupt data by byte-exact size checks, and reacts to
//! merges and splits by recombining previously stored arrays in canonical
//! spike order instead of rescanning the source.
//!
//! ## Core Concepts
//!
//! - **Disk fields**: large per-cluster arrays, one raw file per
//!   (cluster, field), appended chunk by chunk during bulk generation
//! - **Memory fields**: small statistics, recomputed as a unit whenever a
//!   cluster's disk fields change
//! - **Partition changes**: merge and assign events rebuild only the added
//!   clusters; undo/redo replays are no-ops
//!
//! ## Example
//!
//! ```ignore
//! use cluster_store::{ClusterStore, ClusterStoreConfig, StoreMode};
//!
//! let store = ClusterStore::open_or_create(
//!     ClusterStoreConfig {
//!         path: "./my-store".into(),
//!         chunk_size: 100_000,
//!         ..Default::default()
//!     },
//!     source,
//! )?;
//!
//! // Generate missing or inconsistent clusters, then derive statistics.
//! store.store_all_clusters(StoreMode::Default)?;
//!
//! // React to a merge without re-streaming the source.
//! store.on_cluster(Some(&update))?;
//! ```

pub mod disk;
pub mod error;
pub mod items;
pub mod memory;
pub mod progress;
pub mod recombine;
pub mod schema;
pub mod source;
pub mod store;
pub mod types;

// Re-exports
pub use disk::DiskStore;
pub use error::{Result, StoreError};
pub use items::{FeatureMasks, StoreItem, Waveforms};
pub use memory::{MemoryStore, MemoryValue};
pub use progress::{ProgressEvent, ProgressReporter};
pub use schema::{Dim, DiskField, DType, FieldDecl, FieldStorage, ModelGeometry};
pub use source::{InMemorySource, Selector, SpikeSource};
pub use store::{ClusterStore, ClusterStoreConfig};
pub use types::*;
