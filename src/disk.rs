//! Disk layer: one headerless raw-array file per (cluster, field).
//!
//! Files hold little-endian typed array bytes with no header; the shape is
//! reconstructed externally from the schema's trailing dimensions plus the
//! file size. Byte-size arithmetic is therefore also the consistency-check
//! contract and must stay exact.

use crate::error::{Result, StoreError};
use crate::types::ClusterId;
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Cache key: (cluster, field name).
type FieldKey = (ClusterId, String);

/// Key-value byte store keyed by (cluster id, field name).
pub struct DiskStore {
    /// Base directory for this item's namespace.
    path: PathBuf,

    /// LRU cache for recently loaded field bytes.
    cache: Mutex<LruCache<FieldKey, Arc<Vec<u8>>>>,
}

impl DiskStore {
    /// Create a disk store at the given path.
    pub fn new(path: impl AsRef<Path>, cache_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap();

        Ok(Self {
            path,
            cache: Mutex::new(LruCache::new(cache_size)),
        })
    }

    /// Store one or more named arrays for a cluster.
    ///
    /// With `append = false` the target files are truncated; with
    /// `append = true` bytes are added at the end (the chunked generator's
    /// mode: each append is sequential for a fixed cluster).
    pub fn store(&self, cluster: ClusterId, fields: &[(&str, &[u8])], append: bool) -> Result<()> {
        for &(name, bytes) in fields {
            let path = self.field_path(cluster, name);
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .append(append)
                .truncate(!append)
                .open(&path)?;
            file.write_all(bytes)?;
            file.sync_all()?;

            self.cache.lock().pop(&(cluster, name.to_string()));
        }
        Ok(())
    }

    /// Load a field's bytes, resolving the record count from the file size.
    ///
    /// `row_bytes` is the per-record size from the resolved schema; a file
    /// whose length is not a multiple of it is corrupt (or written under a
    /// different schema) and must not be reshaped by guesswork.
    pub fn load(&self, cluster: ClusterId, field: &str, row_bytes: usize) -> Result<Arc<Vec<u8>>> {
        let key = (cluster, field.to_string());
        if let Some(cached) = self.cache.lock().get(&key) {
            return Self::check_rows(cluster, field, cached.clone(), row_bytes);
        }

        let path = self.field_path(cluster, field);
        if !path.exists() {
            return Err(StoreError::MissingField {
                cluster,
                field: field.to_string(),
            });
        }

        let bytes = Arc::new(fs::read(&path)?);
        self.cache.lock().put(key, bytes.clone());
        Self::check_rows(cluster, field, bytes, row_bytes)
    }

    fn check_rows(
        cluster: ClusterId,
        field: &str,
        bytes: Arc<Vec<u8>>,
        row_bytes: usize,
    ) -> Result<Arc<Vec<u8>>> {
        if row_bytes == 0 || bytes.len() % row_bytes != 0 {
            return Err(StoreError::ShapeMismatch {
                cluster,
                field: field.to_string(),
                len: bytes.len() as u64,
                row_bytes,
            });
        }
        Ok(bytes)
    }

    /// Whether a field file exists for this cluster.
    pub fn exists(&self, cluster: ClusterId, field: &str) -> bool {
        self.field_path(cluster, field).exists()
    }

    /// Persisted size in bytes, by stat only (no read).
    pub fn size(&self, cluster: ClusterId, field: &str) -> Option<u64> {
        fs::metadata(self.field_path(cluster, field))
            .ok()
            .map(|m| m.len())
    }

    /// Remove a field file if present. Used before a fresh append pass.
    pub fn remove(&self, cluster: ClusterId, field: &str) -> Result<bool> {
        self.cache.lock().pop(&(cluster, field.to_string()));

        let path = self.field_path(cluster, field);
        if path.exists() {
            fs::remove_file(&path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Path of the file backing (cluster, field): `<dir>/<cluster>.<field>`.
    fn field_path(&self, cluster: ClusterId, field: &str) -> PathBuf {
        self.path.join(format!("{}.{}", cluster.0, field))
    }
}

// --- Typed conversions (little-endian, matching the on-disk format) ---

/// Reinterpret raw bytes as f32 values.
pub fn f32_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Serialize f32 values as raw bytes.
pub fn bytes_from_f32(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Reinterpret raw bytes as i64 values.
pub fn i64_from_bytes(bytes: &[u8]) -> Vec<i64> {
    bytes
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect()
}

/// Serialize i64 values as raw bytes.
pub fn bytes_from_i64(values: &[i64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::new(dir.path().join("item"), 16).unwrap();

        let values = vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let bytes = bytes_from_f32(&values);
        store
            .store(ClusterId(3), &[("features", &bytes)], false)
            .unwrap();

        let loaded = store.load(ClusterId(3), "features", 8).unwrap();
        assert_eq!(f32_from_bytes(&loaded), values);
        assert_eq!(store.size(ClusterId(3), "features"), Some(24));
    }

    #[test]
    fn test_append_accumulates() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::new(dir.path().join("item"), 16).unwrap();

        store
            .store(ClusterId(1), &[("masks", &bytes_from_f32(&[0.1, 0.2]))], true)
            .unwrap();
        store
            .store(ClusterId(1), &[("masks", &bytes_from_f32(&[0.3]))], true)
            .unwrap();

        let loaded = store.load(ClusterId(1), "masks", 4).unwrap();
        assert_eq!(f32_from_bytes(&loaded), vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_overwrite_truncates() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::new(dir.path().join("item"), 16).unwrap();

        store
            .store(ClusterId(1), &[("masks", &bytes_from_f32(&[0.1, 0.2, 0.3]))], false)
            .unwrap();
        store
            .store(ClusterId(1), &[("masks", &bytes_from_f32(&[0.9]))], false)
            .unwrap();

        let loaded = store.load(ClusterId(1), "masks", 4).unwrap();
        assert_eq!(f32_from_bytes(&loaded), vec![0.9]);
    }

    #[test]
    fn test_missing_field_error() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::new(dir.path().join("item"), 16).unwrap();

        let err = store.load(ClusterId(42), "features", 4).unwrap_err();
        assert!(matches!(err, StoreError::MissingField { .. }));
    }

    #[test]
    fn test_shape_mismatch_error() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::new(dir.path().join("item"), 16).unwrap();

        store
            .store(ClusterId(1), &[("features", &[0u8; 10])], false)
            .unwrap();

        let err = store.load(ClusterId(1), "features", 4).unwrap_err();
        assert!(matches!(err, StoreError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_cache_invalidated_on_write() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::new(dir.path().join("item"), 16).unwrap();

        store
            .store(ClusterId(1), &[("masks", &bytes_from_f32(&[0.1]))], false)
            .unwrap();
        // Warm the cache.
        store.load(ClusterId(1), "masks", 4).unwrap();

        store
            .store(ClusterId(1), &[("masks", &bytes_from_f32(&[0.5]))], true)
            .unwrap();
        let loaded = store.load(ClusterId(1), "masks", 4).unwrap();
        assert_eq!(f32_from_bytes(&loaded), vec![0.1, 0.5]);
    }

    #[test]
    fn test_i64_roundtrip() {
        let values = vec![-5i64, 0, 7, i64::MAX];
        assert_eq!(i64_from_bytes(&bytes_from_i64(&values)), values);
    }
}
