//! Field schema: static declarations resolved once at store construction.
//!
//! Each store item declares its fields statically, with symbolic trailing
//! dimensions (channel count, feature count, ...) that are resolved into
//! concrete sizes from the source model's geometry when the store is built.
//! Shapes are never resolved lazily per call.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};

/// Element type of a disk field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    F32,
    I64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::I64 => 8,
        }
    }
}

/// Storage class of a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldStorage {
    /// Large persisted array, one raw file per cluster.
    Disk,

    /// Small in-process value, recomputed as a unit.
    Memory,
}

/// Symbolic dimension in a field's shape template.
///
/// `Records` is the `-1` leading placeholder: the record count, resolved
/// from file size at load time. All other dimensions must be concrete
/// before generation begins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dim {
    Records,
    Channels,
    Features,
    Samples,
    Fixed(usize),
}

/// Geometry read once from the source model, used to resolve templates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelGeometry {
    pub n_channels: usize,
    pub n_features_per_channel: usize,
    pub n_samples_waveforms: usize,
}

/// Static field declaration, per store item.
#[derive(Clone, Copy, Debug)]
pub struct FieldDecl {
    pub name: &'static str,
    pub storage: FieldStorage,
    pub dtype: DType,
    pub dims: &'static [Dim],
}

impl FieldDecl {
    pub const fn disk(name: &'static str, dtype: DType, dims: &'static [Dim]) -> Self {
        Self {
            name,
            storage: FieldStorage::Disk,
            dtype,
            dims,
        }
    }

    pub const fn memory(name: &'static str) -> Self {
        Self {
            name,
            storage: FieldStorage::Memory,
            dtype: DType::F32,
            dims: &[],
        }
    }

    /// Resolve the template into a concrete disk-field descriptor.
    ///
    /// The `Records` placeholder is only legal in the leading position;
    /// anywhere else the schema is invalid.
    pub fn resolve(&self, geometry: &ModelGeometry) -> Result<DiskField> {
        if self.storage != FieldStorage::Disk {
            return Err(StoreError::InvalidConfig(format!(
                "field `{}` is not a disk field",
                self.name
            )));
        }
        match self.dims.first() {
            Some(Dim::Records) => {}
            _ => {
                return Err(StoreError::InvalidConfig(format!(
                    "field `{}`: leading dimension must be the record count",
                    self.name
                )))
            }
        }

        let mut trailing = Vec::with_capacity(self.dims.len().saturating_sub(1));
        for dim in &self.dims[1..] {
            let n = match *dim {
                Dim::Records => {
                    return Err(StoreError::InvalidConfig(format!(
                        "field `{}`: record-count placeholder in a trailing dimension",
                        self.name
                    )))
                }
                Dim::Channels => geometry.n_channels,
                Dim::Features => geometry.n_features_per_channel,
                Dim::Samples => geometry.n_samples_waveforms,
                Dim::Fixed(n) => n,
            };
            if n == 0 {
                return Err(StoreError::InvalidConfig(format!(
                    "field `{}`: zero-sized dimension",
                    self.name
                )));
            }
            trailing.push(n);
        }

        Ok(DiskField {
            name: self.name,
            dtype: self.dtype,
            trailing,
        })
    }
}

/// A resolved disk field: concrete trailing dimensions, known row size.
///
/// `row_bytes` is the single sizing rule shared by the consistency checker
/// and the disk layer's loads: a persisted file holds exactly
/// `record_count * row_bytes` bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskField {
    pub name: &'static str,
    pub dtype: DType,
    pub trailing: Vec<usize>,
}

impl DiskField {
    /// Elements per record.
    pub fn row_elems(&self) -> usize {
        self.trailing.iter().product()
    }

    /// Bytes per record.
    pub fn row_bytes(&self) -> usize {
        self.dtype.size_bytes() * self.row_elems()
    }

    /// Expected file size for a cluster with `n_records` records.
    pub fn expected_bytes(&self, n_records: usize) -> u64 {
        (n_records * self.row_bytes()) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GEO: ModelGeometry = ModelGeometry {
        n_channels: 32,
        n_features_per_channel: 3,
        n_samples_waveforms: 40,
    };

    #[test]
    fn test_resolve_features_shape() {
        let decl = FieldDecl::disk("features", DType::F32, &[Dim::Records, Dim::Channels, Dim::Features]);
        let field = decl.resolve(&GEO).unwrap();
        assert_eq!(field.trailing, vec![32, 3]);
        assert_eq!(field.row_bytes(), 32 * 3 * 4);
        assert_eq!(field.expected_bytes(10), 10 * 32 * 3 * 4);
    }

    #[test]
    fn test_resolve_scalar_rows() {
        let decl = FieldDecl::disk("waveforms_spikes", DType::I64, &[Dim::Records]);
        let field = decl.resolve(&GEO).unwrap();
        assert!(field.trailing.is_empty());
        assert_eq!(field.row_bytes(), 8);
    }

    #[test]
    fn test_trailing_record_placeholder_rejected() {
        let decl = FieldDecl::disk("bad", DType::F32, &[Dim::Records, Dim::Records]);
        assert!(matches!(
            decl.resolve(&GEO),
            Err(StoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_missing_leading_placeholder_rejected() {
        let decl = FieldDecl::disk("bad", DType::F32, &[Dim::Channels]);
        assert!(matches!(
            decl.resolve(&GEO),
            Err(StoreError::InvalidConfig(_))
        ));
    }
}
