//! Crystallographic symmetry vocabulary: affine symmetry operations, Wyckoff
//! positions with their site-symmetry fingerprints, the external lookup
//! service interface, and the immutable per-space-group registry built from
//! it at startup.

pub mod lookup;
pub mod ops;
pub mod registry;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SymmetryError {
    #[error("space group {0} outside [1, 230]")]
    SpaceGroupOutOfRange(u16),

    #[error("space group {0} is not covered by the registry")]
    UnknownSpaceGroup(u16),

    #[error("symmetry provider covers no space groups")]
    NoCoverage,
}
