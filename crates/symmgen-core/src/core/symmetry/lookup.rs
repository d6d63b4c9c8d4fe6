use nalgebra::Vector3;

use super::ops::SymmetryOp;
use crate::core::models::site_symmetry::SiteSymmetry;

/// A named orbit of symmetry-equivalent points within a space group.
#[derive(Debug, Clone, PartialEq)]
pub struct WyckoffPosition {
    /// Conventional Wyckoff letter, for diagnostics.
    pub letter: char,
    /// Ordered symmetry-operation representatives; the orbit size equals
    /// `ops.len()`.
    pub ops: Vec<SymmetryOp>,
    /// Site-symmetry fingerprint of the position.
    pub site_symmetry: SiteSymmetry,
}

impl WyckoffPosition {
    pub fn multiplicity(&self) -> usize {
        self.ops.len()
    }
}

/// External symmetry database interface: enumerates Wyckoff positions per
/// space group and answers nearest-point queries against a single
/// symmetry-operation orbit.
///
/// Implementations are expected to be cheap to query; the registry caches
/// the enumeration side at startup but forwards nearest-point searches.
pub trait SymmetryLookup {
    /// Wyckoff positions of a space group, in the database's canonical
    /// order. An empty slice means the group is not covered.
    fn wyckoff_positions(&self, spacegroup: u16) -> &[WyckoffPosition];

    /// Closest point to `target` on the orbit generated by the given
    /// operation of a Wyckoff position, or `None` when the search fails
    /// (degenerate geometry).
    fn nearest_point_on_orbit(
        &self,
        spacegroup: u16,
        position: &WyckoffPosition,
        op_index: usize,
        target: &Vector3<f64>,
    ) -> Option<Vector3<f64>>;
}
