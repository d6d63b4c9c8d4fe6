use std::collections::HashMap;

use nalgebra::Vector3;
use tracing::info;

use super::SymmetryError;
use super::lookup::{SymmetryLookup, WyckoffPosition};
use crate::core::models::site_symmetry::SiteSymmetry;

struct GroupTable {
    positions: Vec<WyckoffPosition>,
    feasibility: SiteSymmetry,
}

/// Immutable per-space-group symmetry tables, built once at startup from a
/// [`SymmetryLookup`] provider and shared read-only afterwards.
///
/// For every covered group the registry caches the Wyckoff enumeration and
/// the feasibility mask: the elementwise OR of the site-symmetry fingerprints
/// of all the group's Wyckoff positions. Axes not constrained by any position
/// stay all-zero. Nearest-point orbit searches are forwarded to the provider.
pub struct SpaceGroupRegistry {
    provider: Box<dyn SymmetryLookup + Send + Sync>,
    groups: HashMap<u16, GroupTable>,
}

impl SpaceGroupRegistry {
    /// Walks space groups 1..=230 once and caches the tables for every group
    /// the provider covers. Fails if the provider covers nothing.
    pub fn build(provider: Box<dyn SymmetryLookup + Send + Sync>) -> Result<Self, SymmetryError> {
        let mut groups = HashMap::new();
        for sg in 1..=230u16 {
            let positions = provider.wyckoff_positions(sg);
            if positions.is_empty() {
                continue;
            }
            let mut feasibility = SiteSymmetry::zeros();
            for wp in positions {
                feasibility = feasibility.union(&wp.site_symmetry);
            }
            groups.insert(
                sg,
                GroupTable {
                    positions: positions.to_vec(),
                    feasibility,
                },
            );
        }
        if groups.is_empty() {
            return Err(SymmetryError::NoCoverage);
        }
        info!(groups = groups.len(), "Space-group registry built.");
        Ok(Self { provider, groups })
    }

    fn table(&self, spacegroup: u16) -> Result<&GroupTable, SymmetryError> {
        if !(1..=230).contains(&spacegroup) {
            return Err(SymmetryError::SpaceGroupOutOfRange(spacegroup));
        }
        self.groups
            .get(&spacegroup)
            .ok_or(SymmetryError::UnknownSpaceGroup(spacegroup))
    }

    pub fn covered_spacegroups(&self) -> Vec<u16> {
        let mut sgs: Vec<u16> = self.groups.keys().copied().collect();
        sgs.sort_unstable();
        sgs
    }

    pub fn wyckoff_positions(&self, spacegroup: u16) -> Result<&[WyckoffPosition], SymmetryError> {
        Ok(&self.table(spacegroup)?.positions)
    }

    /// Binary mask of site-symmetry labels achievable by any Wyckoff
    /// position of the group.
    pub fn feasibility_mask(&self, spacegroup: u16) -> Result<&SiteSymmetry, SymmetryError> {
        Ok(&self.table(spacegroup)?.feasibility)
    }

    pub fn nearest_point_on_orbit(
        &self,
        spacegroup: u16,
        position: &WyckoffPosition,
        op_index: usize,
        target: &Vector3<f64>,
    ) -> Option<Vector3<f64>> {
        self.provider
            .nearest_point_on_orbit(spacegroup, position, op_index, target)
    }
}

impl std::fmt::Debug for SpaceGroupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceGroupRegistry")
            .field("groups", &self.groups.len())
            .finish()
    }
}
