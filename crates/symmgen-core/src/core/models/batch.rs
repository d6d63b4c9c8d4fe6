use nalgebra::{DVector, Matrix3, Vector3, Vector6};
use thiserror::Error;

use super::site_symmetry::SiteSymmetry;

/// Number of atom-type classes carried by the diffusion process. The last
/// class is the dummy padding element removed at extraction.
pub const MAX_ATOMIC_NUM: usize = 94;
/// Reserved padding element index; atoms decoded to this type are dropped.
pub const DUMMY_ATOM_TYPE: u8 = MAX_ATOMIC_NUM as u8;
/// Length of the per-crystal space-group conditioning vector.
pub const SG_CONDITION_DIM: usize = 397;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("per-atom array `{name}` has length {found}, expected {expected}")]
    AtomArrayMismatch {
        name: &'static str,
        found: usize,
        expected: usize,
    },

    #[error("per-crystal array `{name}` has length {found}, expected {expected}")]
    CrystalArrayMismatch {
        name: &'static str,
        found: usize,
        expected: usize,
    },

    #[error("atom type {0} outside [1, 94]")]
    AtomTypeOutOfRange(u8),

    #[error("space group {0} outside [1, 230]")]
    SpaceGroupOutOfRange(u16),

    #[error("sg_condition vector has dimension {0}, expected 397")]
    ConditionDimMismatch(usize),
}

/// A set of crystals packed into flat, concatenated per-atom arrays plus
/// per-crystal vectors. Created by the dataset loader and consumed read-only
/// by the diffusion engine.
#[derive(Debug, Clone)]
pub struct CrystalBatch {
    /// Atom count per crystal; its sum is the length of every per-atom array.
    pub num_atoms: Vec<usize>,
    /// Per-atom fractional coordinates in `[0, 1)^3`.
    pub frac_coords: Vec<Vector3<f64>>,
    /// Per-atom element index in `[1, 94]`.
    pub atom_types: Vec<u8>,
    /// Per-atom ground-truth site-symmetry encoding.
    pub site_symm: Vec<SiteSymmetry>,
    /// Per-atom coordinate loss weight, supplied by the dataset.
    pub coord_loss_weight: Vec<f64>,
    /// Per-crystal reduced lattice parameterization.
    pub ks: Vec<Vector6<f64>>,
    /// Per-crystal lattice lengths (angstrom).
    pub lengths: Vec<Vector3<f64>>,
    /// Per-crystal lattice angles (degrees).
    pub angles: Vec<Vector3<f64>>,
    /// Per-crystal space group in `[1, 230]`.
    pub spacegroup: Vec<u16>,
    /// Per-crystal conditioning vector derived from the space group.
    pub sg_condition: Vec<DVector<f64>>,
}

impl CrystalBatch {
    pub fn batch_size(&self) -> usize {
        self.num_atoms.len()
    }

    pub fn total_atoms(&self) -> usize {
        self.num_atoms.iter().sum()
    }

    /// Crystal index of each atom in flat order.
    pub fn batch_index(&self) -> Vec<usize> {
        let mut index = Vec::with_capacity(self.total_atoms());
        for (crystal, &n) in self.num_atoms.iter().enumerate() {
            index.extend(std::iter::repeat_n(crystal, n));
        }
        index
    }

    /// Flat-array range occupied by each crystal's atoms, in batch order.
    pub fn crystal_ranges(&self) -> Vec<std::ops::Range<usize>> {
        let mut ranges = Vec::with_capacity(self.batch_size());
        let mut start = 0;
        for &n in &self.num_atoms {
            ranges.push(start..start + n);
            start += n;
        }
        ranges
    }

    /// Checks the packing invariants: every per-atom array length equals the
    /// atom-count sum, every per-crystal array length equals the batch size,
    /// and all labels are in range.
    pub fn validate(&self) -> Result<(), BatchError> {
        let atoms = self.total_atoms();
        let crystals = self.batch_size();

        let per_atom: [(&'static str, usize); 4] = [
            ("frac_coords", self.frac_coords.len()),
            ("atom_types", self.atom_types.len()),
            ("site_symm", self.site_symm.len()),
            ("coord_loss_weight", self.coord_loss_weight.len()),
        ];
        for (name, found) in per_atom {
            if found != atoms {
                return Err(BatchError::AtomArrayMismatch {
                    name,
                    found,
                    expected: atoms,
                });
            }
        }

        let per_crystal: [(&'static str, usize); 5] = [
            ("ks", self.ks.len()),
            ("lengths", self.lengths.len()),
            ("angles", self.angles.len()),
            ("spacegroup", self.spacegroup.len()),
            ("sg_condition", self.sg_condition.len()),
        ];
        for (name, found) in per_crystal {
            if found != crystals {
                return Err(BatchError::CrystalArrayMismatch {
                    name,
                    found,
                    expected: crystals,
                });
            }
        }

        for &t in &self.atom_types {
            if t < 1 || t > DUMMY_ATOM_TYPE {
                return Err(BatchError::AtomTypeOutOfRange(t));
            }
        }
        for &sg in &self.spacegroup {
            if !(1..=230).contains(&sg) {
                return Err(BatchError::SpaceGroupOutOfRange(sg));
            }
        }
        for cond in &self.sg_condition {
            if cond.len() != SG_CONDITION_DIM {
                return Err(BatchError::ConditionDimMismatch(cond.len()));
            }
        }
        Ok(())
    }
}

/// A finalized batch of generated structures: the terminal sampling state
/// after dummy removal and Wyckoff orbit expansion.
#[derive(Debug, Clone)]
pub struct StructureBatch {
    pub num_atoms: Vec<usize>,
    pub frac_coords: Vec<Vector3<f64>>,
    pub atom_types: Vec<u8>,
    pub site_symm: Vec<SiteSymmetry>,
    pub lattices: Vec<Matrix3<f64>>,
    pub ks: Vec<Vector6<f64>>,
    pub spacegroup: Vec<u16>,
}

impl StructureBatch {
    pub fn batch_size(&self) -> usize {
        self.num_atoms.len()
    }

    pub fn total_atoms(&self) -> usize {
        self.num_atoms.iter().sum()
    }
}
