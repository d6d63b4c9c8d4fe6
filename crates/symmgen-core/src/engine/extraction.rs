use nalgebra::{Matrix3, Vector3, Vector6};
use tracing::info;

use super::error::EngineError;
use crate::core::models::site_symmetry::SiteSymmetry;
use crate::core::models::trajectory::{Trajectory, decode_atom_type, is_dummy};

/// Terminal sampling state after dummy-atom removal: decoded element labels,
/// surviving atoms only, and empty crystals dropped entirely.
#[derive(Debug, Clone)]
pub(crate) struct ExtractedBatch {
    pub num_atoms: Vec<usize>,
    pub frac_coords: Vec<Vector3<f64>>,
    pub atom_types: Vec<u8>,
    pub site_symm: Vec<SiteSymmetry>,
    pub lattices: Vec<Matrix3<f64>>,
    pub ks: Vec<Vector6<f64>>,
    pub spacegroup: Vec<u16>,
}

impl ExtractedBatch {
    pub fn total_atoms(&self) -> usize {
        self.num_atoms.iter().sum()
    }
}

/// Decodes the `t = 0` snapshot of a complete trajectory: converts atom-type
/// logits to labels, drops atoms decoded to the dummy element, recounts
/// atoms per crystal, and removes crystals left with no atoms.
pub(crate) fn extract_final(trajectory: &Trajectory) -> Result<ExtractedBatch, EngineError> {
    let final_step = trajectory.final_step().ok_or_else(|| {
        EngineError::Internal(format!(
            "cannot extract from an incomplete trajectory ({}/{} steps)",
            trajectory.len(),
            trajectory.timesteps() + 1
        ))
    })?;

    let batch_size = trajectory.num_atoms().len();
    let mut extracted = ExtractedBatch {
        num_atoms: Vec::with_capacity(batch_size),
        frac_coords: Vec::with_capacity(final_step.frac_coords.len()),
        atom_types: Vec::with_capacity(final_step.frac_coords.len()),
        site_symm: Vec::with_capacity(final_step.frac_coords.len()),
        lattices: Vec::with_capacity(batch_size),
        ks: Vec::with_capacity(batch_size),
        spacegroup: Vec::with_capacity(batch_size),
    };

    let mut empty_crystals = 0usize;
    let mut offset = 0usize;
    for (crystal, &n) in trajectory.num_atoms().iter().enumerate() {
        let mut survivors = 0usize;
        for atom in offset..offset + n {
            let logits = &final_step.atom_types[atom];
            if is_dummy(logits) {
                continue;
            }
            let symm = SiteSymmetry::from_flat(final_step.site_symm[atom].as_slice())
                .ok_or_else(|| {
                    EngineError::Internal(format!(
                        "site-symmetry logits of atom {atom} have dimension {}",
                        final_step.site_symm[atom].len()
                    ))
                })?;
            extracted.frac_coords.push(final_step.frac_coords[atom]);
            extracted.atom_types.push(decode_atom_type(logits));
            extracted.site_symm.push(symm);
            survivors += 1;
        }
        offset += n;

        if survivors == 0 {
            empty_crystals += 1;
            continue;
        }
        extracted.num_atoms.push(survivors);
        extracted.lattices.push(final_step.lattices[crystal]);
        extracted.ks.push(final_step.ks[crystal]);
        extracted.spacegroup.push(trajectory.spacegroup()[crystal]);
    }

    info!(
        empty = empty_crystals,
        batch = batch_size,
        "Dropped dummy atoms and empty crystals."
    );

    Ok(extracted)
}
