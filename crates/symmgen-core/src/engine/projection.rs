use itertools::Itertools;
use nalgebra::Vector3;
use tracing::{info, instrument};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use super::error::EngineError;
use super::extraction::ExtractedBatch;
use super::progress::{Progress, ProgressReporter};
use crate::core::models::batch::StructureBatch;
use crate::core::models::site_symmetry::SiteSymmetry;
use crate::core::symmetry::registry::SpaceGroupRegistry;
use crate::core::utils::periodic::{periodic_distance, wrap_frac};

/// Result of projecting a single atom onto a Wyckoff orbit.
///
/// `Fallback` is the deliberate degraded path taken when every nearest-point
/// search fails: the atom keeps its raw coordinate and is not expanded.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionOutcome {
    Projected {
        /// The full orbit of the projected atom, starting at the chosen
        /// representative.
        coords: Vec<Vector3<f64>>,
        wyckoff_index: usize,
        orbit_index: usize,
    },
    Fallback,
}

impl ProjectionOutcome {
    /// Number of atoms this outcome contributes to the expanded batch.
    fn expanded_len(&self) -> usize {
        match self {
            Self::Projected { coords, .. } => coords.len(),
            Self::Fallback => 1,
        }
    }
}

/// Projects one atom onto the Wyckoff orbit whose site symmetry best matches
/// the predicted label.
///
/// Candidate positions are those at minimum fingerprint distance, with ties
/// keeping every tied position. Each candidate operation's orbit is searched
/// for the point closest to the raw coordinate under the wrap-aware metric;
/// the winning representative is expanded into the full orbit by applying
/// the position's operations cyclically from the chosen index.
pub fn project_atom(
    coord: &Vector3<f64>,
    site_symm: &SiteSymmetry,
    spacegroup: u16,
    registry: &SpaceGroupRegistry,
) -> Result<ProjectionOutcome, EngineError> {
    let positions = registry.wyckoff_positions(spacegroup)?;

    // All positions tied at the minimum fingerprint distance stay in the
    // candidate set.
    let candidates = positions
        .iter()
        .map(|wp| wp.site_symmetry.distance(site_symm))
        .enumerate()
        .min_set_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mut best: Option<(f64, usize, usize, Vector3<f64>)> = None;
    for (wp_index, _) in candidates {
        let wp = &positions[wp_index];
        for op_index in 0..wp.ops.len() {
            let Some(found) = registry.nearest_point_on_orbit(spacegroup, wp, op_index, coord)
            else {
                continue;
            };
            let found = wrap_frac(&found);
            let score = periodic_distance(&found, coord);
            if best.is_none_or(|(b, _, _, _)| score < b) {
                best = Some((score, wp_index, op_index, found));
            }
        }
    }

    let Some((_, wyckoff_index, orbit_index, projected)) = best else {
        return Ok(ProjectionOutcome::Fallback);
    };

    let ops = &positions[wyckoff_index].ops;
    let coords = (0..ops.len())
        .map(|i| ops[(i + orbit_index) % ops.len()].apply(&projected))
        .collect();

    Ok(ProjectionOutcome::Projected {
        coords,
        wyckoff_index,
        orbit_index,
    })
}

/// Projects every atom of the batch independently and replaces the per-atom
/// arrays with the orbit-expanded ones, preserving the original per-crystal,
/// per-atom order.
///
/// The per-atom searches share no mutable state and run in parallel under
/// the `parallel` feature; the merge below restores flat batch order.
#[instrument(skip_all, name = "wyckoff_projection_task")]
pub(crate) fn run(
    batch: &ExtractedBatch,
    registry: &SpaceGroupRegistry,
    reporter: &ProgressReporter,
) -> Result<StructureBatch, EngineError> {
    let total_atoms = batch.total_atoms();
    info!(atoms = total_atoms, "Replicating atoms across Wyckoff orbits.");
    reporter.report(Progress::TaskStart {
        total_steps: total_atoms as u64,
    });

    let spacegroup_per_atom: Vec<u16> = batch
        .num_atoms
        .iter()
        .zip(&batch.spacegroup)
        .flat_map(|(&n, &sg)| std::iter::repeat_n(sg, n))
        .collect();

    let atom_indices: Vec<usize> = (0..total_atoms).collect();

    #[cfg(not(feature = "parallel"))]
    let iterator = atom_indices.iter();

    #[cfg(feature = "parallel")]
    let iterator = atom_indices.par_iter();

    let outcomes: Vec<ProjectionOutcome> = iterator
        .map(|&atom| {
            let outcome = project_atom(
                &batch.frac_coords[atom],
                &batch.site_symm[atom],
                spacegroup_per_atom[atom],
                registry,
            );
            reporter.report(Progress::TaskIncrement);
            outcome
        })
        .collect::<Result<_, _>>()?;
    reporter.report(Progress::TaskFinish);

    let expanded_total: usize = outcomes.iter().map(ProjectionOutcome::expanded_len).sum();
    let mut result = StructureBatch {
        num_atoms: Vec::with_capacity(batch.num_atoms.len()),
        frac_coords: Vec::with_capacity(expanded_total),
        atom_types: Vec::with_capacity(expanded_total),
        site_symm: Vec::with_capacity(expanded_total),
        lattices: batch.lattices.clone(),
        ks: batch.ks.clone(),
        spacegroup: batch.spacegroup.clone(),
    };

    let mut fallbacks = 0usize;
    let mut offset = 0usize;
    for &n in &batch.num_atoms {
        let mut expanded = 0usize;
        for atom in offset..offset + n {
            match &outcomes[atom] {
                ProjectionOutcome::Projected { coords, .. } => {
                    for coord in coords {
                        result.frac_coords.push(*coord);
                        result.atom_types.push(batch.atom_types[atom]);
                        result.site_symm.push(batch.site_symm[atom].clone());
                    }
                    expanded += coords.len();
                }
                ProjectionOutcome::Fallback => {
                    result.frac_coords.push(batch.frac_coords[atom]);
                    result.atom_types.push(batch.atom_types[atom]);
                    result.site_symm.push(batch.site_symm[atom].clone());
                    expanded += 1;
                    fallbacks += 1;
                }
            }
        }
        result.num_atoms.push(expanded);
        offset += n;
    }

    info!(
        input_atoms = total_atoms,
        expanded_atoms = result.total_atoms(),
        fallbacks,
        "Wyckoff projection complete."
    );

    Ok(result)
}
