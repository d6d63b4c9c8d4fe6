use rand::Rng;
use tracing::{info, instrument};

use crate::core::models::batch::{CrystalBatch, StructureBatch};
use crate::core::models::trajectory::TrajectoryStack;
use crate::core::symmetry::registry::SpaceGroupRegistry;
use crate::engine::config::SampleConfig;
use crate::engine::diffusion::DiffusionEngine;
use crate::engine::error::EngineError;
use crate::engine::network::DenoisingNetwork;
use crate::engine::progress::{Progress, ProgressReporter};
use crate::engine::{extraction, projection};

/// A completed generation run: the symmetrized structures and the stacked
/// per-timestep trajectory views.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub structures: StructureBatch,
    pub trajectory: TrajectoryStack,
}

/// Generates crystal structures for the batch's space groups: reverse
/// diffusion from pure noise, dummy-atom removal, Wyckoff orbit
/// symmetrization, and a final consistency check.
#[instrument(skip_all, name = "generation_workflow")]
pub fn run<N, R>(
    batch: &CrystalBatch,
    network: &N,
    registry: &SpaceGroupRegistry,
    engine: &DiffusionEngine,
    sample: &SampleConfig,
    reporter: &ProgressReporter,
    rng: &mut R,
) -> Result<GenerationResult, EngineError>
where
    N: DenoisingNetwork,
    R: Rng + ?Sized,
{
    reporter.report(Progress::PhaseStart {
        name: "Initialization",
    });
    batch.validate()?;
    info!(
        crystals = batch.batch_size(),
        atoms = batch.total_atoms(),
        timesteps = engine.timesteps(),
        "Starting structure generation."
    );
    reporter.report(Progress::PhaseFinish);

    // === Phase 1: Reverse diffusion ===
    reporter.report(Progress::PhaseStart {
        name: "Reverse Diffusion",
    });
    let trajectory = engine.sample(batch, network, registry, sample, reporter, rng)?;
    let stack = trajectory.stack();
    reporter.report(Progress::PhaseFinish);

    // === Phase 2: Dummy removal and Wyckoff symmetrization ===
    reporter.report(Progress::PhaseStart {
        name: "Symmetrization",
    });
    let extracted = extraction::extract_final(&trajectory)?;
    let structures = projection::run(&extracted, registry, reporter)?;
    reporter.report(Progress::PhaseFinish);

    // === Phase 3: Consistency checks ===
    reporter.report(Progress::PhaseStart {
        name: "Finalization",
    });
    verify_consistency(&structures)?;
    info!(
        crystals = structures.batch_size(),
        atoms = structures.total_atoms(),
        "Generation complete."
    );
    reporter.report(Progress::PhaseFinish);

    Ok(GenerationResult {
        structures,
        trajectory: stack,
    })
}

/// Post-projection length invariants. A violation is a logic defect, not a
/// data problem, and halts with full diagnostic state.
fn verify_consistency(structures: &StructureBatch) -> Result<(), EngineError> {
    let atoms = structures.total_atoms();
    if structures.frac_coords.len() != atoms
        || structures.atom_types.len() != atoms
        || structures.site_symm.len() != atoms
    {
        return Err(EngineError::Internal(format!(
            "per-atom arrays out of sync after projection: coords {}, types {}, symm {}, \
             atom-count sum {atoms}",
            structures.frac_coords.len(),
            structures.atom_types.len(),
            structures.site_symm.len(),
        )));
    }
    let crystals = structures.batch_size();
    if structures.lattices.len() != crystals
        || structures.ks.len() != crystals
        || structures.spacegroup.len() != crystals
    {
        return Err(EngineError::Internal(format!(
            "per-crystal arrays out of sync after projection: lattices {}, ks {}, \
             spacegroups {}, crystals {crystals}",
            structures.lattices.len(),
            structures.ks.len(),
            structures.spacegroup.len(),
        )));
    }
    Ok(())
}
