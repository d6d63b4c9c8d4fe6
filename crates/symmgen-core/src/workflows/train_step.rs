use rand::Rng;
use tracing::{info, instrument, warn};

use crate::core::models::batch::CrystalBatch;
use crate::core::symmetry::registry::SpaceGroupRegistry;
use crate::engine::diffusion::{DiffusionEngine, LossBreakdown};
use crate::engine::error::EngineError;
use crate::engine::network::DenoisingNetwork;

/// Outcome of one training step. `NoUpdate` signals the caller to skip the
/// optimizer update for this batch; the breakdown is still returned for
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrainOutcome {
    Update(LossBreakdown),
    NoUpdate(LossBreakdown),
}

impl TrainOutcome {
    pub fn losses(&self) -> &LossBreakdown {
        match self {
            Self::Update(l) | Self::NoUpdate(l) => l,
        }
    }

    pub fn should_update(&self) -> bool {
        matches!(self, Self::Update(_))
    }
}

/// Computes the training loss for one batch. A non-finite total loss is a
/// recoverable event: the step reports "no update" and training continues.
#[instrument(skip_all, name = "train_step_workflow")]
pub fn run<N, R>(
    batch: &CrystalBatch,
    network: &N,
    registry: &SpaceGroupRegistry,
    engine: &DiffusionEngine,
    rng: &mut R,
) -> Result<TrainOutcome, EngineError>
where
    N: DenoisingNetwork,
    R: Rng + ?Sized,
{
    let losses = engine.forward_loss(batch, network, registry, rng)?;

    if !losses.is_finite() {
        warn!(
            lattice = losses.lattice,
            coord = losses.coord,
            atom_type = losses.atom_type,
            site_symm = losses.site_symm,
            "Total loss is not finite; skipping the optimizer update."
        );
        return Ok(TrainOutcome::NoUpdate(losses));
    }

    info!(loss = losses.total, "Training step complete.");
    Ok(TrainOutcome::Update(losses))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::batch::{MAX_ATOMIC_NUM, SG_CONDITION_DIM};
    use crate::core::models::site_symmetry::{SITE_SYMM_AXES, SITE_SYMM_DIM, SiteSymmetry};
    use crate::core::symmetry::lookup::{SymmetryLookup, WyckoffPosition};
    use crate::core::symmetry::ops::SymmetryOp;
    use crate::engine::config::{DiffusionConfigBuilder, ScheduleConfig};
    use crate::engine::network::{LatticeDelta, LatticeFeatures, NetworkInput, NetworkPredictions};
    use crate::engine::schedule::BetaScheduleMode;
    use nalgebra::{DVector, Matrix3, Vector3, Vector6};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    struct TriclinicProvider {
        positions: Vec<WyckoffPosition>,
        empty: Vec<WyckoffPosition>,
    }

    impl TriclinicProvider {
        fn new() -> Self {
            Self {
                positions: vec![WyckoffPosition {
                    letter: 'a',
                    ops: vec![SymmetryOp::identity()],
                    site_symmetry: SiteSymmetry::from_axis_categories(&[0; SITE_SYMM_AXES]),
                }],
                empty: Vec::new(),
            }
        }
    }

    impl SymmetryLookup for TriclinicProvider {
        fn wyckoff_positions(&self, spacegroup: u16) -> &[WyckoffPosition] {
            if spacegroup == 1 {
                &self.positions
            } else {
                &self.empty
            }
        }

        fn nearest_point_on_orbit(
            &self,
            _spacegroup: u16,
            _position: &WyckoffPosition,
            _op_index: usize,
            target: &Vector3<f64>,
        ) -> Option<Vector3<f64>> {
            Some(*target)
        }
    }

    struct ConstantScoreNetwork {
        score: f64,
    }

    impl DenoisingNetwork for ConstantScoreNetwork {
        fn forward(&self, input: &NetworkInput<'_>) -> Result<NetworkPredictions, EngineError> {
            let atoms = input.frac_coords.len();
            let lattice = match input.lattice_feats {
                LatticeFeatures::Ks(ks) => LatticeDelta::Ks(vec![Vector6::zeros(); ks.len()]),
                LatticeFeatures::Matrices(ls) => {
                    LatticeDelta::Matrices(vec![Matrix3::zeros(); ls.len()])
                }
            };
            Ok(NetworkPredictions {
                lattice,
                coord_score: vec![Vector3::repeat(self.score); atoms],
                atom_types: vec![DVector::zeros(MAX_ATOMIC_NUM); atoms],
                site_symm: vec![DVector::zeros(SITE_SYMM_DIM); atoms],
            })
        }
    }

    fn setup_test_environment() -> (CrystalBatch, SpaceGroupRegistry, DiffusionEngine) {
        let batch = CrystalBatch {
            num_atoms: vec![2],
            frac_coords: vec![Vector3::new(0.1, 0.2, 0.3), Vector3::new(0.6, 0.7, 0.8)],
            atom_types: vec![6, 8],
            site_symm: vec![SiteSymmetry::from_axis_categories(&[0; SITE_SYMM_AXES]); 2],
            coord_loss_weight: vec![1.0; 2],
            ks: vec![Vector6::new(0.0, 0.0, 0.0, 0.1, -0.05, 1.1)],
            lengths: vec![Vector3::new(4.0, 5.0, 6.0)],
            angles: vec![Vector3::new(85.0, 95.0, 100.0)],
            spacegroup: vec![1],
            sg_condition: vec![DVector::zeros(SG_CONDITION_DIM)],
        };
        let registry = SpaceGroupRegistry::build(Box::new(TriclinicProvider::new())).unwrap();
        let config = DiffusionConfigBuilder::new()
            .cost_lattice(1.0)
            .cost_coord(1.0)
            .cost_type(1.0)
            .cost_site_symm(1.0)
            .time_dim(16)
            .build()
            .unwrap();
        let schedule = ScheduleConfig {
            timesteps: 10,
            beta_mode: BetaScheduleMode::Cosine { s: 0.008 },
            sigma_begin: 0.01,
            sigma_end: 0.5,
        };
        let engine = DiffusionEngine::new(config, &schedule).unwrap();
        (batch, registry, engine)
    }

    #[test]
    fn finite_loss_requests_an_update() {
        let (batch, registry, engine) = setup_test_environment();
        let mut rng = StdRng::seed_from_u64(1);
        let outcome = run(
            &batch,
            &ConstantScoreNetwork { score: 0.0 },
            &registry,
            &engine,
            &mut rng,
        )
        .unwrap();
        assert!(outcome.should_update());
        assert!(outcome.losses().is_finite());
    }

    #[test]
    fn nan_loss_reports_no_update_instead_of_failing() {
        let (batch, registry, engine) = setup_test_environment();
        let mut rng = StdRng::seed_from_u64(1);
        let outcome = run(
            &batch,
            &ConstantScoreNetwork { score: f64::NAN },
            &registry,
            &engine,
            &mut rng,
        )
        .unwrap();
        assert!(!outcome.should_update());
        assert!(matches!(outcome, TrainOutcome::NoUpdate(_)));
        assert!(outcome.losses().total.is_nan());
    }
}
