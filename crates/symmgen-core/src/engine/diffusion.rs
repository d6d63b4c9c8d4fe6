use nalgebra::{DVector, Matrix3, Vector3, Vector6};
use rand::Rng;
use tracing::{debug, info, instrument};

use super::conditioning::TimeEmbedding;
use super::config::{DiffusionConfig, SampleConfig, ScheduleConfig};
use super::error::EngineError;
use super::network::{DenoisingNetwork, LatticeDelta, LatticeFeatures, NetworkInput, NetworkPredictions};
use super::noising::{
    self, NoisedChannel, expand_per_atom, noise_coords, noise_flat, noise_ks, noise_lattices,
    one_hot_atom_types,
};
use super::progress::{Progress, ProgressReporter};
use super::schedule::{BetaSchedule, Channel, SigmaSchedule};
use super::wrapped::d_log_p_wrapped_normal;
use crate::core::lattice::{KsConstraint, ks_to_matrix, lattice_params_to_matrix};
use crate::core::models::batch::{CrystalBatch, MAX_ATOMIC_NUM};
use crate::core::models::site_symmetry::SITE_SYMM_DIM;
use crate::core::models::trajectory::{Trajectory, TrajectoryStep};
use crate::core::symmetry::registry::SpaceGroupRegistry;
use crate::core::utils::periodic::wrap_frac;

/// Loss of one forward pass: the weighted total plus the four per-channel
/// components.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossBreakdown {
    pub total: f64,
    pub lattice: f64,
    pub coord: f64,
    pub atom_type: f64,
    pub site_symm: f64,
}

impl LossBreakdown {
    pub fn is_finite(&self) -> bool {
        self.total.is_finite()
    }

    /// Component values labeled for stats aggregation, e.g. `train_loss`.
    pub fn named(&self, prefix: &str) -> Vec<(String, f64)> {
        vec![
            (format!("{prefix}_loss"), self.total),
            (format!("{prefix}_lattice_loss"), self.lattice),
            (format!("{prefix}_coord_loss"), self.coord),
            (format!("{prefix}_type_loss"), self.atom_type),
            (format!("{prefix}_symm_loss"), self.site_symm),
        ]
    }
}

/// Shared read-only context of one reverse-sampling run.
struct StepContext<'a, N> {
    batch: &'a CrystalBatch,
    network: &'a N,
    batch_index: &'a [usize],
    constraints: &'a [KsConstraint],
    ss_masks: &'a Option<Vec<DVector<f64>>>,
    step_lr: f64,
    keep_coords: bool,
    keep_lattice: bool,
}

impl<N> Clone for StepContext<'_, N> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<N> Copy for StepContext<'_, N> {}

/// Orchestrates the four-channel diffusion process: forward noising with
/// loss computation for training, and reverse predictor-corrector sampling
/// for generation.
#[derive(Debug)]
pub struct DiffusionEngine {
    config: DiffusionConfig,
    beta: BetaSchedule,
    sigma: SigmaSchedule,
    time_embedding: TimeEmbedding,
}

impl DiffusionEngine {
    pub fn new(config: DiffusionConfig, schedule: &ScheduleConfig) -> Result<Self, EngineError> {
        let beta = BetaSchedule::new(schedule.timesteps, schedule.beta_mode)?;
        let sigma = SigmaSchedule::new(
            schedule.timesteps,
            schedule.sigma_begin,
            schedule.sigma_end,
        )?;
        let time_embedding = TimeEmbedding::new(config.time_dim)?;
        Ok(Self {
            config,
            beta,
            sigma,
            time_embedding,
        })
    }

    pub fn config(&self) -> &DiffusionConfig {
        &self.config
    }

    pub fn timesteps(&self) -> usize {
        self.beta.timesteps()
    }

    /// Forward (training) pass: draws one timestep per crystal, noises the
    /// four channels independently, queries the network once, and scores
    /// the predictions against the injected noise.
    #[instrument(skip_all, name = "forward_loss")]
    pub fn forward_loss<N, R>(
        &self,
        batch: &CrystalBatch,
        network: &N,
        registry: &SpaceGroupRegistry,
        rng: &mut R,
    ) -> Result<LossBreakdown, EngineError>
    where
        N: DenoisingNetwork,
        R: Rng + ?Sized,
    {
        batch.validate()?;
        let batch_size = batch.batch_size();
        let total_atoms = batch.total_atoms();
        let batch_index = batch.batch_index();

        let times: Vec<usize> = (0..batch_size)
            .map(|_| self.beta.uniform_sample_t(rng))
            .collect();
        let conditioning: Vec<DVector<f64>> = times
            .iter()
            .zip(&batch.sg_condition)
            .map(|(&t, sg)| self.time_embedding.conditioning(t, sg))
            .collect();

        let ss_masks = self.site_symm_masks(&batch.spacegroup, &batch_index, registry)?;

        let coeff = |channel: Channel| -> (Vec<f64>, Vec<f64>) {
            let c0 = times
                .iter()
                .map(|&t| self.beta.signal_coeff(t, channel))
                .collect();
            let c1 = times
                .iter()
                .map(|&t| self.beta.noise_coeff(t, channel))
                .collect();
            (c0, c1)
        };
        let (c0_lattice, c1_lattice) = coeff(Channel::Lattice);
        let (c0_atom, c1_atom) = coeff(Channel::Atom);
        let (c0_symm, c1_symm) = coeff(Channel::SiteSymm);
        let c0_atom = expand_per_atom(&c0_atom, &batch.num_atoms);
        let c1_atom = expand_per_atom(&c1_atom, &batch.num_atoms);
        let c0_symm = expand_per_atom(&c0_symm, &batch.num_atoms);
        let c1_symm = expand_per_atom(&c1_symm, &batch.num_atoms);

        let sigmas: Vec<f64> = times.iter().map(|&t| self.sigma.sigma(t)).collect();
        let sigmas_norm: Vec<f64> = times.iter().map(|&t| self.sigma.sigma_norm(t)).collect();
        let sigma_per_atom = expand_per_atom(&sigmas, &batch.num_atoms);
        let sigma_norm_per_atom = expand_per_atom(&sigmas_norm, &batch.num_atoms);

        let lattices: Vec<Matrix3<f64>> = if self.config.use_ks {
            batch.ks.iter().map(ks_to_matrix).collect()
        } else {
            batch
                .lengths
                .iter()
                .zip(&batch.angles)
                .map(|(l, a)| lattice_params_to_matrix(l, a))
                .collect()
        };
        let constraints = self.ks_constraints(&batch.spacegroup)?;

        // Lattice channel. Noise is always drawn so the loss target exists
        // even when the channel is frozen and fed ground truth.
        let noised_ks: NoisedChannel<Vector6<f64>>;
        let noised_l: NoisedChannel<Matrix3<f64>>;
        let input_ks: Vec<Vector6<f64>>;
        let input_lattices: Vec<Matrix3<f64>>;
        if self.config.use_ks {
            noised_ks = noise_ks(&batch.ks, &constraints, &c0_lattice, &c1_lattice, rng);
            noised_l = NoisedChannel {
                value: Vec::new(),
                noise: Vec::new(),
            };
            if self.config.keep_lattice() {
                input_ks = batch.ks.clone();
                input_lattices = lattices.clone();
            } else {
                input_ks = noised_ks.value.clone();
                input_lattices = input_ks.iter().map(ks_to_matrix).collect();
            }
        } else {
            noised_l = noise_lattices(&lattices, &c0_lattice, &c1_lattice, rng);
            noised_ks = NoisedChannel {
                value: Vec::new(),
                noise: Vec::new(),
            };
            input_ks = batch.ks.clone();
            input_lattices = if self.config.keep_lattice() {
                lattices.clone()
            } else {
                noised_l.value.clone()
            };
        }

        let noised_x = noise_coords(&batch.frac_coords, &sigma_per_atom, rng);
        let input_coords = if self.config.keep_coords() {
            batch.frac_coords.clone()
        } else {
            noised_x.value.clone()
        };

        let gt_types = one_hot_atom_types(&batch.atom_types);
        let noised_types = noise_flat(&gt_types, &c0_atom, &c1_atom, None, rng);

        let gt_symm: Vec<DVector<f64>> = batch.site_symm.iter().map(|s| s.flatten()).collect();
        let noised_symm = noise_flat(&gt_symm, &c0_symm, &c1_symm, ss_masks.as_deref(), rng);

        let input = NetworkInput {
            conditioning: &conditioning,
            atom_type_probs: &noised_types.value,
            frac_coords: &input_coords,
            lattice_feats: if self.config.use_ks {
                LatticeFeatures::Ks(&input_ks)
            } else {
                LatticeFeatures::Matrices(&input_lattices)
            },
            lattices: &input_lattices,
            num_atoms: &batch.num_atoms,
            batch_index: &batch_index,
            site_symm_probs: &noised_symm.value,
        };
        let preds = network.forward(&input)?;
        validate_predictions(&preds, total_atoms, batch_size, self.config.use_ks)?;

        // Score target of the wrapped noising kernel, rescaled by the
        // normalized sigma.
        let score_targets: Vec<Vector3<f64>> = noised_x
            .noise
            .iter()
            .enumerate()
            .map(|(i, z)| {
                let sigma = sigma_per_atom[i];
                let norm = sigma_norm_per_atom[i].sqrt();
                Vector3::from_fn(|c, _| d_log_p_wrapped_normal(sigma * z[c], sigma) / norm)
            })
            .collect();

        let loss_lattice = match &preds.lattice {
            LatticeDelta::Ks(pred) => {
                let masked_noise: Vec<Vector6<f64>> = noised_ks
                    .noise
                    .iter()
                    .enumerate()
                    .map(|(i, z)| z.component_mul(&constraints[i].mask))
                    .collect();
                mean_squared_error(
                    pred.iter().flat_map(|k| k.iter().copied()),
                    masked_noise.iter().flat_map(|k| k.iter().copied()),
                )
            }
            LatticeDelta::Matrices(pred) => mean_squared_error(
                pred.iter().flat_map(|m| m.iter().copied()),
                noised_l.noise.iter().flat_map(|m| m.iter().copied()),
            ),
        };

        let loss_coord = {
            let mut acc = 0.0;
            let mut count = 0usize;
            for (i, (pred, target)) in preds.coord_score.iter().zip(&score_targets).enumerate() {
                let weight = batch.coord_loss_weight[i].sqrt();
                for c in 0..3 {
                    let d = pred[c] - target[c];
                    acc += weight * d * d;
                    count += 1;
                }
            }
            acc / count.max(1) as f64
        };

        let loss_type = mean_squared_error(
            preds.atom_types.iter().flat_map(|v| v.iter().copied()),
            noised_types.noise.iter().flat_map(|v| v.iter().copied()),
        );

        let loss_symm = match &ss_masks {
            Some(masks) => {
                let masked = |vs: &[DVector<f64>]| -> Vec<DVector<f64>> {
                    vs.iter()
                        .zip(masks.iter())
                        .map(|(v, m)| v.component_mul(m))
                        .collect()
                };
                let pred = masked(&preds.site_symm);
                let noise = masked(&noised_symm.noise);
                mean_squared_error(
                    pred.iter().flat_map(|v| v.iter().copied()),
                    noise.iter().flat_map(|v| v.iter().copied()),
                )
            }
            None => mean_squared_error(
                preds.site_symm.iter().flat_map(|v| v.iter().copied()),
                noised_symm.noise.iter().flat_map(|v| v.iter().copied()),
            ),
        };

        let total = self.config.cost_lattice * loss_lattice
            + self.config.cost_coord * loss_coord
            + self.config.cost_type * loss_type
            + self.config.cost_site_symm * loss_symm;

        debug!(
            loss = total,
            lattice = loss_lattice,
            coord = loss_coord,
            atom_type = loss_type,
            site_symm = loss_symm,
            "Forward pass complete."
        );

        Ok(LossBreakdown {
            total,
            lattice: loss_lattice,
            coord: loss_coord,
            atom_type: loss_type,
            site_symm: loss_symm,
        })
    }

    /// Reverse (sampling) pass: anneals from pure noise at `t = T` down to
    /// `t = 0`, one Langevin corrector plus one predictor per step, and
    /// records every state in the returned trajectory.
    #[instrument(skip_all, name = "reverse_sampling")]
    pub fn sample<N, R>(
        &self,
        batch: &CrystalBatch,
        network: &N,
        registry: &SpaceGroupRegistry,
        sample: &SampleConfig,
        reporter: &ProgressReporter,
        rng: &mut R,
    ) -> Result<Trajectory, EngineError>
    where
        N: DenoisingNetwork,
        R: Rng + ?Sized,
    {
        batch.validate()?;
        let timesteps = self.beta.timesteps();
        let batch_size = batch.batch_size();
        let total_atoms = batch.total_atoms();
        let batch_index = batch.batch_index();
        let use_ks = self.config.use_ks;
        let keep_coords = sample.keep_coords;
        let keep_lattice = sample.keep_lattice;

        let constraints = self.ks_constraints(&batch.spacegroup)?;
        let ss_masks = self.site_symm_masks(&batch.spacegroup, &batch_index, registry)?;

        info!(
            batch_size,
            total_atoms, timesteps, "Starting reverse diffusion."
        );

        // Initial state at t = T: Gaussian lattice and logits, uniform
        // coordinates; ground truth substituted where kept.
        let init_ks: Vec<Vector6<f64>> = if keep_lattice || !use_ks {
            batch.ks.clone()
        } else {
            (0..batch_size)
                .map(|i| constraints[i].apply(&noising::randn_vector6(rng)))
                .collect()
        };
        let init_lattices: Vec<Matrix3<f64>> = if keep_lattice {
            if use_ks {
                batch.ks.iter().map(ks_to_matrix).collect()
            } else {
                batch
                    .lengths
                    .iter()
                    .zip(&batch.angles)
                    .map(|(l, a)| lattice_params_to_matrix(l, a))
                    .collect()
            }
        } else if use_ks {
            init_ks.iter().map(ks_to_matrix).collect()
        } else {
            (0..batch_size)
                .map(|_| noising::randn_matrix3(rng))
                .collect()
        };
        let init_coords: Vec<Vector3<f64>> = if keep_coords {
            batch.frac_coords.clone()
        } else {
            (0..total_atoms)
                .map(|_| Vector3::from_fn(|_, _| rng.gen_range(0.0..1.0)))
                .collect()
        };
        let init_types: Vec<DVector<f64>> = (0..total_atoms)
            .map(|_| noising::randn_dvector(MAX_ATOMIC_NUM, rng))
            .collect();
        let init_symm: Vec<DVector<f64>> = (0..total_atoms)
            .map(|i| {
                let z = noising::randn_dvector(SITE_SYMM_DIM, rng);
                match &ss_masks {
                    Some(masks) => z.component_mul(&masks[i]),
                    None => z,
                }
            })
            .collect();

        let mut trajectory = Trajectory::new(
            timesteps,
            batch.num_atoms.clone(),
            batch.spacegroup.clone(),
        );
        let mut state = TrajectoryStep {
            frac_coords: init_coords.iter().map(wrap_frac).collect(),
            atom_types: init_types,
            site_symm: init_symm,
            lattices: init_lattices,
            ks: init_ks,
        };
        trajectory.push(state.clone());

        reporter.report(Progress::TaskStart {
            total_steps: timesteps as u64,
        });

        let ctx = StepContext {
            batch,
            network,
            batch_index: &batch_index,
            constraints: &constraints,
            ss_masks: &ss_masks,
            step_lr: sample.step_lr,
            keep_coords,
            keep_lattice,
        };
        for t in (1..=timesteps).rev() {
            state = self.denoise_step(&ctx, state, t, rng)?;
            trajectory.push(state.clone());
            reporter.report(Progress::TaskIncrement);
        }
        reporter.report(Progress::TaskFinish);

        Ok(trajectory)
    }

    /// One predictor-corrector pair at timestep `t`, producing the state at
    /// `t - 1`.
    fn denoise_step<N, R>(
        &self,
        ctx: &StepContext<'_, N>,
        state: TrajectoryStep,
        t: usize,
        rng: &mut R,
    ) -> Result<TrajectoryStep, EngineError>
    where
        N: DenoisingNetwork,
        R: Rng + ?Sized,
    {
        let StepContext {
            batch,
            network,
            batch_index,
            constraints,
            ss_masks,
            step_lr,
            keep_coords,
            keep_lattice,
        } = *ctx;
        let batch_size = batch.batch_size();
        let total_atoms = batch.total_atoms();
        let use_ks = self.config.use_ks;
        let terminal = t == 1;

        let conditioning: Vec<DVector<f64>> = batch
            .sg_condition
            .iter()
            .map(|sg| self.time_embedding.conditioning(t, sg))
            .collect();
        let conditioning = conditioning.as_slice();

        let sigma_t = self.sigma.sigma(t);
        let sigma_norm_t = self.sigma.sigma_norm(t).sqrt();

        // Corrector half-step: annealed Langevin update of the coordinates,
        // all other channels pass through unchanged.
        let corrector_preds = network.forward(&NetworkInput {
            conditioning,
            atom_type_probs: &state.atom_types,
            frac_coords: &state.frac_coords,
            lattice_feats: if use_ks {
                LatticeFeatures::Ks(&state.ks)
            } else {
                LatticeFeatures::Matrices(&state.lattices)
            },
            lattices: &state.lattices,
            num_atoms: &batch.num_atoms,
            batch_index,
            site_symm_probs: &state.site_symm,
        })?;
        validate_predictions(&corrector_preds, total_atoms, batch_size, use_ks)?;

        let step_size = step_lr * (sigma_t / self.sigma.sigma_begin()).powi(2);
        let std_x = (2.0 * step_size).sqrt();
        let coords_half: Vec<Vector3<f64>> = if keep_coords {
            state.frac_coords.clone()
        } else {
            state
                .frac_coords
                .iter()
                .zip(&corrector_preds.coord_score)
                .map(|(x, score)| {
                    let z = if terminal {
                        Vector3::zeros()
                    } else {
                        noising::randn_vector3(rng)
                    };
                    wrap_frac(&(x - score * sigma_norm_t * step_size + z * std_x))
                })
                .collect()
        };

        // Predictor step: a second Langevin-style coordinate update sized by
        // the adjacent sigmas, ancestral sampling for the other channels.
        let predictor_preds = network.forward(&NetworkInput {
            conditioning,
            atom_type_probs: &state.atom_types,
            frac_coords: &coords_half,
            lattice_feats: if use_ks {
                LatticeFeatures::Ks(&state.ks)
            } else {
                LatticeFeatures::Matrices(&state.lattices)
            },
            lattices: &state.lattices,
            num_atoms: &batch.num_atoms,
            batch_index,
            site_symm_probs: &state.site_symm,
        })?;
        validate_predictions(&predictor_preds, total_atoms, batch_size, use_ks)?;

        let adjacent_sigma = self.sigma.sigma(t - 1);
        let pred_step = sigma_t * sigma_t - adjacent_sigma * adjacent_sigma;
        let pred_std =
            ((adjacent_sigma * adjacent_sigma * pred_step) / (sigma_t * sigma_t)).sqrt();
        let next_coords: Vec<Vector3<f64>> = if keep_coords {
            state.frac_coords.clone()
        } else {
            coords_half
                .iter()
                .zip(&predictor_preds.coord_score)
                .map(|(x, score)| {
                    let z = if terminal {
                        Vector3::zeros()
                    } else {
                        noising::randn_vector3(rng)
                    };
                    wrap_frac(&(x - score * sigma_norm_t * pred_step + z * pred_std))
                })
                .collect()
        };

        let ancestral = |channel: Channel| -> (f64, f64, f64) {
            let alpha = self.beta.alpha(t, channel);
            let alpha_cumprod = self.beta.alpha_cumprod(t, channel);
            let c0 = 1.0 / alpha.sqrt();
            let c1 = (1.0 - alpha) / (1.0 - alpha_cumprod).sqrt();
            (c0, c1, self.beta.sigma(t, channel))
        };

        let (next_ks, next_lattices) = if keep_lattice {
            (state.ks.clone(), state.lattices.clone())
        } else {
            let (c0, c1, noise_scale) = ancestral(Channel::Lattice);
            if use_ks {
                let next_ks: Vec<Vector6<f64>> = match &predictor_preds.lattice {
                    LatticeDelta::Ks(pred) => state
                        .ks
                        .iter()
                        .zip(pred)
                        .enumerate()
                        .map(|(i, (k, delta))| {
                            let z = if terminal {
                                Vector6::zeros()
                            } else {
                                noising::randn_vector6(rng)
                            };
                            constraints[i].apply(&((k - delta * c1) * c0 + z * noise_scale))
                        })
                        .collect(),
                    LatticeDelta::Matrices(_) => {
                        return Err(EngineError::Network(
                            "expected a ks-form lattice delta".into(),
                        ));
                    }
                };
                let next_lattices = next_ks.iter().map(ks_to_matrix).collect();
                (next_ks, next_lattices)
            } else {
                let next_lattices: Vec<Matrix3<f64>> = match &predictor_preds.lattice {
                    LatticeDelta::Matrices(pred) => state
                        .lattices
                        .iter()
                        .zip(pred)
                        .map(|(l, delta)| {
                            let z = if terminal {
                                Matrix3::zeros()
                            } else {
                                noising::randn_matrix3(rng)
                            };
                            (l - delta * c1) * c0 + z * noise_scale
                        })
                        .collect(),
                    LatticeDelta::Ks(_) => {
                        return Err(EngineError::Network(
                            "expected a matrix-form lattice delta".into(),
                        ));
                    }
                };
                (state.ks.clone(), next_lattices)
            }
        };

        let (c0_atom, c1_atom, atom_noise) = ancestral(Channel::Atom);
        let next_types: Vec<DVector<f64>> = state
            .atom_types
            .iter()
            .zip(&predictor_preds.atom_types)
            .map(|(v, delta)| {
                let z = if terminal {
                    DVector::zeros(MAX_ATOMIC_NUM)
                } else {
                    noising::randn_dvector(MAX_ATOMIC_NUM, rng)
                };
                (v - delta * c1_atom) * c0_atom + z * atom_noise
            })
            .collect();

        let (c0_symm, c1_symm, symm_noise) = ancestral(Channel::SiteSymm);
        let next_symm: Vec<DVector<f64>> = state
            .site_symm
            .iter()
            .zip(&predictor_preds.site_symm)
            .enumerate()
            .map(|(i, (v, delta))| {
                let z = if terminal {
                    DVector::zeros(SITE_SYMM_DIM)
                } else {
                    noising::randn_dvector(SITE_SYMM_DIM, rng)
                };
                let next = (v - delta * c1_symm) * c0_symm + z * symm_noise;
                match ss_masks {
                    Some(masks) => next.component_mul(&masks[i]),
                    None => next,
                }
            })
            .collect();

        Ok(TrajectoryStep {
            frac_coords: next_coords,
            atom_types: next_types,
            site_symm: next_symm,
            lattices: next_lattices,
            ks: next_ks,
        })
    }

    fn ks_constraints(&self, spacegroups: &[u16]) -> Result<Vec<KsConstraint>, EngineError> {
        spacegroups
            .iter()
            .map(|&sg| KsConstraint::for_spacegroup(sg).map_err(EngineError::from))
            .collect()
    }

    /// Per-atom flattened feasibility masks, or `None` when masking is
    /// disabled.
    fn site_symm_masks(
        &self,
        spacegroups: &[u16],
        batch_index: &[usize],
        registry: &SpaceGroupRegistry,
    ) -> Result<Option<Vec<DVector<f64>>>, EngineError> {
        if !self.config.mask_site_symm {
            return Ok(None);
        }
        let per_crystal: Vec<DVector<f64>> = spacegroups
            .iter()
            .map(|&sg| Ok(registry.feasibility_mask(sg)?.flatten()))
            .collect::<Result<_, EngineError>>()?;
        Ok(Some(
            batch_index
                .iter()
                .map(|&crystal| per_crystal[crystal].clone())
                .collect(),
        ))
    }
}

fn mean_squared_error(
    predictions: impl Iterator<Item = f64>,
    targets: impl Iterator<Item = f64>,
) -> f64 {
    let mut acc = 0.0;
    let mut count = 0usize;
    for (p, t) in predictions.zip(targets) {
        let d = p - t;
        acc += d * d;
        count += 1;
    }
    acc / count.max(1) as f64
}

fn validate_predictions(
    preds: &NetworkPredictions,
    total_atoms: usize,
    batch_size: usize,
    use_ks: bool,
) -> Result<(), EngineError> {
    let lattice_len = match &preds.lattice {
        LatticeDelta::Ks(v) => {
            if !use_ks {
                return Err(EngineError::Network(
                    "expected a matrix-form lattice delta".into(),
                ));
            }
            v.len()
        }
        LatticeDelta::Matrices(v) => {
            if use_ks {
                return Err(EngineError::Network(
                    "expected a ks-form lattice delta".into(),
                ));
            }
            v.len()
        }
    };
    if lattice_len != batch_size {
        return Err(EngineError::Network(format!(
            "lattice delta covers {lattice_len} crystals, expected {batch_size}"
        )));
    }
    for (name, len) in [
        ("coord_score", preds.coord_score.len()),
        ("atom_types", preds.atom_types.len()),
        ("site_symm", preds.site_symm.len()),
    ] {
        if len != total_atoms {
            return Err(EngineError::Network(format!(
                "{name} covers {len} atoms, expected {total_atoms}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::batch::SG_CONDITION_DIM;
    use crate::core::models::site_symmetry::{SITE_SYMM_AXES, SITE_SYMM_PGS, SiteSymmetry};
    use crate::core::symmetry::lookup::{SymmetryLookup, WyckoffPosition};
    use crate::core::symmetry::ops::SymmetryOp;
    use crate::engine::config::{DiffusionConfigBuilder, ScheduleConfig};
    use crate::engine::schedule::BetaScheduleMode;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::cell::RefCell;

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

    /// Records the inputs it sees and answers with zero predictions.
    #[derive(Default)]
    struct CapturingNetwork {
        seen_ks: RefCell<Vec<Vec<Vector6<f64>>>>,
        seen_lattices: RefCell<Vec<Vec<Matrix3<f64>>>>,
        seen_coords: RefCell<Vec<Vec<Vector3<f64>>>>,
        seen_site_symm: RefCell<Vec<Vec<DVector<f64>>>>,
    }

    impl DenoisingNetwork for CapturingNetwork {
        fn forward(&self, input: &NetworkInput<'_>) -> Result<NetworkPredictions, EngineError> {
            if let LatticeFeatures::Ks(ks) = input.lattice_feats {
                self.seen_ks.borrow_mut().push(ks.to_vec());
            }
            self.seen_lattices.borrow_mut().push(input.lattices.to_vec());
            self.seen_coords.borrow_mut().push(input.frac_coords.to_vec());
            self.seen_site_symm
                .borrow_mut()
                .push(input.site_symm_probs.to_vec());

            let atoms = input.frac_coords.len();
            let lattice = match input.lattice_feats {
                LatticeFeatures::Ks(ks) => LatticeDelta::Ks(vec![Vector6::zeros(); ks.len()]),
                LatticeFeatures::Matrices(ls) => {
                    LatticeDelta::Matrices(vec![Matrix3::zeros(); ls.len()])
                }
            };
            Ok(NetworkPredictions {
                lattice,
                coord_score: vec![Vector3::zeros(); atoms],
                atom_types: vec![DVector::zeros(MAX_ATOMIC_NUM); atoms],
                site_symm: vec![DVector::zeros(SITE_SYMM_DIM); atoms],
            })
        }
    }

    fn test_batch() -> CrystalBatch {
        CrystalBatch {
            num_atoms: vec![2, 1],
            frac_coords: vec![
                Vector3::new(0.1, 0.2, 0.3),
                Vector3::new(0.6, 0.7, 0.8),
                Vector3::new(0.25, 0.5, 0.75),
            ],
            atom_types: vec![6, 8, 26],
            site_symm: vec![SiteSymmetry::from_axis_categories(&[0; SITE_SYMM_AXES]); 3],
            coord_loss_weight: vec![1.0; 3],
            ks: vec![
                Vector6::new(0.0, 0.0, 0.0, 0.1, -0.05, 1.1),
                Vector6::new(0.0, 0.0, 0.0, 0.0, 0.2, 0.9),
            ],
            lengths: vec![Vector3::new(4.0, 5.0, 6.0); 2],
            angles: vec![Vector3::new(85.0, 95.0, 100.0); 2],
            spacegroup: vec![1, 1],
            sg_condition: vec![DVector::zeros(SG_CONDITION_DIM); 2],
        }
    }

    fn engine_with_costs(cost_lattice: f64, mask_site_symm: bool) -> DiffusionEngine {
        let config = DiffusionConfigBuilder::new()
            .cost_lattice(cost_lattice)
            .cost_coord(1.0)
            .cost_type(1.0)
            .cost_site_symm(1.0)
            .mask_site_symm(mask_site_symm)
            .time_dim(16)
            .build()
            .unwrap();
        let schedule = ScheduleConfig {
            timesteps: 20,
            beta_mode: BetaScheduleMode::Cosine { s: 0.008 },
            sigma_begin: 0.01,
            sigma_end: 0.5,
        };
        DiffusionEngine::new(config, &schedule).unwrap()
    }

    fn registry() -> SpaceGroupRegistry {
        SpaceGroupRegistry::build(Box::new(TriclinicProvider::new())).unwrap()
    }

    #[test]
    fn forward_loss_components_are_finite_and_nonnegative() {
        let engine = engine_with_costs(1.0, false);
        let mut rng = StdRng::seed_from_u64(2);
        let losses = engine
            .forward_loss(&test_batch(), &CapturingNetwork::default(), &registry(), &mut rng)
            .unwrap();
        assert!(losses.is_finite());
        for value in [
            losses.lattice,
            losses.coord,
            losses.atom_type,
            losses.site_symm,
        ] {
            assert!(value >= 0.0 && value.is_finite());
        }
        assert!(
            (losses.total
                - (losses.lattice + losses.coord + losses.atom_type + losses.site_symm))
                .abs()
                < 1e-12
        );
    }

    #[test]
    fn zero_lattice_cost_feeds_ground_truth_to_the_network() {
        let engine = engine_with_costs(0.0, false);
        let network = CapturingNetwork::default();
        let batch = test_batch();
        let mut rng = StdRng::seed_from_u64(3);
        engine
            .forward_loss(&batch, &network, &registry(), &mut rng)
            .unwrap();

        let seen = network.seen_ks.borrow();
        assert_eq!(seen.len(), 1);
        // Never corrupted: bitwise equality with the input batch.
        assert_eq!(seen[0], batch.ks);
    }

    #[test]
    fn noised_coordinates_reach_the_network_wrapped() {
        let engine = engine_with_costs(1.0, false);
        let network = CapturingNetwork::default();
        let mut rng = StdRng::seed_from_u64(5);
        engine
            .forward_loss(&test_batch(), &network, &registry(), &mut rng)
            .unwrap();

        for coords in network.seen_coords.borrow().iter() {
            for x in coords {
                for c in 0..3 {
                    assert!((0.0..1.0).contains(&x[c]));
                }
            }
        }
    }

    #[test]
    fn feasibility_mask_zeroes_infeasible_site_symm_channels() {
        let engine = engine_with_costs(1.0, true);
        let network = CapturingNetwork::default();
        let mut rng = StdRng::seed_from_u64(7);
        engine
            .forward_loss(&test_batch(), &network, &registry(), &mut rng)
            .unwrap();

        // The fixture group only reaches category 0 on every axis.
        for probs in network.seen_site_symm.borrow().iter() {
            for atom in probs {
                for axis in 0..SITE_SYMM_AXES {
                    for pg in 1..SITE_SYMM_PGS {
                        assert_eq!(atom[axis * SITE_SYMM_PGS + pg], 0.0);
                    }
                }
            }
        }
    }

    #[test]
    fn sampling_records_a_snapshot_per_timestep() {
        let engine = engine_with_costs(1.0, false);
        let mut rng = StdRng::seed_from_u64(11);
        let trajectory = engine
            .sample(
                &test_batch(),
                &CapturingNetwork::default(),
                &registry(),
                &SampleConfig::default(),
                &ProgressReporter::new(),
                &mut rng,
            )
            .unwrap();
        assert!(trajectory.is_complete());
        assert_eq!(trajectory.len(), 21);
        assert!(trajectory.final_step().is_some());
    }

    #[test]
    fn mismatched_network_output_is_rejected() {
        struct WrongFormNetwork;
        impl DenoisingNetwork for WrongFormNetwork {
            fn forward(
                &self,
                input: &NetworkInput<'_>,
            ) -> Result<NetworkPredictions, EngineError> {
                let atoms = input.frac_coords.len();
                Ok(NetworkPredictions {
                    lattice: LatticeDelta::Matrices(vec![Matrix3::zeros(); input.lattices.len()]),
                    coord_score: vec![Vector3::zeros(); atoms],
                    atom_types: vec![DVector::zeros(MAX_ATOMIC_NUM); atoms],
                    site_symm: vec![DVector::zeros(SITE_SYMM_DIM); atoms],
                })
            }
        }

        let engine = engine_with_costs(1.0, false);
        let mut rng = StdRng::seed_from_u64(13);
        let result =
            engine.forward_loss(&test_batch(), &WrongFormNetwork, &registry(), &mut rng);
        assert!(matches!(result, Err(EngineError::Network(_))));
    }
}
