use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::error::EngineError;
use super::wrapped::sigma_norm_estimate;

/// Channels routed through the discrete variance-preserving schedule. Each
/// channel selects its own column of the coefficient tables, so per-channel
/// schedule variants can coexist in one schedule object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Lattice,
    Atom,
    SiteSymm,
}

pub const NUM_CHANNELS: usize = 3;

impl Channel {
    #[inline]
    fn index(self) -> usize {
        match self {
            Channel::Lattice => 0,
            Channel::Atom => 1,
            Channel::SiteSymm => 2,
        }
    }
}

/// Variance-preserving beta schedule variants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BetaScheduleMode {
    Cosine { s: f64 },
    Linear { beta_start: f64, beta_end: f64 },
}

fn beta_sequence(timesteps: usize, mode: BetaScheduleMode) -> Result<Vec<f64>, EngineError> {
    match mode {
        BetaScheduleMode::Cosine { s } => {
            if s <= 0.0 {
                return Err(EngineError::Schedule(format!(
                    "cosine offset must be positive, got {s}"
                )));
            }
            let steps = timesteps + 1;
            let f = |i: usize| {
                let x = i as f64 / timesteps as f64;
                (((x + s) / (1.0 + s)) * std::f64::consts::FRAC_PI_2)
                    .cos()
                    .powi(2)
            };
            let f0 = f(0);
            let mut betas = Vec::with_capacity(timesteps);
            let mut prev = 1.0;
            for i in 1..steps {
                let curr = f(i) / f0;
                betas.push((1.0 - curr / prev).clamp(1e-4, 0.9999));
                prev = curr;
            }
            Ok(betas)
        }
        BetaScheduleMode::Linear {
            beta_start,
            beta_end,
        } => {
            if !(0.0 < beta_start && beta_start <= beta_end && beta_end < 1.0) {
                return Err(EngineError::Schedule(format!(
                    "linear betas must satisfy 0 < start <= end < 1, got [{beta_start}, {beta_end}]"
                )));
            }
            let betas = (0..timesteps)
                .map(|i| {
                    if timesteps == 1 {
                        beta_start
                    } else {
                        beta_start + (beta_end - beta_start) * i as f64 / (timesteps - 1) as f64
                    }
                })
                .collect();
            Ok(betas)
        }
    }
}

/// Discrete-time variance-preserving schedule shared by the lattice,
/// atom-type, and site-symmetry channels.
///
/// All tables are indexed by timestep `0..=T`, with the `t = 0` row fixed to
/// the noise-free values (`beta = 0`, `alpha_cumprod = 1`).
#[derive(Debug, Clone)]
pub struct BetaSchedule {
    timesteps: usize,
    alphas: Vec<[f64; NUM_CHANNELS]>,
    alphas_cumprod: Vec<[f64; NUM_CHANNELS]>,
    sigmas: Vec<[f64; NUM_CHANNELS]>,
}

impl BetaSchedule {
    /// Builds a schedule using one mode for every channel.
    pub fn new(timesteps: usize, mode: BetaScheduleMode) -> Result<Self, EngineError> {
        Self::with_channel_modes(timesteps, [mode; NUM_CHANNELS])
    }

    /// Builds a schedule with a per-channel mode, ordered as
    /// `[Lattice, Atom, SiteSymm]`.
    pub fn with_channel_modes(
        timesteps: usize,
        modes: [BetaScheduleMode; NUM_CHANNELS],
    ) -> Result<Self, EngineError> {
        if timesteps == 0 {
            return Err(EngineError::Schedule(
                "schedule needs at least one timestep".into(),
            ));
        }

        let mut alphas = vec![[1.0; NUM_CHANNELS]; timesteps + 1];
        let mut alphas_cumprod = vec![[1.0; NUM_CHANNELS]; timesteps + 1];
        let mut sigmas = vec![[0.0; NUM_CHANNELS]; timesteps + 1];

        for (channel, mode) in modes.into_iter().enumerate() {
            let betas = beta_sequence(timesteps, mode)?;
            let mut cumprod = 1.0;
            for t in 1..=timesteps {
                let beta = betas[t - 1];
                let alpha = 1.0 - beta;
                let prev_cumprod = cumprod;
                cumprod *= alpha;
                alphas[t][channel] = alpha;
                alphas_cumprod[t][channel] = cumprod;
                sigmas[t][channel] = (beta * (1.0 - prev_cumprod) / (1.0 - cumprod)).sqrt();
            }
        }

        Ok(Self {
            timesteps,
            alphas,
            alphas_cumprod,
            sigmas,
        })
    }

    pub fn timesteps(&self) -> usize {
        self.timesteps
    }

    pub fn alpha(&self, t: usize, channel: Channel) -> f64 {
        self.alphas[t][channel.index()]
    }

    pub fn alpha_cumprod(&self, t: usize, channel: Channel) -> f64 {
        self.alphas_cumprod[t][channel.index()]
    }

    /// Ancestral-sampling noise scale at step `t`.
    pub fn sigma(&self, t: usize, channel: Channel) -> f64 {
        self.sigmas[t][channel.index()]
    }

    /// Forward-noising signal coefficient `sqrt(alpha_cumprod)`.
    pub fn signal_coeff(&self, t: usize, channel: Channel) -> f64 {
        self.alpha_cumprod(t, channel).sqrt()
    }

    /// Forward-noising noise coefficient `sqrt(1 - alpha_cumprod)`.
    pub fn noise_coeff(&self, t: usize, channel: Channel) -> f64 {
        (1.0 - self.alpha_cumprod(t, channel)).sqrt()
    }

    /// Draws a training timestep uniformly from `[1, T]`.
    pub fn uniform_sample_t<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        rng.gen_range(1..=self.timesteps)
    }
}

/// Number of Monte-Carlo samples behind each score-normalization entry.
const SIGMA_NORM_SAMPLES: usize = 4096;

/// Continuous noise-magnitude schedule of the coordinate channel: a
/// geometric sequence of sigmas from `sigma_begin` at `t = 1` to
/// `sigma_end` at `t = T`, plus the normalization table for the score
/// regression target. Index 0 is pinned to the noise-free state.
#[derive(Debug, Clone)]
pub struct SigmaSchedule {
    timesteps: usize,
    sigma_begin: f64,
    sigmas: Vec<f64>,
    sigmas_norm: Vec<f64>,
}

impl SigmaSchedule {
    pub fn new(timesteps: usize, sigma_begin: f64, sigma_end: f64) -> Result<Self, EngineError> {
        if timesteps == 0 {
            return Err(EngineError::Schedule(
                "schedule needs at least one timestep".into(),
            ));
        }
        if !(sigma_begin > 0.0 && sigma_end > 0.0) {
            return Err(EngineError::Schedule(format!(
                "sigmas must be positive, got [{sigma_begin}, {sigma_end}]"
            )));
        }

        let log_begin = sigma_begin.ln();
        let log_end = sigma_end.ln();
        let mut sigmas = Vec::with_capacity(timesteps + 1);
        sigmas.push(0.0);
        for t in 1..=timesteps {
            let frac = if timesteps == 1 {
                0.0
            } else {
                (t - 1) as f64 / (timesteps - 1) as f64
            };
            sigmas.push((log_begin + (log_end - log_begin) * frac).exp());
        }

        let mut rng = StdRng::seed_from_u64(0);
        let mut sigmas_norm = Vec::with_capacity(timesteps + 1);
        sigmas_norm.push(1.0);
        for &sigma in &sigmas[1..] {
            sigmas_norm.push(sigma_norm_estimate(sigma, SIGMA_NORM_SAMPLES, &mut rng));
        }

        Ok(Self {
            timesteps,
            sigma_begin,
            sigmas,
            sigmas_norm,
        })
    }

    pub fn timesteps(&self) -> usize {
        self.timesteps
    }

    /// Noise magnitude at `t = 1`, the reference scale of the Langevin
    /// corrector step size.
    pub fn sigma_begin(&self) -> f64 {
        self.sigma_begin
    }

    pub fn sigma(&self, t: usize) -> f64 {
        self.sigmas[t]
    }

    pub fn sigma_norm(&self, t: usize) -> f64 {
        self.sigmas_norm[t]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn signal_and_noise_coefficients_are_variance_preserving() {
        let schedule = BetaSchedule::new(100, BetaScheduleMode::Cosine { s: 0.008 }).unwrap();
        for t in 0..=100 {
            for channel in [Channel::Lattice, Channel::Atom, Channel::SiteSymm] {
                let c0 = schedule.signal_coeff(t, channel);
                let c1 = schedule.noise_coeff(t, channel);
                assert!((c0 * c0 + c1 * c1 - 1.0).abs() < 1e-12, "t = {t}");
            }
        }
    }

    #[test]
    fn cumulative_signal_decays_monotonically() {
        let schedule = BetaSchedule::new(
            50,
            BetaScheduleMode::Linear {
                beta_start: 1e-4,
                beta_end: 0.02,
            },
        )
        .unwrap();
        for t in 1..=50 {
            assert!(
                schedule.alpha_cumprod(t, Channel::Atom)
                    < schedule.alpha_cumprod(t - 1, Channel::Atom)
            );
        }
        assert_eq!(schedule.alpha_cumprod(0, Channel::Atom), 1.0);
    }

    #[test]
    fn channel_modes_route_to_independent_columns() {
        let schedule = BetaSchedule::with_channel_modes(
            20,
            [
                BetaScheduleMode::Cosine { s: 0.008 },
                BetaScheduleMode::Linear {
                    beta_start: 1e-4,
                    beta_end: 0.02,
                },
                BetaScheduleMode::Cosine { s: 0.008 },
            ],
        )
        .unwrap();
        assert_ne!(
            schedule.alpha_cumprod(10, Channel::Lattice),
            schedule.alpha_cumprod(10, Channel::Atom)
        );
        assert_eq!(
            schedule.alpha_cumprod(10, Channel::Lattice),
            schedule.alpha_cumprod(10, Channel::SiteSymm)
        );
    }

    #[test]
    fn first_ancestral_sigma_is_zero() {
        let schedule = BetaSchedule::new(10, BetaScheduleMode::Cosine { s: 0.008 }).unwrap();
        for channel in [Channel::Lattice, Channel::Atom, Channel::SiteSymm] {
            assert_eq!(schedule.sigma(0, channel), 0.0);
            assert_eq!(schedule.sigma(1, channel), 0.0);
            assert!(schedule.sigma(2, channel) > 0.0);
        }
    }

    #[test]
    fn uniform_timestep_sampling_stays_in_range() {
        let schedule = BetaSchedule::new(10, BetaScheduleMode::Cosine { s: 0.008 }).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..1000 {
            let t = schedule.uniform_sample_t(&mut rng);
            assert!((1..=10).contains(&t));
        }
    }

    #[test]
    fn sigmas_interpolate_geometrically() {
        let schedule = SigmaSchedule::new(11, 0.01, 1.0).unwrap();
        assert_eq!(schedule.sigma(0), 0.0);
        assert!((schedule.sigma(1) - 0.01).abs() < 1e-12);
        assert!((schedule.sigma(11) - 1.0).abs() < 1e-12);
        // Geometric: constant ratio between consecutive sigmas.
        let r = schedule.sigma(2) / schedule.sigma(1);
        for t in 2..11 {
            assert!((schedule.sigma(t + 1) / schedule.sigma(t) - r).abs() < 1e-9);
        }
    }

    #[test]
    fn sigma_norm_table_is_pinned_at_zero() {
        let schedule = SigmaSchedule::new(5, 0.01, 0.5).unwrap();
        assert_eq!(schedule.sigma_norm(0), 1.0);
        for t in 1..=5 {
            assert!(schedule.sigma_norm(t) > 0.0);
        }
    }

    #[test]
    fn rejects_degenerate_parameters() {
        assert!(matches!(
            BetaSchedule::new(0, BetaScheduleMode::Cosine { s: 0.008 }),
            Err(EngineError::Schedule(_))
        ));
        assert!(matches!(
            SigmaSchedule::new(10, -0.1, 0.5),
            Err(EngineError::Schedule(_))
        ));
        assert!(matches!(
            BetaSchedule::new(
                10,
                BetaScheduleMode::Linear {
                    beta_start: 0.5,
                    beta_end: 0.1
                }
            ),
            Err(EngineError::Schedule(_))
        ));
    }
}
