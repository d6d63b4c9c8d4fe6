use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::schedule::BetaScheduleMode;

/// Cost weights below this threshold disable the corresponding noising
/// channel entirely (ground truth is fed through instead).
pub const COST_EPSILON: f64 = 1e-5;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Failed to read configuration file: {0}")]
    Io(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Hyperparameters of the joint diffusion process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffusionConfig {
    pub cost_lattice: f64,
    pub cost_coord: f64,
    pub cost_type: f64,
    pub cost_site_symm: f64,
    /// Diffuse the lattice in the reduced 6-parameter form rather than the
    /// raw 3x3 matrix.
    #[serde(default = "default_use_ks")]
    pub use_ks: bool,
    /// Zero out site-symmetry channels infeasible for the crystal's space
    /// group during noising, denoising, and loss computation.
    #[serde(default)]
    pub mask_site_symm: bool,
    /// Dimension of the sinusoidal part of the conditioning embedding.
    #[serde(default = "default_time_dim")]
    pub time_dim: usize,
}

fn default_use_ks() -> bool {
    true
}

fn default_time_dim() -> usize {
    256
}

impl DiffusionConfig {
    /// Lattice channel is effectively frozen: ground truth is never
    /// corrupted and the network's lattice output carries no gradient.
    pub fn keep_lattice(&self) -> bool {
        self.cost_lattice < COST_EPSILON
    }

    pub fn keep_coords(&self) -> bool {
        self.cost_coord < COST_EPSILON
    }
}

/// Parameters of the two noise schedules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub timesteps: usize,
    pub beta_mode: BetaScheduleMode,
    pub sigma_begin: f64,
    pub sigma_end: f64,
}

/// Options of a single sampling run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleConfig {
    /// Langevin corrector step-size hyperparameter.
    #[serde(default = "default_step_lr")]
    pub step_lr: f64,
    /// Substitute ground-truth coordinates for noise (partial generation).
    #[serde(default)]
    pub keep_coords: bool,
    /// Substitute the ground-truth lattice for noise (partial generation).
    #[serde(default)]
    pub keep_lattice: bool,
}

fn default_step_lr() -> f64 {
    1e-5
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            step_lr: default_step_lr(),
            keep_coords: false,
            keep_lattice: false,
        }
    }
}

/// Top-level settings document, loadable from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffusionSettings {
    pub diffusion: DiffusionConfig,
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub sample: SampleConfig,
}

impl DiffusionSettings {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml_str(&text)
    }
}

#[derive(Default)]
pub struct DiffusionConfigBuilder {
    cost_lattice: Option<f64>,
    cost_coord: Option<f64>,
    cost_type: Option<f64>,
    cost_site_symm: Option<f64>,
    use_ks: Option<bool>,
    mask_site_symm: Option<bool>,
    time_dim: Option<usize>,
}

impl DiffusionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cost_lattice(mut self, cost: f64) -> Self {
        self.cost_lattice = Some(cost);
        self
    }
    pub fn cost_coord(mut self, cost: f64) -> Self {
        self.cost_coord = Some(cost);
        self
    }
    pub fn cost_type(mut self, cost: f64) -> Self {
        self.cost_type = Some(cost);
        self
    }
    pub fn cost_site_symm(mut self, cost: f64) -> Self {
        self.cost_site_symm = Some(cost);
        self
    }
    pub fn use_ks(mut self, use_ks: bool) -> Self {
        self.use_ks = Some(use_ks);
        self
    }
    pub fn mask_site_symm(mut self, mask: bool) -> Self {
        self.mask_site_symm = Some(mask);
        self
    }
    pub fn time_dim(mut self, dim: usize) -> Self {
        self.time_dim = Some(dim);
        self
    }

    pub fn build(self) -> Result<DiffusionConfig, ConfigError> {
        Ok(DiffusionConfig {
            cost_lattice: self
                .cost_lattice
                .ok_or(ConfigError::MissingParameter("cost_lattice"))?,
            cost_coord: self
                .cost_coord
                .ok_or(ConfigError::MissingParameter("cost_coord"))?,
            cost_type: self
                .cost_type
                .ok_or(ConfigError::MissingParameter("cost_type"))?,
            cost_site_symm: self
                .cost_site_symm
                .ok_or(ConfigError::MissingParameter("cost_site_symm"))?,
            use_ks: self.use_ks.unwrap_or_else(default_use_ks),
            mask_site_symm: self.mask_site_symm.unwrap_or(false),
            time_dim: self.time_dim.unwrap_or_else(default_time_dim),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_requires_cost_weights() {
        let result = DiffusionConfigBuilder::new()
            .cost_lattice(1.0)
            .cost_coord(1.0)
            .cost_type(1.0)
            .build();
        assert_eq!(
            result,
            Err(ConfigError::MissingParameter("cost_site_symm"))
        );
    }

    #[test]
    fn near_zero_costs_freeze_channels() {
        let config = DiffusionConfigBuilder::new()
            .cost_lattice(0.0)
            .cost_coord(1.0)
            .cost_type(1.0)
            .cost_site_symm(1.0)
            .build()
            .unwrap();
        assert!(config.keep_lattice());
        assert!(!config.keep_coords());
    }

    #[test]
    fn settings_load_from_toml() {
        let text = r#"
            [diffusion]
            cost_lattice = 1.0
            cost_coord = 1.0
            cost_type = 1.0
            cost_site_symm = 1.0
            mask_site_symm = true

            [schedule]
            timesteps = 1000
            beta_mode = { kind = "cosine", s = 0.008 }
            sigma_begin = 0.005
            sigma_end = 0.5
        "#;
        let settings = DiffusionSettings::from_toml_str(text).unwrap();
        assert!(settings.diffusion.use_ks);
        assert!(settings.diffusion.mask_site_symm);
        assert_eq!(settings.schedule.timesteps, 1000);
        assert_eq!(settings.sample.step_lr, 1e-5);
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            DiffusionSettings::from_toml_str("diffusion = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn settings_load_from_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diffusion.toml");
        std::fs::write(
            &path,
            r#"
                [diffusion]
                cost_lattice = 1.0
                cost_coord = 10.0
                cost_type = 1.0
                cost_site_symm = 1.0

                [schedule]
                timesteps = 500
                beta_mode = { kind = "linear", beta_start = 0.0001, beta_end = 0.02 }
                sigma_begin = 0.005
                sigma_end = 0.5

                [sample]
                step_lr = 0.00001
            "#,
        )
        .unwrap();

        let settings = DiffusionSettings::load(&path).unwrap();
        assert_eq!(settings.diffusion.cost_coord, 10.0);
        assert_eq!(settings.schedule.timesteps, 500);
        assert!(matches!(
            settings.schedule.beta_mode,
            BetaScheduleMode::Linear { .. }
        ));

        assert!(matches!(
            DiffusionSettings::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
