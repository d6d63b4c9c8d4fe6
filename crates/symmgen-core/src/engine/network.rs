use nalgebra::{DVector, Matrix3, Vector3, Vector6};

use super::error::EngineError;

/// Lattice features handed to the network: the reduced parameterization when
/// the lattice channel diffuses in `ks` form, the raw matrices otherwise.
#[derive(Debug, Clone, Copy)]
pub enum LatticeFeatures<'a> {
    Ks(&'a [Vector6<f64>]),
    Matrices(&'a [Matrix3<f64>]),
}

/// One denoising query: the current (noised) state of all four channels plus
/// conditioning and batch bookkeeping. All per-atom slices are in flat batch
/// order; `batch_index` maps each atom to its crystal.
#[derive(Debug)]
pub struct NetworkInput<'a> {
    /// Per-crystal time + space-group conditioning embedding.
    pub conditioning: &'a [DVector<f64>],
    /// Per-atom atom-type probabilities/logits (94 classes).
    pub atom_type_probs: &'a [DVector<f64>],
    /// Per-atom fractional coordinates in `[0, 1)^3`.
    pub frac_coords: &'a [Vector3<f64>],
    pub lattice_feats: LatticeFeatures<'a>,
    /// Per-crystal lattice matrices.
    pub lattices: &'a [Matrix3<f64>],
    pub num_atoms: &'a [usize],
    pub batch_index: &'a [usize],
    /// Per-atom flattened site-symmetry probabilities/logits (195 dims).
    pub site_symm_probs: &'a [DVector<f64>],
}

/// Predicted lattice delta, matching the representation the channel diffuses
/// in.
#[derive(Debug, Clone)]
pub enum LatticeDelta {
    Ks(Vec<Vector6<f64>>),
    Matrices(Vec<Matrix3<f64>>),
}

/// The four per-channel predictions of one denoising query.
#[derive(Debug, Clone)]
pub struct NetworkPredictions {
    pub lattice: LatticeDelta,
    /// Per-atom coordinate score (un-normalized).
    pub coord_score: Vec<Vector3<f64>>,
    /// Per-atom atom-type delta (94 classes).
    pub atom_types: Vec<DVector<f64>>,
    /// Per-atom flattened site-symmetry delta (195 dims).
    pub site_symm: Vec<DVector<f64>>,
}

/// The opaque score/denoising network shared by forward-loss computation and
/// reverse sampling. Implementations wrap whatever learned model is in use;
/// the engine only relies on this signature.
pub trait DenoisingNetwork {
    fn forward(&self, input: &NetworkInput<'_>) -> Result<NetworkPredictions, EngineError>;
}
