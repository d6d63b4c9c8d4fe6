use nalgebra::{DVector, Matrix3, Vector3, Vector6};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::core::lattice::KsConstraint;
use crate::core::models::batch::MAX_ATOMIC_NUM;
use crate::core::utils::periodic::wrap_frac;

pub(crate) fn randn<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    rng.sample(StandardNormal)
}

pub(crate) fn randn_vector3<R: Rng + ?Sized>(rng: &mut R) -> Vector3<f64> {
    Vector3::new(randn(rng), randn(rng), randn(rng))
}

pub(crate) fn randn_vector6<R: Rng + ?Sized>(rng: &mut R) -> Vector6<f64> {
    Vector6::from_fn(|_, _| randn(rng))
}

pub(crate) fn randn_matrix3<R: Rng + ?Sized>(rng: &mut R) -> Matrix3<f64> {
    Matrix3::from_fn(|_, _| randn(rng))
}

pub(crate) fn randn_dvector<R: Rng + ?Sized>(dim: usize, rng: &mut R) -> DVector<f64> {
    DVector::from_fn(dim, |_, _| randn(rng))
}

/// Repeats one value per crystal into one value per atom, in flat order.
pub(crate) fn expand_per_atom(per_crystal: &[f64], num_atoms: &[usize]) -> Vec<f64> {
    let total = num_atoms.iter().sum();
    let mut out = Vec::with_capacity(total);
    for (&value, &n) in per_crystal.iter().zip(num_atoms) {
        out.extend(std::iter::repeat_n(value, n));
    }
    out
}

/// A forward-noised channel: the corrupted values plus the exact injected
/// noise, which is the regression target of the corresponding loss term.
pub(crate) struct NoisedChannel<T> {
    pub value: Vec<T>,
    pub noise: Vec<T>,
}

/// Variance-preserving mixing of the reduced lattice parameters, with the
/// space-group constraint re-applied after mixing so constrained parameters
/// are never corrupted.
pub(crate) fn noise_ks<R: Rng + ?Sized>(
    ks: &[Vector6<f64>],
    constraints: &[KsConstraint],
    c0: &[f64],
    c1: &[f64],
    rng: &mut R,
) -> NoisedChannel<Vector6<f64>> {
    let mut value = Vec::with_capacity(ks.len());
    let mut noise = Vec::with_capacity(ks.len());
    for (i, k) in ks.iter().enumerate() {
        let z = randn_vector6(rng);
        value.push(constraints[i].apply(&(k * c0[i] + z * c1[i])));
        noise.push(z);
    }
    NoisedChannel { value, noise }
}

/// Variance-preserving mixing of raw 3x3 lattice matrices.
pub(crate) fn noise_lattices<R: Rng + ?Sized>(
    lattices: &[Matrix3<f64>],
    c0: &[f64],
    c1: &[f64],
    rng: &mut R,
) -> NoisedChannel<Matrix3<f64>> {
    let mut value = Vec::with_capacity(lattices.len());
    let mut noise = Vec::with_capacity(lattices.len());
    for (i, l) in lattices.iter().enumerate() {
        let z = randn_matrix3(rng);
        value.push(l * c0[i] + z * c1[i]);
        noise.push(z);
    }
    NoisedChannel { value, noise }
}

/// Score-based coordinate noising: `(x + sigma * z) mod 1`. The returned
/// noise is the raw standard-normal draw, not the wrapped displacement.
pub(crate) fn noise_coords<R: Rng + ?Sized>(
    coords: &[Vector3<f64>],
    sigma_per_atom: &[f64],
    rng: &mut R,
) -> NoisedChannel<Vector3<f64>> {
    let mut value = Vec::with_capacity(coords.len());
    let mut noise = Vec::with_capacity(coords.len());
    for (i, x) in coords.iter().enumerate() {
        let z = randn_vector3(rng);
        value.push(wrap_frac(&(x + z * sigma_per_atom[i])));
        noise.push(z);
    }
    NoisedChannel { value, noise }
}

/// One-hot encoding of ground-truth element indices over the 94 classes.
pub(crate) fn one_hot_atom_types(types: &[u8]) -> Vec<DVector<f64>> {
    types
        .iter()
        .map(|&t| {
            let mut v = DVector::zeros(MAX_ATOMIC_NUM);
            v[(t - 1) as usize] = 1.0;
            v
        })
        .collect()
}

/// Variance-preserving mixing of flat per-atom vectors (atom-type one-hots
/// or flattened site-symmetry encodings). An optional per-atom mask is
/// applied multiplicatively to the mixed value; the returned noise stays
/// unmasked, the loss masks both sides itself.
pub(crate) fn noise_flat<R: Rng + ?Sized>(
    values: &[DVector<f64>],
    c0_per_atom: &[f64],
    c1_per_atom: &[f64],
    mask: Option<&[DVector<f64>]>,
    rng: &mut R,
) -> NoisedChannel<DVector<f64>> {
    let mut value = Vec::with_capacity(values.len());
    let mut noise = Vec::with_capacity(values.len());
    for (i, v) in values.iter().enumerate() {
        let z = randn_dvector(v.len(), rng);
        let mut mixed = v * c0_per_atom[i] + &z * c1_per_atom[i];
        if let Some(masks) = mask {
            mixed.component_mul_assign(&masks[i]);
        }
        value.push(mixed);
        noise.push(z);
    }
    NoisedChannel { value, noise }
}
