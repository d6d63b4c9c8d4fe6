//! Lattice representation conversions: crystallographic lengths/angles, the
//! 3x3 row-vector matrix form, and the reduced 6-parameter `ks` form used by
//! the lattice diffusion channel.
//!
//! The reduced form stores the coefficients of the symmetric matrix logarithm
//! of the lattice, `L = exp(k1*B1 + ... + k6*B6)`, over a fixed basis of
//! symmetric 3x3 matrices (three off-diagonal couplings, two traceless
//! diagonal modes, one trace mode). Crystal-family constraints then become a
//! binary mask over the six coefficients plus a constant additive offset,
//! which is how the per-space-group constraint is enforced after every
//! noising or denoising update.

use nalgebra::{Matrix3, SymmetricEigen, Vector3, Vector6};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LatticeError {
    #[error("space group {0} outside [1, 230]")]
    SpaceGroupOutOfRange(u16),

    #[error("lattice matrix is not symmetric positive definite")]
    NotPositiveDefinite,
}

/// The seven crystal families, resolved from the space-group number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrystalFamily {
    Triclinic,
    Monoclinic,
    Orthorhombic,
    Tetragonal,
    Hexagonal,
    Cubic,
}

impl CrystalFamily {
    /// Trigonal groups (143..=167) share hexagonal axes here.
    pub fn from_spacegroup(spacegroup: u16) -> Result<Self, LatticeError> {
        match spacegroup {
            1..=2 => Ok(Self::Triclinic),
            3..=15 => Ok(Self::Monoclinic),
            16..=74 => Ok(Self::Orthorhombic),
            75..=142 => Ok(Self::Tetragonal),
            143..=194 => Ok(Self::Hexagonal),
            195..=230 => Ok(Self::Cubic),
            _ => Err(LatticeError::SpaceGroupOutOfRange(spacegroup)),
        }
    }
}

/// Builds the row-vector lattice matrix from lengths (angstrom) and angles
/// (degrees), with the `a` axis in the x-z plane and `c` along z.
pub fn lattice_params_to_matrix(lengths: &Vector3<f64>, angles: &Vector3<f64>) -> Matrix3<f64> {
    let (a, b, c) = (lengths[0], lengths[1], lengths[2]);
    let alpha = angles[0].to_radians();
    let beta = angles[1].to_radians();
    let gamma = angles[2].to_radians();

    let val = (alpha.cos() * beta.cos() - gamma.cos()) / (alpha.sin() * beta.sin());
    let gamma_star = val.clamp(-1.0, 1.0).acos();

    Matrix3::new(
        a * beta.sin(),
        0.0,
        a * beta.cos(),
        -b * alpha.sin() * gamma_star.cos(),
        b * alpha.sin() * gamma_star.sin(),
        b * alpha.cos(),
        0.0,
        0.0,
        c,
    )
}

/// Recovers lengths (angstrom) and angles (degrees) from a row-vector
/// lattice matrix.
pub fn matrix_to_lattice_params(matrix: &Matrix3<f64>) -> (Vector3<f64>, Vector3<f64>) {
    let rows: [Vector3<f64>; 3] = [
        matrix.row(0).transpose(),
        matrix.row(1).transpose(),
        matrix.row(2).transpose(),
    ];
    let lengths = Vector3::new(rows[0].norm(), rows[1].norm(), rows[2].norm());
    let angle = |u: &Vector3<f64>, v: &Vector3<f64>| {
        (u.dot(v) / (u.norm() * v.norm()))
            .clamp(-1.0, 1.0)
            .acos()
            .to_degrees()
    };
    let angles = Vector3::new(
        angle(&rows[1], &rows[2]),
        angle(&rows[0], &rows[2]),
        angle(&rows[0], &rows[1]),
    );
    (lengths, angles)
}

fn symmetric_exp(s: &Matrix3<f64>) -> Matrix3<f64> {
    let eigen = SymmetricEigen::new(*s);
    let exp_diag = Matrix3::from_diagonal(&eigen.eigenvalues.map(f64::exp));
    eigen.eigenvectors * exp_diag * eigen.eigenvectors.transpose()
}

fn symmetric_log(m: &Matrix3<f64>) -> Result<Matrix3<f64>, LatticeError> {
    let symmetrized = (m + m.transpose()) * 0.5;
    if (m - symmetrized).norm() > 1e-8 * (1.0 + m.norm()) {
        return Err(LatticeError::NotPositiveDefinite);
    }
    let eigen = SymmetricEigen::new(symmetrized);
    if eigen.eigenvalues.iter().any(|&l| l <= 0.0) {
        return Err(LatticeError::NotPositiveDefinite);
    }
    let log_diag = Matrix3::from_diagonal(&eigen.eigenvalues.map(f64::ln));
    Ok(eigen.eigenvectors * log_diag * eigen.eigenvectors.transpose())
}

/// Expands the reduced parameters into the symmetric lattice matrix
/// `exp(sum_i k_i B_i)`.
pub fn ks_to_matrix(ks: &Vector6<f64>) -> Matrix3<f64> {
    let s = Matrix3::new(
        ks[3] + ks[4] + ks[5],
        ks[0],
        ks[1],
        ks[0],
        -ks[3] + ks[4] + ks[5],
        ks[2],
        ks[1],
        ks[2],
        -2.0 * ks[4] + ks[5],
    );
    symmetric_exp(&s)
}

/// Projects a symmetric positive-definite lattice matrix back onto the six
/// basis coefficients. Inverse of [`ks_to_matrix`] up to eigensolver
/// tolerance.
pub fn matrix_to_ks(matrix: &Matrix3<f64>) -> Result<Vector6<f64>, LatticeError> {
    let s = symmetric_log(matrix)?;
    let trace_third = (s[(0, 0)] + s[(1, 1)] + s[(2, 2)]) / 3.0;
    Ok(Vector6::new(
        s[(0, 1)],
        s[(0, 2)],
        s[(1, 2)],
        (s[(0, 0)] - s[(1, 1)]) / 2.0,
        (s[(0, 0)] + s[(1, 1)]) / 2.0 - trace_third,
        trace_third,
    ))
}

/// Per-space-group constraint on the reduced lattice parameters: a binary
/// mask over the six coefficients marking which are free, and an additive
/// offset supplying the constrained ones.
#[derive(Debug, Clone, PartialEq)]
pub struct KsConstraint {
    pub mask: Vector6<f64>,
    pub offset: Vector6<f64>,
}

/// Fixed off-diagonal coefficient of the hexagonal family (gamma = 120).
const HEX_COUPLING: f64 = -0.27465307216702745; // -ln(3)/4

impl KsConstraint {
    pub fn for_spacegroup(spacegroup: u16) -> Result<Self, LatticeError> {
        let family = CrystalFamily::from_spacegroup(spacegroup)?;
        let (mask, offset) = match family {
            CrystalFamily::Triclinic => (Vector6::repeat(1.0), Vector6::zeros()),
            CrystalFamily::Monoclinic => (
                Vector6::new(0.0, 1.0, 0.0, 1.0, 1.0, 1.0),
                Vector6::zeros(),
            ),
            CrystalFamily::Orthorhombic => (
                Vector6::new(0.0, 0.0, 0.0, 1.0, 1.0, 1.0),
                Vector6::zeros(),
            ),
            CrystalFamily::Tetragonal => (
                Vector6::new(0.0, 0.0, 0.0, 0.0, 1.0, 1.0),
                Vector6::zeros(),
            ),
            CrystalFamily::Hexagonal => (
                Vector6::new(0.0, 0.0, 0.0, 0.0, 1.0, 1.0),
                Vector6::new(HEX_COUPLING, 0.0, 0.0, 0.0, 0.0, 0.0),
            ),
            CrystalFamily::Cubic => (
                Vector6::new(0.0, 0.0, 0.0, 0.0, 0.0, 1.0),
                Vector6::zeros(),
            ),
        };
        Ok(Self { mask, offset })
    }

    /// Re-projects reduced parameters onto the constraint surface:
    /// `ks * mask + offset`. Idempotent, since the offset only feeds
    /// masked-out components.
    pub fn apply(&self, ks: &Vector6<f64>) -> Vector6<f64> {
        ks.component_mul(&self.mask) + self.offset
    }
}
