use nalgebra::{Matrix3, Vector3};

use crate::core::utils::periodic::wrap_frac;

/// An affine symmetry operation in fractional coordinates: a rotation part
/// and a translation part, applied modulo the unit cell.
#[derive(Debug, Clone, PartialEq)]
pub struct SymmetryOp {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl SymmetryOp {
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Self {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Inversion through the origin.
    pub fn inversion() -> Self {
        Self {
            rotation: -Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Applies the operation to a fractional coordinate and wraps the result
    /// into `[0, 1)^3`.
    pub fn apply(&self, point: &Vector3<f64>) -> Vector3<f64> {
        wrap_frac(&(self.rotation * point + self.translation))
    }
}
