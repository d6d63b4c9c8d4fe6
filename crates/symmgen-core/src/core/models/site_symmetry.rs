use nalgebra::{DVector, SMatrix};

/// Number of symmetry axes in the site-symmetry encoding.
pub const SITE_SYMM_AXES: usize = 15;
/// Number of point-group categories per axis.
pub const SITE_SYMM_PGS: usize = 13;
/// Flattened dimension of the encoding (axis-major).
pub const SITE_SYMM_DIM: usize = SITE_SYMM_AXES * SITE_SYMM_PGS;

/// Site-symmetry encoding of one atom: a 15x13 matrix with one row per
/// symmetry axis and one column per point-group category.
///
/// Ground-truth labels and Wyckoff fingerprints are binary, with each row a
/// one-hot or all-zero; denoised predictions passed through this type are
/// continuous relaxations of the same layout.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteSymmetry(SMatrix<f64, SITE_SYMM_AXES, SITE_SYMM_PGS>);

impl SiteSymmetry {
    pub fn zeros() -> Self {
        Self(SMatrix::zeros())
    }

    pub fn from_matrix(matrix: SMatrix<f64, SITE_SYMM_AXES, SITE_SYMM_PGS>) -> Self {
        Self(matrix)
    }

    /// Builds an encoding from per-axis category indices, setting one entry
    /// per axis to 1.
    pub fn from_axis_categories(categories: &[usize; SITE_SYMM_AXES]) -> Self {
        let mut m = SMatrix::zeros();
        for (axis, &category) in categories.iter().enumerate() {
            m[(axis, category % SITE_SYMM_PGS)] = 1.0;
        }
        Self(m)
    }

    /// Rebuilds an encoding from its axis-major flattened form. Returns
    /// `None` unless exactly [`SITE_SYMM_DIM`] values are given.
    pub fn from_flat(flat: &[f64]) -> Option<Self> {
        if flat.len() != SITE_SYMM_DIM {
            return None;
        }
        let mut m = SMatrix::zeros();
        for axis in 0..SITE_SYMM_AXES {
            for pg in 0..SITE_SYMM_PGS {
                m[(axis, pg)] = flat[axis * SITE_SYMM_PGS + pg];
            }
        }
        Some(Self(m))
    }

    /// Flattens the encoding axis-major into a 195-dim vector.
    pub fn flatten(&self) -> DVector<f64> {
        let mut flat = DVector::zeros(SITE_SYMM_DIM);
        for axis in 0..SITE_SYMM_AXES {
            for pg in 0..SITE_SYMM_PGS {
                flat[axis * SITE_SYMM_PGS + pg] = self.0[(axis, pg)];
            }
        }
        flat
    }

    pub fn get(&self, axis: usize, pg: usize) -> f64 {
        self.0[(axis, pg)]
    }

    /// Index of the strongest category along each axis (first maximum wins).
    pub fn axis_argmax(&self) -> [usize; SITE_SYMM_AXES] {
        let mut out = [0usize; SITE_SYMM_AXES];
        for axis in 0..SITE_SYMM_AXES {
            let mut best = 0;
            for pg in 1..SITE_SYMM_PGS {
                if self.0[(axis, pg)] > self.0[(axis, best)] {
                    best = pg;
                }
            }
            out[axis] = best;
        }
        out
    }

    /// Euclidean distance between two encodings on their flattened forms.
    pub fn distance(&self, other: &Self) -> f64 {
        (self.0 - other.0).norm()
    }

    /// Elementwise union of two binary encodings.
    pub fn union(&self, other: &Self) -> Self {
        Self(self.0.zip_map(&other.0, |a, b| {
            if a != 0.0 || b != 0.0 { 1.0 } else { 0.0 }
        }))
    }

    /// Masks another encoding elementwise by this one's nonzero pattern.
    pub fn mask(&self, other: &Self) -> Self {
        Self(
            self.0
                .zip_map(&other.0, |m, x| if m != 0.0 { x } else { 0.0 }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_is_axis_major() {
        let mut m = SMatrix::zeros();
        m[(1, 2)] = 1.0;
        let flat = SiteSymmetry::from_matrix(m).flatten();
        assert_eq!(flat[SITE_SYMM_PGS + 2], 1.0);
        assert_eq!(flat.iter().sum::<f64>(), 1.0);
    }

    #[test]
    fn from_flat_round_trips() {
        let symm = SiteSymmetry::from_axis_categories(&[3; SITE_SYMM_AXES]);
        let rebuilt = SiteSymmetry::from_flat(symm.flatten().as_slice()).unwrap();
        assert_eq!(symm, rebuilt);
    }

    #[test]
    fn from_flat_rejects_wrong_length() {
        assert!(SiteSymmetry::from_flat(&[0.0; 7]).is_none());
    }

    #[test]
    fn axis_argmax_picks_first_maximum() {
        let mut m = SMatrix::zeros();
        m[(0, 4)] = 2.0;
        m[(0, 9)] = 2.0;
        let symm = SiteSymmetry::from_matrix(m);
        assert_eq!(symm.axis_argmax()[0], 4);
    }

    #[test]
    fn union_is_binary_or() {
        let a = SiteSymmetry::from_axis_categories(&[0; SITE_SYMM_AXES]);
        let b = SiteSymmetry::from_axis_categories(&[1; SITE_SYMM_AXES]);
        let u = a.union(&b);
        for axis in 0..SITE_SYMM_AXES {
            assert_eq!(u.get(axis, 0), 1.0);
            assert_eq!(u.get(axis, 1), 1.0);
            assert_eq!(u.get(axis, 2), 0.0);
        }
    }

    #[test]
    fn masking_twice_equals_masking_once() {
        let mask = SiteSymmetry::from_axis_categories(&[5; SITE_SYMM_AXES]);
        let mut m: SMatrix<f64, SITE_SYMM_AXES, SITE_SYMM_PGS> = SMatrix::zeros();
        m.fill(0.7);
        let x = SiteSymmetry::from_matrix(m);
        let once = mask.mask(&x);
        let twice = mask.mask(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn distance_matches_flattened_euclidean() {
        let a = SiteSymmetry::from_axis_categories(&[0; SITE_SYMM_AXES]);
        let b = SiteSymmetry::from_axis_categories(&[1; SITE_SYMM_AXES]);
        let flat_dist = (a.flatten() - b.flatten()).norm();
        assert!((a.distance(&b) - flat_dist).abs() < 1e-12);
    }
}
