use nalgebra::DVector;

use super::error::EngineError;

/// Deterministic sinusoidal timestep embedding, concatenated per crystal
/// with the raw space-group conditioning vector. Learned projections of
/// either part belong to the denoising network.
#[derive(Debug, Clone)]
pub struct TimeEmbedding {
    dim: usize,
}

impl TimeEmbedding {
    pub fn new(dim: usize) -> Result<Self, EngineError> {
        if dim < 2 || dim % 2 != 0 {
            return Err(EngineError::Initialization(format!(
                "time embedding dimension must be even and >= 2, got {dim}"
            )));
        }
        Ok(Self { dim })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Sinusoidal embedding of one timestep: interleaved `[sin | cos]`
    /// halves over geometrically spaced frequencies.
    pub fn embed(&self, t: usize) -> DVector<f64> {
        let half = self.dim / 2;
        let scale = if half > 1 {
            (10_000.0f64).ln() / (half - 1) as f64
        } else {
            0.0
        };
        let mut out = DVector::zeros(self.dim);
        for i in 0..half {
            let freq = (-(i as f64) * scale).exp();
            let angle = t as f64 * freq;
            out[i] = angle.sin();
            out[half + i] = angle.cos();
        }
        out
    }

    /// Full conditioning embedding of one crystal: `[sinusoid(t) | sg_condition]`.
    pub fn conditioning(&self, t: usize, sg_condition: &DVector<f64>) -> DVector<f64> {
        let time = self.embed(t);
        let mut out = DVector::zeros(self.dim + sg_condition.len());
        out.rows_mut(0, self.dim).copy_from(&time);
        out.rows_mut(self.dim, sg_condition.len())
            .copy_from(sg_condition);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::batch::SG_CONDITION_DIM;

    #[test]
    fn embedding_has_requested_dimension() {
        let emb = TimeEmbedding::new(8).unwrap();
        assert_eq!(emb.embed(5).len(), 8);
    }

    #[test]
    fn conditioning_concatenates_time_and_space_group() {
        let emb = TimeEmbedding::new(4).unwrap();
        let sg = DVector::from_element(SG_CONDITION_DIM, 0.5);
        let cond = emb.conditioning(3, &sg);
        assert_eq!(cond.len(), 4 + SG_CONDITION_DIM);
        assert_eq!(cond[4], 0.5);
    }

    #[test]
    fn zero_timestep_embeds_to_zero_sines_and_unit_cosines() {
        let emb = TimeEmbedding::new(6).unwrap();
        let e = emb.embed(0);
        for i in 0..3 {
            assert_eq!(e[i], 0.0);
            assert_eq!(e[3 + i], 1.0);
        }
    }

    #[test]
    fn rejects_odd_dimension() {
        assert!(TimeEmbedding::new(5).is_err());
        assert!(TimeEmbedding::new(0).is_err());
    }
}
