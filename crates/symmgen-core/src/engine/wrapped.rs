//! Score kernel of the wrapped (periodic) Gaussian used by the coordinate
//! channel. The wrapped density is approximated by summing a finite window
//! of periodic images, which is exact to machine precision for the sigma
//! range of the schedule.

use rand::Rng;
use rand_distr::StandardNormal;

/// Number of periodic images summed on each side of the center.
const WRAPPED_IMAGES: i32 = 10;

/// Unnormalized wrapped-normal density at `x` with period 1.
pub fn p_wrapped_normal(x: f64, sigma: f64) -> f64 {
    let mut p = 0.0;
    for i in -WRAPPED_IMAGES..=WRAPPED_IMAGES {
        let d = x + f64::from(i);
        p += (-d * d / (2.0 * sigma * sigma)).exp();
    }
    p
}

/// Score `d/dx log p(x)` of the wrapped normal with period 1.
pub fn d_log_p_wrapped_normal(x: f64, sigma: f64) -> f64 {
    let mut weighted = 0.0;
    for i in -WRAPPED_IMAGES..=WRAPPED_IMAGES {
        let d = x + f64::from(i);
        weighted += d / (sigma * sigma) * (-d * d / (2.0 * sigma * sigma)).exp();
    }
    -weighted / p_wrapped_normal(x, sigma)
}

/// Monte-Carlo estimate of `E[score^2 * sigma^2]` under the wrapped noising
/// kernel, used to normalize the score regression target.
pub fn sigma_norm_estimate<R: Rng + ?Sized>(sigma: f64, samples: usize, rng: &mut R) -> f64 {
    let mut acc = 0.0;
    for _ in 0..samples {
        let z: f64 = rng.sample(StandardNormal);
        let x = (sigma * z).rem_euclid(1.0);
        let score = d_log_p_wrapped_normal(x, sigma);
        acc += score * score * sigma * sigma;
    }
    acc / samples as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn density_is_periodic() {
        let p0 = p_wrapped_normal(0.3, 0.1);
        let p1 = p_wrapped_normal(1.3, 0.1);
        assert!((p0 - p1).abs() < 1e-12);
    }

    #[test]
    fn score_is_antisymmetric() {
        let s_pos = d_log_p_wrapped_normal(0.2, 0.3);
        let s_neg = d_log_p_wrapped_normal(-0.2, 0.3);
        assert!((s_pos + s_neg).abs() < 1e-12);
    }

    #[test]
    fn score_matches_unwrapped_normal_for_small_sigma() {
        // With sigma << 1 the periodic images are negligible.
        let sigma = 0.01;
        let x = 0.003;
        let expected = -x / (sigma * sigma);
        assert!((d_log_p_wrapped_normal(x, sigma) - expected).abs() < 1e-6);
    }

    #[test]
    fn sigma_norm_is_close_to_one_for_small_sigma() {
        // E[score^2 sigma^2] = 1 for an unwrapped Gaussian.
        let mut rng = StdRng::seed_from_u64(7);
        let norm = sigma_norm_estimate(0.01, 20_000, &mut rng);
        assert!((norm - 1.0).abs() < 0.05, "estimate {norm}");
    }
}
