use nalgebra::Vector3;

/// Wraps a scalar into the half-open interval `[0, 1)`.
pub fn wrap_unit(x: f64) -> f64 {
    let w = x.rem_euclid(1.0);
    // rem_euclid can return exactly 1.0 for tiny negative inputs.
    if w >= 1.0 { 0.0 } else { w }
}

/// Wraps every component of a fractional coordinate into `[0, 1)`.
pub fn wrap_frac(v: &Vector3<f64>) -> Vector3<f64> {
    v.map(wrap_unit)
}

/// Euclidean distance between two fractional coordinates under periodic
/// boundary conditions, taking `min(d, 1 - d)` along each axis.
pub fn periodic_distance(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    let mut sum = 0.0;
    for i in 0..3 {
        let forward = wrap_unit(a[i] - b[i]);
        let d = forward.min(1.0 - forward);
        sum += d * d;
    }
    sum.sqrt()
}
