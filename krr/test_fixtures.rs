use ndarray::{Array2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

/// Standard-normal points, reproducible from `seed`.
pub(crate) fn gaussian_points(n: usize, d: usize, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    Array2::from_shape_fn((n, d), |_| normal.sample(&mut rng))
}

/// Points with a smooth single-column response plus small noise.
pub(crate) fn smooth_regression(n: usize, d: usize, seed: u64) -> (Array2<f64>, Array2<f64>) {
    let x = gaussian_points(n, d, seed);
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));
    let noise = Normal::new(0.0, 0.05).unwrap();
    let y = x
        .axis_iter(Axis(0))
        .map(|row| row[0].sin() + 0.5 * row[d - 1] + noise.sample(&mut rng))
        .collect::<Vec<_>>();
    let y = Array2::from_shape_vec((n, 1), y).unwrap();
    (x, y)
}
