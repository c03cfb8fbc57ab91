use ndarray::{Array2, Axis, s};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

/// A synthetic stand-in for a small tabular regression dataset: 506 rows of
/// 13 correlated features with a nonlinear response, every column standardized.
pub struct Split {
    pub x_train: Array2<f64>,
    pub y_train: Array2<f64>,
    pub x_test: Array2<f64>,
    pub y_test: Array2<f64>,
}

pub fn standard_normal(n: usize, d: usize, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    Array2::from_shape_fn((n, d), |_| normal.sample(&mut rng))
}

fn standardize(a: &mut Array2<f64>) {
    for mut col in a.axis_iter_mut(Axis(1)) {
        let mean = col.mean().unwrap();
        let spread = col.mapv(|v| (v - mean).powi(2)).mean().unwrap().sqrt();
        col.mapv_inplace(|v| (v - mean) / spread.max(1e-12));
    }
}

pub fn tabular_regression(seed: u64) -> Split {
    let (n, d) = (506, 13);
    let latent = standard_normal(n, 4, seed);
    let mut x = standard_normal(n, d, seed + 1) * 0.5;
    for j in 0..d {
        let source = latent.column(j % 4).to_owned();
        x.column_mut(j).scaled_add(1.0, &source);
    }
    let mut rng = StdRng::seed_from_u64(seed + 2);
    let noise = Normal::new(0.0, 0.3).unwrap();
    let mut y = Array2::from_shape_fn((n, 1), |(i, _)| {
        let row = x.row(i);
        2.0 * row[0].sin() + row[1] * row[2] * 0.5 - row[5].abs() + 0.8 * row[12]
            + noise.sample(&mut rng)
    });
    standardize(&mut x);
    standardize(&mut y);

    let train = n * 4 / 5;
    Split {
        x_train: x.slice(s![..train, ..]).to_owned(),
        y_train: y.slice(s![..train, ..]).to_owned(),
        x_test: x.slice(s![train.., ..]).to_owned(),
        y_test: y.slice(s![train.., ..]).to_owned(),
    }
}

/// Smooth response with one or more target columns.
pub fn smooth_targets(x: &Array2<f64>, targets: usize) -> Array2<f64> {
    Array2::from_shape_fn((x.nrows(), targets), |(i, t)| {
        let row = x.row(i);
        (row[0] * (t + 1) as f64).sin() + 0.3 * row[row.len() - 1]
    })
}

pub fn rmse(truth: &Array2<f64>, predicted: &Array2<f64>) -> f64 {
    let sum: f64 = truth
        .iter()
        .zip(predicted.iter())
        .map(|(a, b)| (a - b).powi(2))
        .sum();
    (sum / truth.len() as f64).sqrt()
}

pub fn max_abs_diff(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    assert_eq!(a.dim(), b.dim());
    a.iter()
        .zip(b.iter())
        .map(|(p, q)| (p - q).abs())
        .fold(0.0, f64::max)
}
