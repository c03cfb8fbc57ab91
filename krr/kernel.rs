//! Kernel functions and the tile engine that evaluates them.
//!
//! A kernel block `K(A, B)` is always produced through the same path: inner
//! products via a matrix multiply, then an elementwise map that depends on the
//! kernel family. Products with the kernel matrix (`K v`, `K^T u`, `K^T K v`)
//! are available either against a stored matrix or fused, evaluating row tiles
//! on the fly so the full `N x M` matrix never exists.

use crate::config::Precision;
use crate::dispatch::Strategy;
use crate::estimate::KrrError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, LinalgScalar, Zip, s};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// A positive-definite kernel with its hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelSpec {
    /// `exp(-||x - y||^2 / (2 sigma^2))`
    Gaussian { sigma: f64 },
    /// `exp(-||x - y|| / sigma)`
    Laplacian { sigma: f64 },
    /// `beta + gamma <x, y>`
    Linear { beta: f64, gamma: f64 },
    /// `(alpha <x, y> + beta)^degree`
    Polynomial { alpha: f64, beta: f64, degree: u32 },
}

/// Kernel family without hyperparameters; used to key warm-up plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelKind {
    Gaussian,
    Laplacian,
    Linear,
    Polynomial,
}

impl KernelSpec {
    pub fn kind(&self) -> KernelKind {
        match self {
            KernelSpec::Gaussian { .. } => KernelKind::Gaussian,
            KernelSpec::Laplacian { .. } => KernelKind::Laplacian,
            KernelSpec::Linear { .. } => KernelKind::Linear,
            KernelSpec::Polynomial { .. } => KernelKind::Polynomial,
        }
    }

    /// Rejects hyperparameters for which the kernel is not positive semidefinite.
    pub fn validate(&self) -> Result<(), KrrError> {
        let problem = match *self {
            KernelSpec::Gaussian { sigma } | KernelSpec::Laplacian { sigma }
                if !(sigma.is_finite() && sigma > 0.0) =>
            {
                Some(format!("kernel bandwidth sigma must be positive and finite, got {sigma}"))
            }
            KernelSpec::Linear { beta, gamma } => {
                if !(beta.is_finite() && beta >= 0.0) {
                    Some(format!("linear kernel beta must be non-negative and finite, got {beta}"))
                } else if !(gamma.is_finite() && gamma > 0.0) {
                    Some(format!("linear kernel gamma must be positive and finite, got {gamma}"))
                } else {
                    None
                }
            }
            KernelSpec::Polynomial { alpha, beta, degree } => {
                if !(alpha.is_finite() && alpha > 0.0) {
                    Some(format!(
                        "polynomial kernel alpha must be positive and finite, got {alpha}"
                    ))
                } else if !(beta.is_finite() && beta >= 0.0) {
                    Some(format!(
                        "polynomial kernel beta must be non-negative and finite, got {beta}"
                    ))
                } else if degree == 0 || degree > i32::MAX as u32 {
                    Some(format!("polynomial degree must be positive, got {degree}"))
                } else {
                    None
                }
            }
            _ => None,
        };
        match problem {
            Some(message) => Err(KrrError::InvalidConfiguration(message)),
            None => Ok(()),
        }
    }

    /// Kernel value for a single pair of points, evaluated directly in `f64`.
    pub fn value(&self, x: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
        let inner = x.dot(&y);
        match *self {
            KernelSpec::Gaussian { sigma } => {
                let dist_sq: f64 = x.iter().zip(y.iter()).map(|(a, b)| (a - b) * (a - b)).sum();
                (-dist_sq / (2.0 * sigma * sigma)).exp()
            }
            KernelSpec::Laplacian { sigma } => {
                let dist_sq: f64 = x.iter().zip(y.iter()).map(|(a, b)| (a - b) * (a - b)).sum();
                (-dist_sq.sqrt() / sigma).exp()
            }
            KernelSpec::Linear { beta, gamma } => beta + gamma * inner,
            KernelSpec::Polynomial { alpha, beta, degree } => {
                (alpha * inner + beta).powi(degree as i32)
            }
        }
    }
}

/// Scalar types kernel tiles can be evaluated in.
pub(crate) trait Real: LinalgScalar + PartialOrd + Send + Sync {
    fn from_f64(value: f64) -> Self;
    fn to_f64(self) -> f64;
    fn exp(self) -> Self;
    fn sqrt(self) -> Self;
    fn powi(self, n: i32) -> Self;
}

impl Real for f32 {
    fn from_f64(value: f64) -> Self {
        value as f32
    }
    fn to_f64(self) -> f64 {
        f64::from(self)
    }
    fn exp(self) -> Self {
        f32::exp(self)
    }
    fn sqrt(self) -> Self {
        f32::sqrt(self)
    }
    fn powi(self, n: i32) -> Self {
        f32::powi(self, n)
    }
}

impl Real for f64 {
    fn from_f64(value: f64) -> Self {
        value
    }
    fn to_f64(self) -> f64 {
        self
    }
    fn exp(self) -> Self {
        f64::exp(self)
    }
    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }
    fn powi(self, n: i32) -> Self {
        f64::powi(self, n)
    }
}

fn squared_norms<T: Real>(points: ArrayView2<T>) -> Array1<T> {
    points.rows().into_iter().map(|row| row.dot(&row)).collect()
}

/// Evaluates `K(rows, cols)` in the scalar type `T`.
fn kernel_block<T: Real>(
    spec: &KernelSpec,
    rows: ArrayView2<T>,
    cols: ArrayView2<T>,
    col_norms: ArrayView1<T>,
) -> Array2<T> {
    let mut block = rows.dot(&cols.t());
    let zero = T::from_f64(0.0);
    let two = T::from_f64(2.0);
    match *spec {
        KernelSpec::Gaussian { sigma } => {
            let row_norms = squared_norms(rows);
            let scale = T::from_f64(-1.0 / (2.0 * sigma * sigma));
            Zip::indexed(&mut block).for_each(|(i, j), value| {
                let dist_sq = row_norms[i] + col_norms[j] - two * *value;
                let dist_sq = if dist_sq < zero { zero } else { dist_sq };
                *value = (dist_sq * scale).exp();
            });
        }
        KernelSpec::Laplacian { sigma } => {
            let row_norms = squared_norms(rows);
            let scale = T::from_f64(-1.0 / sigma);
            Zip::indexed(&mut block).for_each(|(i, j), value| {
                let dist_sq = row_norms[i] + col_norms[j] - two * *value;
                let dist_sq = if dist_sq < zero { zero } else { dist_sq };
                *value = (dist_sq.sqrt() * scale).exp();
            });
        }
        KernelSpec::Linear { beta, gamma } => {
            let beta = T::from_f64(beta);
            let gamma = T::from_f64(gamma);
            block.mapv_inplace(|inner| beta + gamma * inner);
        }
        KernelSpec::Polynomial { alpha, beta, degree } => {
            let alpha = T::from_f64(alpha);
            let beta = T::from_f64(beta);
            let degree = degree as i32;
            block.mapv_inplace(|inner| (alpha * inner + beta).powi(degree));
        }
    }
    block
}

/// The column side of a kernel product, converted once to the working precision.
enum Prepared<'a> {
    Double {
        points: ArrayView2<'a, f64>,
        norms: Array1<f64>,
    },
    Single {
        points: Array2<f32>,
        norms: Array1<f32>,
    },
}

/// Splits `0..len` into consecutive ranges of at most `tile` rows.
pub(crate) fn tile_ranges(len: usize, tile: usize) -> Vec<Range<usize>> {
    let tile = tile.max(1);
    (0..len)
        .step_by(tile)
        .map(|start| start..(start + tile).min(len))
        .collect()
}

/// Runs `work` over every row tile, at most `streams` tiles concurrently, and
/// returns the per-tile results in tile order.
fn for_each_tile<R, F>(len: usize, tile: usize, streams: usize, work: F) -> Vec<R>
where
    R: Send,
    F: Fn(Range<usize>) -> R + Sync,
{
    let ranges = tile_ranges(len, tile);
    let mut results = Vec::with_capacity(ranges.len());
    for wave in ranges.chunks(streams.max(1)) {
        let mut finished: Vec<R> = wave.par_iter().map(|range| work(range.clone())).collect();
        results.append(&mut finished);
    }
    results
}

const EVALUATE_TILE_ROWS: usize = 64;

/// Evaluates kernel blocks and kernel products at a fixed working precision.
#[derive(Debug, Clone, Copy)]
pub struct KernelEvaluator<'a> {
    spec: &'a KernelSpec,
    precision: Precision,
}

impl<'a> KernelEvaluator<'a> {
    pub fn new(spec: &'a KernelSpec, precision: Precision) -> Self {
        Self { spec, precision }
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    fn prepare<'b>(&self, points: ArrayView2<'b, f64>) -> Prepared<'b> {
        match self.precision {
            Precision::Double => Prepared::Double {
                norms: squared_norms(points),
                points,
            },
            Precision::Single => {
                let converted = points.mapv(|v| v as f32);
                let norms = squared_norms(converted.view());
                Prepared::Single {
                    points: converted,
                    norms,
                }
            }
        }
    }

    fn block(&self, rows: ArrayView2<f64>, cols: &Prepared<'_>) -> Array2<f64> {
        match cols {
            Prepared::Double { points, norms } => {
                kernel_block(self.spec, rows, points.view(), norms.view())
            }
            Prepared::Single { points, norms } => {
                let rows = rows.mapv(|v| v as f32);
                kernel_block(self.spec, rows.view(), points.view(), norms.view())
                    .mapv(Real::to_f64)
            }
        }
    }

    /// Materializes `K(a, b)` as an `a.nrows() x b.nrows()` matrix.
    pub fn evaluate(&self, a: ArrayView2<f64>, b: ArrayView2<f64>) -> Array2<f64> {
        let prepared = self.prepare(b);
        let tiles = for_each_tile(a.nrows(), EVALUATE_TILE_ROWS, usize::MAX, |range| {
            self.block(a.slice(s![range, ..]), &prepared)
        });
        let mut out = Array2::zeros((a.nrows(), b.nrows()));
        for (range, tile) in tile_ranges(a.nrows(), EVALUATE_TILE_ROWS)
            .into_iter()
            .zip(tiles)
        {
            out.slice_mut(s![range, ..]).assign(&tile);
        }
        out
    }

    /// Fused `K(a, b) v`, one row tile of `a` at a time.
    pub fn apply(
        &self,
        a: ArrayView2<f64>,
        b: ArrayView2<f64>,
        v: ArrayView2<f64>,
        strategy: &Strategy,
    ) -> Array2<f64> {
        let prepared = self.prepare(b);
        let tiles = for_each_tile(a.nrows(), strategy.tile, strategy.streams, |range| {
            self.block(a.slice(s![range, ..]), &prepared).dot(&v)
        });
        let mut out = Array2::zeros((a.nrows(), v.ncols()));
        for (range, tile) in tile_ranges(a.nrows(), strategy.tile)
            .into_iter()
            .zip(tiles)
        {
            out.slice_mut(s![range, ..]).assign(&tile);
        }
        out
    }

    /// Fused `K(a, b)^T u`. Tile contributions are summed in tile order so the
    /// result does not depend on thread scheduling.
    pub fn apply_transpose(
        &self,
        a: ArrayView2<f64>,
        b: ArrayView2<f64>,
        u: ArrayView2<f64>,
        strategy: &Strategy,
    ) -> Array2<f64> {
        let prepared = self.prepare(b);
        let tiles = for_each_tile(a.nrows(), strategy.tile, strategy.streams, |range| {
            let block = self.block(a.slice(s![range.clone(), ..]), &prepared);
            block.t().dot(&u.slice(s![range, ..]))
        });
        sum_in_order(tiles, (b.nrows(), u.ncols()))
    }

    /// Fused `K(a, b)^T K(a, b) v` without storing the kernel matrix.
    pub fn apply_normal(
        &self,
        a: ArrayView2<f64>,
        b: ArrayView2<f64>,
        v: ArrayView2<f64>,
        strategy: &Strategy,
    ) -> Array2<f64> {
        let prepared = self.prepare(b);
        let tiles = for_each_tile(a.nrows(), strategy.tile, strategy.streams, |range| {
            let block = self.block(a.slice(s![range, ..]), &prepared);
            block.t().dot(&block.dot(&v))
        });
        sum_in_order(tiles, (b.nrows(), v.ncols()))
    }
}

fn sum_in_order(tiles: Vec<Array2<f64>>, shape: (usize, usize)) -> Array2<f64> {
    let mut total = Array2::zeros(shape);
    for tile in tiles {
        total += &tile;
    }
    total
}
