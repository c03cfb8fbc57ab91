//! Two-factor triangular preconditioner for the Nystrom normal equations.
//!
//! With landmark kernel `K_MM`, the first factor `T` is the upper Cholesky
//! factor of `K_MM + eps M I`, and the second factor `A` is the upper Cholesky
//! factor of `T T^T / M + lambda I`. The preconditioner is `B = T^{-1} A^{-1}`,
//! applied to the normal equations as `P^{-1} = B B^T`. When every training
//! point is a landmark, `P` coincides with the system matrix up to the jitter,
//! so conjugate gradient converges almost immediately.
//!
//! Both factors are stored as lower triangles (`T = L_T^T`, `A = L_A^T`) and
//! every operation below walks them one row at a time, which lets the same code
//! run over an in-memory matrix or a spill file.

use crate::centers::CenterSet;
use crate::config::{Precision, SolverOptions};
use crate::dispatch::{OperationKind, Residency, Strategy, out_of_core_tile_side};
use crate::estimate::KrrError;
use crate::faer_ndarray::FaerCholesky;
use crate::kernel::{KernelEvaluator, KernelSpec, tile_ranges};
use crate::spill::{SpilledMatrix, blocked_cholesky, blocked_lauum};
use ahash::RandomState;
use faer::Side;
use ndarray::{Array2, ArrayView2, s};
use std::time::{Duration, Instant};

/// Factor applied to the jitter for the single retry after a failed Cholesky.
pub const JITTER_RETRY_GROWTH: f64 = 1e4;

pub enum FactorStorage {
    InCore(Array2<f64>),
    Spilled(SpilledMatrix),
}

/// A lower triangular matrix `L` and the four triangular operations on it.
pub struct TriangularFactor {
    storage: FactorStorage,
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn columns_of(v: ArrayView2<f64>) -> Vec<Vec<f64>> {
    v.columns().into_iter().map(|col| col.to_vec()).collect()
}

fn from_columns(columns: &[Vec<f64>], rows: usize) -> Array2<f64> {
    Array2::from_shape_fn((rows, columns.len()), |(i, c)| columns[c][i])
}

impl TriangularFactor {
    pub fn in_core(lower: Array2<f64>) -> Self {
        Self {
            storage: FactorStorage::InCore(lower),
        }
    }

    pub fn spilled(lower: SpilledMatrix) -> Self {
        Self {
            storage: FactorStorage::Spilled(lower),
        }
    }

    pub fn dim(&self) -> usize {
        match &self.storage {
            FactorStorage::InCore(l) => l.nrows(),
            FactorStorage::Spilled(l) => l.dim(),
        }
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.storage, FactorStorage::Spilled(_))
    }

    /// Calls `visit(i, L[i, ..=i])` for each row index in `rows`.
    fn visit_rows(&self, rows: impl Iterator<Item = usize>, mut visit: impl FnMut(usize, &[f64])) {
        let mut buf = vec![0.0; self.dim()];
        for i in rows {
            match &self.storage {
                FactorStorage::InCore(l) => {
                    let row = l.row(i);
                    match row.as_slice() {
                        Some(slice) => visit(i, &slice[..=i]),
                        None => {
                            for (dst, src) in buf.iter_mut().zip(row.iter()) {
                                *dst = *src;
                            }
                            visit(i, &buf[..=i]);
                        }
                    }
                }
                FactorStorage::Spilled(l) => {
                    l.read_row_segment(i, 0..i + 1, &mut buf[..=i]);
                    visit(i, &buf[..=i]);
                }
            }
        }
    }

    /// Solves `L x = b` by forward substitution.
    pub fn solve_lower(&self, b: ArrayView2<f64>) -> Array2<f64> {
        let mut cols = columns_of(b);
        self.visit_rows(0..self.dim(), |i, row| {
            for col in cols.iter_mut() {
                let sum = col[i] - dot(&row[..i], &col[..i]);
                col[i] = sum / row[i];
            }
        });
        from_columns(&cols, self.dim())
    }

    /// Solves `L^T x = b` by back substitution, still reading `L` by rows.
    pub fn solve_upper(&self, b: ArrayView2<f64>) -> Array2<f64> {
        let mut cols = columns_of(b);
        self.visit_rows((0..self.dim()).rev(), |i, row| {
            for col in cols.iter_mut() {
                col[i] /= row[i];
                let xi = col[i];
                for (cj, lij) in col[..i].iter_mut().zip(&row[..i]) {
                    *cj -= lij * xi;
                }
            }
        });
        from_columns(&cols, self.dim())
    }

    /// `L v`
    pub fn mul_lower(&self, v: ArrayView2<f64>) -> Array2<f64> {
        let cols = columns_of(v);
        let mut out = vec![vec![0.0; self.dim()]; cols.len()];
        self.visit_rows(0..self.dim(), |i, row| {
            for (dst, col) in out.iter_mut().zip(&cols) {
                dst[i] = dot(row, &col[..=i]);
            }
        });
        from_columns(&out, self.dim())
    }

    /// `L^T v`
    pub fn mul_upper(&self, v: ArrayView2<f64>) -> Array2<f64> {
        let cols = columns_of(v);
        let mut out = vec![vec![0.0; self.dim()]; cols.len()];
        self.visit_rows(0..self.dim(), |i, row| {
            for (dst, col) in out.iter_mut().zip(&cols) {
                let vi = col[i];
                for (yj, lij) in dst[..=i].iter_mut().zip(row) {
                    *yj += lij * vi;
                }
            }
        });
        from_columns(&out, self.dim())
    }

    /// The factor as a dense lower triangular matrix.
    pub fn to_dense(&self) -> Array2<f64> {
        let n = self.dim();
        let mut dense = Array2::zeros((n, n));
        self.visit_rows(0..n, |i, row| {
            dense.slice_mut(s![i, ..=i]).assign(&ndarray::ArrayView1::from(row));
        });
        dense
    }

    fn min_diagonal(&self) -> f64 {
        let mut smallest = f64::INFINITY;
        self.visit_rows(0..self.dim(), |i, row| smallest = smallest.min(row[i]));
        smallest
    }
}

/// Identifies a preconditioner that can be reused: same landmarks, kernel,
/// penalty and precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PreconditionerKey {
    centers_fingerprint: u64,
    kernel_fingerprint: u64,
    penalty_bits: u64,
    precision: Precision,
    num_centers: usize,
}

fn fingerprint_hasher() -> RandomState {
    RandomState::with_seeds(
        0x243f_6a88_85a3_08d3,
        0x1319_8a2e_0370_7344,
        0xa409_3822_299f_31d0,
        0x082e_fa98_ec4e_6c89,
    )
}

impl PreconditionerKey {
    pub fn new(centers: &CenterSet, kernel: &KernelSpec, penalty: f64, precision: Precision) -> Self {
        let hasher = fingerprint_hasher();
        let center_bits: Vec<u64> = centers
            .points
            .iter()
            .map(|v| v.to_bits())
            .chain([centers.points.ncols() as u64])
            .collect();
        let kernel_bits: Vec<u64> = match *kernel {
            KernelSpec::Gaussian { sigma } => vec![0, sigma.to_bits()],
            KernelSpec::Laplacian { sigma } => vec![1, sigma.to_bits()],
            KernelSpec::Linear { beta, gamma } => vec![2, beta.to_bits(), gamma.to_bits()],
            KernelSpec::Polynomial { alpha, beta, degree } => {
                vec![3, alpha.to_bits(), beta.to_bits(), u64::from(degree)]
            }
        };
        Self {
            centers_fingerprint: hasher.hash_one(&center_bits),
            kernel_fingerprint: hasher.hash_one(&kernel_bits),
            penalty_bits: penalty.to_bits(),
            precision,
            num_centers: centers.len(),
        }
    }
}

/// Runs `attempt` with `first` jitter, then once more with `retry` jitter.
fn with_jitter_retry<T>(
    what: &str,
    first: f64,
    retry: f64,
    mut attempt: impl FnMut(f64) -> Option<T>,
) -> Result<(T, f64), KrrError> {
    if let Some(value) = attempt(first) {
        return Ok((value, first));
    }
    log::warn!("Cholesky of the {what} failed with jitter {first:e}; retrying with {retry:e}");
    attempt(retry).map(|value| (value, retry)).ok_or_else(|| {
        KrrError::NumericalFailure(format!(
            "Cholesky of the {what} failed even with diagonal jitter {retry:e}"
        ))
    })
}

fn fill_landmark_kernel(
    target: &mut SpilledMatrix,
    centers: ArrayView2<f64>,
    evaluator: &KernelEvaluator<'_>,
    side: usize,
    jitter: f64,
) {
    let ranges = tile_ranges(centers.nrows(), side);
    for (i, ir) in ranges.iter().enumerate() {
        for jr in &ranges[..=i] {
            let mut block = evaluator.evaluate(
                centers.slice(s![ir.clone(), ..]),
                centers.slice(s![jr.clone(), ..]),
            );
            if ir.start == jr.start {
                block.diag_mut().mapv_inplace(|d| d + jitter);
            }
            target.write_tile(ir.start, jr.start, block.view());
        }
    }
}

pub struct Preconditioner {
    t_factor: TriangularFactor,
    a_factor: TriangularFactor,
    jitter: f64,
    key: PreconditionerKey,
    build_time: Duration,
}

impl std::fmt::Debug for Preconditioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Preconditioner")
            .field("dim", &self.dim())
            .field("residency", &self.residency())
            .field("jitter", &self.jitter)
            .field("build_time", &self.build_time)
            .finish()
    }
}

impl Preconditioner {
    /// Factorizes the landmark kernel and the regularized triangular product,
    /// in memory or through spill files as `strategy` dictates.
    pub fn build(
        centers: &CenterSet,
        kernel: &KernelSpec,
        penalty: f64,
        strategy: &Strategy,
        options: &SolverOptions,
    ) -> Result<Self, KrrError> {
        let start = Instant::now();
        let device = strategy.executing_device(OperationKind::PreconditionerBuild);
        let m = centers.len();
        log::debug!(
            "Building the {m}x{m} preconditioner on {device:?} ({:?}, {:?} precision)",
            strategy.residency,
            strategy.precision
        );
        let precision = strategy.precision;
        let evaluator = KernelEvaluator::new(kernel, precision);
        let base = options.pc_epsilon(precision) * m as f64;
        let retry = base * JITTER_RETRY_GROWTH;
        let inv_m = 1.0 / m as f64;

        let (t_factor, a_factor, jitter) = match strategy.residency {
            Residency::InCore => {
                let kmm = evaluator.evaluate(centers.view(), centers.view());
                let (l_t, jitter) = with_jitter_retry("landmark kernel", base, retry, |jitter| {
                    let mut shifted = kmm.clone();
                    shifted.diag_mut().mapv_inplace(|d| d + jitter);
                    shifted.cholesky(Side::Lower).ok().map(|c| c.lower_factor())
                })?;
                let gram = l_t.t().dot(&l_t) * inv_m;
                let (l_a, _) =
                    with_jitter_retry("regularized landmark product", 0.0, retry, |extra| {
                        let mut shifted = gram.clone();
                        shifted.diag_mut().mapv_inplace(|d| d + penalty + extra);
                        shifted.cholesky(Side::Lower).ok().map(|c| c.lower_factor())
                    })?;
                (
                    TriangularFactor::in_core(l_t),
                    TriangularFactor::in_core(l_a),
                    jitter,
                )
            }
            Residency::OutOfCore => {
                let dir = options.spill_dir.as_deref();
                let side = strategy.tile;
                let lauum_side =
                    out_of_core_tile_side(m, options.lauum_par_blk_multiplier, strategy.ceiling_bytes)?;
                log::info!(
                    "Factorizing the {m}x{m} landmark kernel out of core (Cholesky tiles {side}, product tiles {lauum_side})"
                );
                let mut l_t = SpilledMatrix::create(m, dir)?;
                let ((), jitter) = with_jitter_retry("landmark kernel", base, retry, |jitter| {
                    fill_landmark_kernel(&mut l_t, centers.view(), &evaluator, side, jitter);
                    blocked_cholesky(&mut l_t, side).ok()
                })?;
                let mut l_a = SpilledMatrix::create(m, dir)?;
                with_jitter_retry("regularized landmark product", 0.0, retry, |extra| {
                    blocked_lauum(&l_t, &mut l_a, lauum_side, inv_m, penalty + extra);
                    blocked_cholesky(&mut l_a, side).ok()
                })?;
                (
                    TriangularFactor::spilled(l_t),
                    TriangularFactor::spilled(l_a),
                    jitter,
                )
            }
        };

        let preconditioner = Self {
            t_factor,
            a_factor,
            jitter,
            key: PreconditionerKey::new(centers, kernel, penalty, precision),
            build_time: start.elapsed(),
        };
        log::debug!(
            "Preconditioner built in {:.3?}; smallest pivots {:e} (T) and {:e} (A)",
            preconditioner.build_time,
            preconditioner.t_factor.min_diagonal(),
            preconditioner.a_factor.min_diagonal()
        );
        Ok(preconditioner)
    }

    pub fn dim(&self) -> usize {
        self.t_factor.dim()
    }

    pub fn residency(&self) -> Residency {
        if self.t_factor.is_spilled() {
            Residency::OutOfCore
        } else {
            Residency::InCore
        }
    }

    /// Diagonal jitter that made the landmark kernel factorizable.
    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    pub fn key(&self) -> &PreconditionerKey {
        &self.key
    }

    pub fn build_time(&self) -> Duration {
        self.build_time
    }

    /// `L_T`, the lower form of the first factor.
    pub fn landmark_factor(&self) -> &TriangularFactor {
        &self.t_factor
    }

    /// `L_A`, the lower form of the second factor.
    pub fn product_factor(&self) -> &TriangularFactor {
        &self.a_factor
    }

    /// `B v = T^{-1} A^{-1} v`, mapping preconditioned coordinates to
    /// coefficients.
    pub fn apply_forward(&self, v: ArrayView2<f64>) -> Array2<f64> {
        let inner = self.a_factor.solve_upper(v);
        self.t_factor.solve_upper(inner.view())
    }

    /// `B^{-1} v = A T v`, the exact inverse of [`Self::apply_forward`].
    pub fn apply_backward(&self, v: ArrayView2<f64>) -> Array2<f64> {
        let inner = self.t_factor.mul_upper(v);
        self.a_factor.mul_upper(inner.view())
    }

    /// `B^T v = A^{-T} T^{-T} v`
    pub fn apply_transpose(&self, v: ArrayView2<f64>) -> Array2<f64> {
        let inner = self.t_factor.solve_lower(v);
        self.a_factor.solve_lower(inner.view())
    }

    /// `P^{-1} r = B B^T r`
    pub fn precondition(&self, r: ArrayView2<f64>) -> Array2<f64> {
        let inner = self.apply_transpose(r);
        self.apply_forward(inner.view())
    }

    /// `T^T T v`, the Nystrom regularizer `K_MM` up to jitter.
    pub fn regularizer(&self, v: ArrayView2<f64>) -> Array2<f64> {
        let inner = self.t_factor.mul_upper(v);
        self.t_factor.mul_lower(inner.view())
    }
}
