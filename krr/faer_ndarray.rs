//! Dense Cholesky through faer for ndarray matrices.

use faer::linalg::solvers::{self, Solve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array2, ArrayBase, Data, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
}

/// A faer matrix over ndarray data: borrowed when the array is contiguous in
/// either order, copied otherwise (sliced tiles of larger matrices).
enum FaerMatrix<'a> {
    Borrowed(MatRef<'a, f64>),
    Copied(Mat<f64>),
}

impl FaerMatrix<'_> {
    fn mat(&self) -> MatRef<'_, f64> {
        match self {
            FaerMatrix::Borrowed(view) => *view,
            FaerMatrix::Copied(owned) => owned.as_ref(),
        }
    }
}

fn faer_matrix<S: Data<Elem = f64>>(array: &ArrayBase<S, Ix2>) -> FaerMatrix<'_> {
    let (rows, cols) = array.dim();
    match array.as_slice_memory_order() {
        Some(data) if array.is_standard_layout() => {
            FaerMatrix::Borrowed(MatRef::from_row_major_slice(data, rows, cols))
        }
        Some(data) if array.t().is_standard_layout() => {
            FaerMatrix::Borrowed(MatRef::from_column_major_slice(data, rows, cols))
        }
        _ => FaerMatrix::Copied(Mat::from_fn(rows, cols, |i, j| array[(i, j)])),
    }
}

/// Cholesky factor of a symmetric positive-definite matrix.
pub struct FaerCholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl FaerCholeskyFactor {
    /// Solves `A X = rhs` for every column of `rhs`.
    pub fn solve_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        let rhs = faer_matrix(rhs);
        let solution = self.factor.solve(rhs.mat());
        Array2::from_shape_fn((solution.nrows(), solution.ncols()), |(i, j)| solution[(i, j)])
    }

    /// The lower factor with an explicitly zeroed strict upper triangle.
    pub fn lower_factor(&self) -> Array2<f64> {
        let lower = self.factor.L();
        Array2::from_shape_fn((lower.nrows(), lower.ncols()), |(i, j)| {
            if j <= i { lower[(i, j)] } else { 0.0 }
        })
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        let factor = faer_matrix(self)
            .mat()
            .llt(side)
            .map_err(FaerLinalgError::Cholesky)?;
        Ok(FaerCholeskyFactor { factor })
    }
}
