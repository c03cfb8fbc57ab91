//! Disk-backed square matrices and the blocked factorizations that run on them.
//!
//! A spilled matrix is a row-major `f64` file mapped into memory. The blocked
//! routines read and write one square tile at a time, so only a handful of tiles
//! are resident regardless of the matrix size; the operating system pages the
//! rest in and out of the mapping.

use crate::estimate::KrrError;
use crate::faer_ndarray::FaerCholesky;
use crate::kernel::tile_ranges;
use faer::Side;
use memmap2::MmapMut;
use ndarray::{Array2, ArrayView2};
use std::fs::File;
use std::ops::Range;
use std::path::Path;

const ENTRY_BYTES: usize = std::mem::size_of::<f64>();

/// A square `f64` matrix living in an anonymous temporary file.
pub struct SpilledMatrix {
    map: MmapMut,
    dim: usize,
    // Kept open for the lifetime of the mapping.
    file: File,
}

impl std::fmt::Debug for SpilledMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpilledMatrix")
            .field("dim", &self.dim)
            .field("file", &self.file)
            .finish()
    }
}

impl SpilledMatrix {
    /// Creates a zero-filled `dim x dim` matrix in `dir`, or in the system temp
    /// directory when `dir` is `None`. The file is removed when dropped.
    pub fn create(dim: usize, dir: Option<&Path>) -> Result<Self, KrrError> {
        let bytes = dim
            .checked_mul(dim)
            .and_then(|entries| entries.checked_mul(ENTRY_BYTES))
            .filter(|&bytes| bytes > 0)
            .ok_or_else(|| {
                KrrError::InvalidConfiguration(format!("cannot spill a {dim}x{dim} matrix"))
            })?;
        let file = match dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        file.set_len(bytes as u64)?;
        // The file is private to this process and never resized after mapping.
        let map = unsafe { MmapMut::map_mut(&file)? };
        log::debug!("Spilled a {dim}x{dim} matrix ({bytes} bytes) to disk");
        Ok(Self { map, dim, file })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    fn offset(&self, row: usize, col: usize) -> usize {
        (row * self.dim + col) * ENTRY_BYTES
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        let at = self.offset(row, col);
        let mut raw = [0u8; ENTRY_BYTES];
        raw.copy_from_slice(&self.map[at..at + ENTRY_BYTES]);
        f64::from_ne_bytes(raw)
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        let at = self.offset(row, col);
        self.map[at..at + ENTRY_BYTES].copy_from_slice(&value.to_ne_bytes());
    }

    /// Copies `row[cols]` into `out`.
    pub fn read_row_segment(&self, row: usize, cols: Range<usize>, out: &mut [f64]) {
        let start = self.offset(row, cols.start);
        let bytes = &self.map[start..start + cols.len() * ENTRY_BYTES];
        for (value, raw) in out.iter_mut().zip(bytes.chunks_exact(ENTRY_BYTES)) {
            let mut buf = [0u8; ENTRY_BYTES];
            buf.copy_from_slice(raw);
            *value = f64::from_ne_bytes(buf);
        }
    }

    pub fn read_tile(&self, rows: Range<usize>, cols: Range<usize>) -> Array2<f64> {
        let mut tile = Array2::zeros((rows.len(), cols.len()));
        for (local, row) in rows.enumerate() {
            let mut out = tile.row_mut(local);
            if let Some(slice) = out.as_slice_mut() {
                self.read_row_segment(row, cols.clone(), slice);
            }
        }
        tile
    }

    pub fn write_tile(&mut self, row0: usize, col0: usize, tile: ArrayView2<f64>) {
        for ((i, j), &value) in tile.indexed_iter() {
            self.set(row0 + i, col0 + j, value);
        }
    }

    /// Flushes dirty pages so a subsequent reader sees the final contents.
    pub fn flush(&self) -> Result<(), KrrError> {
        self.map.flush()?;
        Ok(())
    }

    /// The lower triangle as a dense matrix with zeros above the diagonal.
    pub fn lower_to_dense(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.dim, self.dim), |(i, j)| {
            if j <= i { self.get(i, j) } else { 0.0 }
        })
    }
}

/// A diagonal tile of a blocked factorization was not positive definite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonPositivePivot {
    /// First row of the failing diagonal tile.
    pub tile_start: usize,
}

/// Solves `x L^T = b` for every row of `b` in place, with `l` lower triangular.
pub(crate) fn solve_right_lower_transpose(l: ArrayView2<f64>, b: &mut Array2<f64>) {
    let n = l.nrows();
    for mut row in b.rows_mut() {
        for i in 0..n {
            let mut sum = row[i];
            for k in 0..i {
                sum -= l[[i, k]] * row[k];
            }
            row[i] = sum / l[[i, i]];
        }
    }
}

/// In-place right-looking blocked Cholesky of the lower triangle.
///
/// On success the lower triangle holds `L` with `A = L L^T` and the diagonal
/// tiles have zeros above their diagonal. Entries above the diagonal in
/// off-diagonal tiles are never read and keep whatever they held.
pub fn blocked_cholesky(matrix: &mut SpilledMatrix, side: usize) -> Result<(), NonPositivePivot> {
    let ranges = tile_ranges(matrix.dim(), side);
    for (k, kr) in ranges.iter().enumerate() {
        let akk = matrix.read_tile(kr.clone(), kr.clone());
        let lkk = akk
            .cholesky(Side::Lower)
            .map_err(|_| NonPositivePivot {
                tile_start: kr.start,
            })?
            .lower_factor();
        matrix.write_tile(kr.start, kr.start, lkk.view());

        for ir in &ranges[k + 1..] {
            let mut panel = matrix.read_tile(ir.clone(), kr.clone());
            solve_right_lower_transpose(lkk.view(), &mut panel);
            matrix.write_tile(ir.start, kr.start, panel.view());
        }

        for (j, jr) in ranges.iter().enumerate().skip(k + 1) {
            let ljk = matrix.read_tile(jr.clone(), kr.clone());
            for ir in &ranges[j..] {
                let lik = matrix.read_tile(ir.clone(), kr.clone());
                let mut aij = matrix.read_tile(ir.clone(), jr.clone());
                aij -= &lik.dot(&ljk.t());
                matrix.write_tile(ir.start, jr.start, aij.view());
            }
        }
    }
    Ok(())
}

/// Writes the lower triangle of `scale * L^T L + shift * I` into `out`, where
/// `factor` holds a lower triangular `L` as left by [`blocked_cholesky`].
pub fn blocked_lauum(
    factor: &SpilledMatrix,
    out: &mut SpilledMatrix,
    side: usize,
    scale: f64,
    shift: f64,
) {
    let ranges = tile_ranges(factor.dim(), side);
    for (i, ir) in ranges.iter().enumerate() {
        for jr in &ranges[..=i] {
            let mut acc = Array2::<f64>::zeros((ir.len(), jr.len()));
            for kr in &ranges[i..] {
                let lki = factor.read_tile(kr.clone(), ir.clone());
                let lkj = factor.read_tile(kr.clone(), jr.clone());
                acc += &lki.t().dot(&lkj);
            }
            acc *= scale;
            if ir.start == jr.start {
                for d in 0..ir.len() {
                    acc[[d, d]] += shift;
                }
            }
            out.write_tile(ir.start, jr.start, acc.view());
        }
    }
}
