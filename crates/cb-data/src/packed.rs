//! BLAS-style packed symmetric storage helpers.
//!
//! A symmetric `size x size` matrix is stored column-wise as the
//! `size*(size+1)/2` elements of its upper triangle: element `(i, j)` with
//! `i <= j` lives at offset `i + j*(j+1)/2`. The dense conversions at the
//! `nalgebra` boundary are used for the expensive factorizations; everything
//! element-wise stays packed.

use std::cmp::Ordering;

use cb_core::{Error, Result};
use nalgebra::{Cholesky, DMatrix, Dyn};

/// Number of packed elements of a symmetric matrix of the given size.
pub fn packed_len(size: usize) -> usize {
    size * (size + 1) / 2
}

/// Packed offset of element `(row, col)`, symmetric in its arguments.
pub fn packed_index(row: usize, col: usize, size: usize) -> Result<usize> {
    if row >= size || col >= size {
        return Err(Error::OutOfRange(format!(
            "element ({row},{col}) outside a {size}x{size} matrix"
        )));
    }
    let (i, j) = if row <= col { (row, col) } else { (col, row) };
    Ok(i + j * (j + 1) / 2)
}

/// Packed offset of diagonal element `(j, j)`; no bounds check.
pub(crate) fn diag_index(j: usize) -> usize {
    j + j * (j + 1) / 2
}

/// Matrix size whose packed length is `len`, or `InvalidArgument` if `len`
/// is not of the form `n*(n+1)/2` for some `n >= 1`.
pub fn size_from_len(len: usize) -> Result<usize> {
    let size = (((8.0 * len as f64 + 1.0).sqrt() - 1.0) / 2.0).round() as usize;
    if size == 0 || packed_len(size) != len {
        return Err(Error::InvalidArgument(format!(
            "packed vector length {len} does not fit any symmetric matrix"
        )));
    }
    Ok(size)
}

/// Expands a packed symmetric matrix to dense form.
pub fn to_dense(packed: &[f64], size: usize) -> DMatrix<f64> {
    DMatrix::from_fn(size, size, |i, j| {
        let (a, b) = if i <= j { (i, j) } else { (j, i) };
        packed[a + b * (b + 1) / 2]
    })
}

/// Packs the upper triangle of a dense symmetric matrix.
pub fn from_dense(m: &DMatrix<f64>) -> Vec<f64> {
    let n = m.nrows();
    let mut out = Vec::with_capacity(packed_len(n));
    for j in 0..n {
        for i in 0..=j {
            out.push(m[(i, j)]);
        }
    }
    out
}

/// Packs a lower-triangular Cholesky factor `L` so that slot `(i, j)` with
/// `i <= j` holds `L(j, i)`, i.e. the factor is stored transposed.
pub(crate) fn pack_lower(l: &DMatrix<f64>) -> Vec<f64> {
    let n = l.nrows();
    let mut out = Vec::with_capacity(packed_len(n));
    for j in 0..n {
        for i in 0..=j {
            out.push(l[(j, i)]);
        }
    }
    out
}

/// Cholesky decomposition of a packed symmetric matrix, or
/// `NotPositiveDefinite` if the factorization fails.
pub(crate) fn cholesky_dense(packed: &[f64], size: usize) -> Result<Cholesky<f64, Dyn>> {
    to_dense(packed, size).cholesky().ok_or_else(|| {
        Error::NotPositiveDefinite("Cholesky decomposition failed".to_string())
    })
}

/// Inverts a packed symmetric positive-definite matrix.
pub(crate) fn invert_spd(packed: &[f64], size: usize) -> Result<Vec<f64>> {
    Ok(from_dense(&cholesky_dense(packed, size)?.inverse()))
}

/// Multiplies a packed symmetric matrix by a vector.
pub fn multiply(packed: &[f64], v: &[f64]) -> Vec<f64> {
    let n = v.len();
    let mut out = vec![0.0; n];
    for j in 0..n {
        let base = j * (j + 1) / 2;
        for i in 0..=j {
            let m = packed[base + i];
            out[i] += m * v[j];
            if i != j {
                out[j] += m * v[i];
            }
        }
    }
    out
}

/// Symmetric eigendecomposition of a packed matrix.
///
/// Returns eigenvalues in ascending order and the eigenvectors flattened to
/// `size*size` elements, with row `k` (elements `[k*size, (k+1)*size)`)
/// holding mode `k`.
pub fn eigen(packed: &[f64], size: usize) -> (Vec<f64>, Vec<f64>) {
    let se = to_dense(packed, size).symmetric_eigen();
    let mut order: Vec<usize> = (0..size).collect();
    order.sort_by(|&a, &b| {
        se.eigenvalues[a].partial_cmp(&se.eigenvalues[b]).unwrap_or(Ordering::Equal)
    });
    let mut values = Vec::with_capacity(size);
    let mut modes = vec![0.0; size * size];
    for (k, &col) in order.iter().enumerate() {
        values.push(se.eigenvalues[col]);
        for b in 0..size {
            modes[k * size + b] = se.eigenvectors[(b, col)];
        }
    }
    (values, modes)
}
