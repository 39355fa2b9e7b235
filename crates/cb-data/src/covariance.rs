//! Symmetric positive-definite covariance matrix engine.
//!
//! The logical content is a single symmetric positive-definite matrix of
//! fixed size, physically held in one of two mutually exclusive forms:
//!
//! - **expanded**: up to three packed caches (covariance, inverse
//!   covariance, Cholesky factor of the covariance), synchronized lazily;
//!   setting elements of one form invalidates the others.
//! - **compressed**: the inverse covariance as a diagonal vector plus a
//!   sparse list of (packed offset, value) off-diagonal pairs. Lossless.
//!
//! Reads that need a missing representation convert on demand and memoize
//! the result, so logically-const accessors work through shared handles;
//! the caches therefore live behind a `RefCell`. The engine is
//! single-threaded by design and carries no locking.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::io::Write;
use std::mem;

use cb_core::{Error, Result};
use nalgebra::DMatrix;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::packed;

/// Physical storage: exactly one variant is authoritative at a time.
#[derive(Debug, Clone)]
enum Storage {
    Expanded {
        /// Packed covariance elements.
        cov: Option<Vec<f64>>,
        /// Packed inverse-covariance elements.
        icov: Option<Vec<f64>>,
        /// Cholesky factor of the covariance (not the inverse); slot
        /// `(i, j)` with `i <= j` holds `L(j, i)`.
        chol: Option<Vec<f64>>,
    },
    Compressed {
        /// Inverse-covariance diagonal.
        diag: Vec<f64>,
        /// Nonzero inverse-covariance off-diagonals as (packed offset, value).
        offdiag: Vec<(usize, f64)>,
    },
}

/// A fixed-size symmetric positive-definite covariance matrix.
///
/// Created with all-zero content, which is not a valid covariance until
/// enough elements have been set to make it positive definite.
#[derive(Debug, Clone)]
pub struct CovarianceMatrix {
    size: usize,
    storage: RefCell<Storage>,
}

fn empty_storage() -> Storage {
    Storage::Expanded { cov: None, icov: None, chol: None }
}

/// Undoes any compression, restoring the packed inverse covariance.
fn uncompress(st: &mut Storage, size: usize) {
    if let Storage::Compressed { diag, offdiag } = st {
        let mut icov = vec![0.0; packed::packed_len(size)];
        for (j, &v) in diag.iter().enumerate() {
            icov[packed::diag_index(j)] = v;
        }
        for &(k, v) in offdiag.iter() {
            icov[k] = v;
        }
        *st = Storage::Expanded { cov: None, icov: Some(icov), chol: None };
    }
}

/// Uncompresses and exposes the three expanded cache slots.
fn expanded(
    st: &mut Storage,
    size: usize,
) -> (&mut Option<Vec<f64>>, &mut Option<Vec<f64>>, &mut Option<Vec<f64>>) {
    uncompress(st, size);
    match st {
        Storage::Expanded { cov, icov, chol } => (cov, icov, chol),
        Storage::Compressed { .. } => unreachable!("storage was uncompressed above"),
    }
}

/// Materializes the covariance from the inverse if that is the only
/// representation. Returns the covariance slice, or `None` if no elements
/// have been set at all.
fn cov_slice<'a>(st: &'a mut Storage, size: usize) -> Result<Option<&'a Vec<f64>>> {
    let (cov, icov, _) = expanded(st, size);
    if cov.is_none() {
        if let Some(ic) = icov {
            *cov = Some(packed::invert_spd(ic, size)?);
        }
    }
    Ok(cov.as_ref().map(|c| &*c))
}

/// Materializes the inverse covariance, decomposing the covariance via
/// Cholesky when needed (the factor is memoized as a side effect).
fn icov_slice<'a>(st: &'a mut Storage, size: usize) -> Result<Option<&'a Vec<f64>>> {
    let (cov, icov, chol) = expanded(st, size);
    if icov.is_none() {
        if let Some(c) = cov {
            let ch = packed::cholesky_dense(c, size)?;
            if chol.is_none() {
                *chol = Some(packed::pack_lower(&ch.l()));
            }
            *icov = Some(packed::from_dense(&ch.inverse()));
        }
    }
    Ok(icov.as_ref().map(|ic| &*ic))
}

/// Materializes the Cholesky factor of the covariance, or fails with
/// `NotPositiveDefinite` (a matrix with no elements set has no factor).
fn chol_slice<'a>(st: &'a mut Storage, size: usize) -> Result<&'a Vec<f64>> {
    cov_slice(st, size)?;
    let (cov, _, chol) = expanded(st, size);
    if chol.is_none() {
        let c = cov.as_ref().ok_or_else(|| {
            Error::NotPositiveDefinite("no covariance elements have been set".to_string())
        })?;
        *chol = Some(packed::pack_lower(&packed::cholesky_dense(c, size)?.l()));
    }
    match chol {
        Some(c) => Ok(&*c),
        None => unreachable!("factor was materialized above"),
    }
}

/// Prepares to overwrite covariance elements: materializes the packed
/// covariance (zeros if nothing has been set) and drops the now-stale
/// inverse and Cholesky caches.
fn writable_cov<'a>(st: &'a mut Storage, size: usize) -> Result<&'a mut Vec<f64>> {
    cov_slice(st, size)?;
    let (cov, icov, chol) = expanded(st, size);
    *icov = None;
    *chol = None;
    Ok(cov.get_or_insert_with(|| vec![0.0; packed::packed_len(size)]))
}

/// Counterpart of `writable_cov` for the inverse covariance.
fn writable_icov<'a>(st: &'a mut Storage, size: usize) -> Result<&'a mut Vec<f64>> {
    icov_slice(st, size)?;
    let (cov, icov, chol) = expanded(st, size);
    *cov = None;
    *chol = None;
    Ok(icov.get_or_insert_with(|| vec![0.0; packed::packed_len(size)]))
}

fn check_diagonal(row: usize, col: usize, value: f64) -> Result<()> {
    if row == col && value <= 0.0 {
        return Err(Error::InvalidArgument(format!(
            "diagonal element ({row},{row}) must be positive, got {value}"
        )));
    }
    Ok(())
}

impl CovarianceMatrix {
    /// Creates a new size-by-size matrix with all elements zero.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument(
                "covariance matrix size must be positive".to_string(),
            ));
        }
        Ok(Self { size, storage: RefCell::new(empty_storage()) })
    }

    /// Creates a matrix from a packed covariance vector
    /// `{ m00, m01, m11, m02, m12, m22, ... }`; the size is inferred from
    /// the vector length.
    pub fn from_packed(packed: Vec<f64>) -> Result<Self> {
        let size = packed::size_from_len(packed.len())?;
        Ok(Self {
            size,
            storage: RefCell::new(Storage::Expanded {
                cov: Some(packed),
                icov: None,
                chol: None,
            }),
        })
    }

    /// Creates a diagonal covariance with a constant positive element.
    pub fn diagonal(size: usize, value: f64) -> Result<Self> {
        Self::with_diagonal(&vec![value; size])
    }

    /// Creates a diagonal covariance with the specified positive elements.
    pub fn with_diagonal(values: &[f64]) -> Result<Self> {
        let matrix = Self::new(values.len())?;
        {
            let mut st = matrix.storage.borrow_mut();
            let cov = writable_cov(&mut st, values.len())?;
            for (j, &v) in values.iter().enumerate() {
                check_diagonal(j, j, v)?;
                cov[packed::diag_index(j)] = v;
            }
        }
        Ok(matrix)
    }

    /// Generates a random symmetric positive-definite matrix whose
    /// determinant is fixed to `scale^size`, so the generated covariances
    /// are directly proportional to `scale`.
    pub fn random<R: Rng + ?Sized>(size: usize, scale: f64, rng: &mut R) -> Result<Self> {
        if scale <= 0.0 {
            return Err(Error::InvalidArgument(format!(
                "random covariance scale must be positive, got {scale}"
            )));
        }
        if size == 0 {
            return Err(Error::InvalidArgument(
                "covariance matrix size must be positive".to_string(),
            ));
        }
        let a: DMatrix<f64> = DMatrix::from_fn(size, size, |_, _| StandardNormal.sample(rng));
        let mut matrix = Self::from_packed(packed::from_dense(&(&a * a.transpose())))?;
        let log_det = matrix.log_determinant()?;
        matrix.apply_scale_factor(scale * (-log_det / size as f64).exp())?;
        Ok(matrix)
    }

    /// Fixed size of this matrix.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns covariance element `(row, col)`; `(row, col)` and
    /// `(col, row)` give the same result by construction.
    ///
    /// Converting from an inverse-only representation requires a potentially
    /// expensive inversion, which is memoized.
    pub fn get_covariance(&self, row: usize, col: usize) -> Result<f64> {
        let k = packed::packed_index(row, col, self.size)?;
        let mut st = self.storage.borrow_mut();
        Ok(cov_slice(&mut st, self.size)?.map_or(0.0, |c| c[k]))
    }

    /// Returns inverse-covariance element `(row, col)`, converting and
    /// memoizing on demand like [`Self::get_covariance`].
    pub fn get_inverse_covariance(&self, row: usize, col: usize) -> Result<f64> {
        let k = packed::packed_index(row, col, self.size)?;
        let mut st = self.storage.borrow_mut();
        Ok(icov_slice(&mut st, self.size)?.map_or(0.0, |ic| ic[k]))
    }

    /// Sets covariance element `(row, col)` and its mirror `(col, row)`.
    ///
    /// Diagonal elements must be positive. Invalidates the inverse and
    /// Cholesky caches.
    pub fn set_covariance(&mut self, row: usize, col: usize, value: f64) -> Result<()> {
        let k = packed::packed_index(row, col, self.size)?;
        check_diagonal(row, col, value)?;
        writable_cov(self.storage.get_mut(), self.size)?[k] = value;
        Ok(())
    }

    /// Sets inverse-covariance element `(row, col)` and its mirror.
    pub fn set_inverse_covariance(&mut self, row: usize, col: usize, value: f64) -> Result<()> {
        let k = packed::packed_index(row, col, self.size)?;
        check_diagonal(row, col, value)?;
        writable_icov(self.storage.get_mut(), self.size)?[k] = value;
        Ok(())
    }

    /// Multiplies the vector by the covariance in place.
    pub fn multiply_by_covariance(&self, vector: &mut [f64]) -> Result<()> {
        if vector.len() != self.size {
            return Err(Error::SizeMismatch(format!(
                "vector length {} does not match matrix size {}",
                vector.len(),
                self.size
            )));
        }
        let mut st = self.storage.borrow_mut();
        match cov_slice(&mut st, self.size)? {
            Some(c) => {
                let out = packed::multiply(c, vector);
                vector.copy_from_slice(&out);
            }
            None => vector.fill(0.0),
        }
        Ok(())
    }

    /// Multiplies the vector by the inverse covariance in place.
    pub fn multiply_by_inverse_covariance(&self, vector: &mut [f64]) -> Result<()> {
        if vector.len() != self.size {
            return Err(Error::SizeMismatch(format!(
                "vector length {} does not match matrix size {}",
                vector.len(),
                self.size
            )));
        }
        let mut st = self.storage.borrow_mut();
        match icov_slice(&mut st, self.size)? {
            Some(ic) => {
                let out = packed::multiply(ic, vector);
                vector.copy_from_slice(&out);
            }
            None => vector.fill(0.0),
        }
        Ok(())
    }

    /// Calculates `delta . Cinv . delta` for the specified residuals.
    pub fn chi_square(&self, delta: &[f64]) -> Result<f64> {
        if delta.len() != self.size {
            return Err(Error::SizeMismatch(format!(
                "residuals length {} does not match matrix size {}",
                delta.len(),
                self.size
            )));
        }
        let mut st = self.storage.borrow_mut();
        match icov_slice(&mut st, self.size)? {
            Some(ic) => {
                let weighted = packed::multiply(ic, delta);
                Ok(delta.iter().zip(&weighted).map(|(d, w)| d * w).sum())
            }
            None => Ok(0.0),
        }
    }

    /// Multiplies every element of the covariance by a positive factor.
    pub fn apply_scale_factor(&mut self, scale: f64) -> Result<()> {
        if scale <= 0.0 {
            return Err(Error::InvalidArgument(format!(
                "scale factor must be positive, got {scale}"
            )));
        }
        let (cov, icov, chol) = expanded(self.storage.get_mut(), self.size);
        if let Some(c) = cov {
            for v in c.iter_mut() {
                *v *= scale;
            }
        }
        if let Some(ic) = icov {
            for v in ic.iter_mut() {
                *v /= scale;
            }
        }
        if let Some(ch) = chol {
            let root = scale.sqrt();
            for v in ch.iter_mut() {
                *v *= root;
            }
        }
        Ok(())
    }

    /// Overwrites the receiver `A` with the congruence transform
    /// `A . Binv . A` for the argument `B`. Both matrices must be positive
    /// definite.
    pub fn replace_with_triple_product(&mut self, other: &CovarianceMatrix) -> Result<()> {
        if other.size != self.size {
            return Err(Error::SizeMismatch(format!(
                "matrix sizes {} and {} differ",
                self.size, other.size
            )));
        }
        let b_inv = {
            let mut ost = other.storage.borrow_mut();
            let ic = icov_slice(&mut ost, other.size)?.ok_or_else(|| {
                Error::NotPositiveDefinite(
                    "argument matrix has no elements set".to_string(),
                )
            })?;
            packed::to_dense(ic, other.size)
        };
        let st = self.storage.get_mut();
        chol_slice(st, self.size)?;
        let (cov, icov, chol) = expanded(st, self.size);
        let c = cov.as_ref().ok_or_else(|| {
            Error::NotPositiveDefinite("no covariance elements have been set".to_string())
        })?;
        let a = packed::to_dense(c, self.size);
        *cov = Some(packed::from_dense(&(&a * b_inv * &a)));
        *icov = None;
        *chol = None;
        Ok(())
    }

    /// Adds `weight * other.inverse` element-wise into the receiver's
    /// inverse covariance: the precision-weighted fusion of independent
    /// Gaussian estimates. A compressed `other` is read without
    /// decompressing it.
    pub fn add_inverse(&mut self, other: &CovarianceMatrix, weight: f64) -> Result<()> {
        if weight <= 0.0 {
            return Err(Error::InvalidArgument(format!(
                "combination weight must be positive, got {weight}"
            )));
        }
        if other.size != self.size {
            return Err(Error::SizeMismatch(format!(
                "matrix sizes {} and {} differ",
                self.size, other.size
            )));
        }
        let ic = writable_icov(self.storage.get_mut(), self.size)?;
        let mut ost = other.storage.borrow_mut();
        if let Storage::Compressed { diag, offdiag } = &*ost {
            for (j, &v) in diag.iter().enumerate() {
                ic[packed::diag_index(j)] += weight * v;
            }
            for &(k, v) in offdiag.iter() {
                ic[k] += weight * v;
            }
            return Ok(());
        }
        if let Some(oic) = icov_slice(&mut ost, other.size)? {
            for (dst, src) in ic.iter_mut().zip(oic.iter()) {
                *dst += weight * src;
            }
        }
        Ok(())
    }

    /// Symmetric eigendecomposition of the covariance.
    ///
    /// Returns eigenvalues in ascending order and the eigenvectors as a
    /// flattened `size*size` array with row `k` giving mode `k`.
    pub fn get_eigen_modes(&self) -> Result<(Vec<f64>, Vec<f64>)> {
        let mut st = self.storage.borrow_mut();
        let dense = match cov_slice(&mut st, self.size)? {
            Some(c) => c.clone(),
            None => vec![0.0; packed::packed_len(self.size)],
        };
        Ok(packed::eigen(&dense, self.size))
    }

    /// Rescales the covariance eigenmodes in place by the supplied
    /// positive per-mode factors.
    pub fn rescale_eigenvalues(&mut self, mode_scales: &[f64]) -> Result<()> {
        if mode_scales.len() != self.size {
            return Err(Error::SizeMismatch(format!(
                "{} mode scales for a size-{} matrix",
                mode_scales.len(),
                self.size
            )));
        }
        for &s in mode_scales {
            if s <= 0.0 {
                return Err(Error::InvalidArgument(format!(
                    "mode scales must be positive, got {s}"
                )));
            }
        }
        let n = self.size;
        let st = self.storage.get_mut();
        let (values, modes) = match cov_slice(st, n)? {
            Some(c) => packed::eigen(c, n),
            None => {
                return Err(Error::NotPositiveDefinite(
                    "no covariance elements have been set".to_string(),
                ))
            }
        };
        let mut out = vec![0.0; packed::packed_len(n)];
        for k in 0..n {
            let w = mode_scales[k] * values[k];
            let mode = &modes[k * n..(k + 1) * n];
            for j in 0..n {
                let base = j * (j + 1) / 2;
                for i in 0..=j {
                    out[base + i] += w * mode[i] * mode[j];
                }
            }
        }
        let (cov, icov, chol) = expanded(st, n);
        *cov = Some(out);
        *icov = None;
        *chol = None;
        Ok(())
    }

    /// Draws one sample `delta = L . z` from the Gaussian density implied
    /// by this matrix, where `L` is the Cholesky factor of the covariance
    /// and `z` is a vector of independent standard-normal variates from
    /// the supplied generator.
    ///
    /// Returns the sampled residuals and `z.z/2`, the negative
    /// log-likelihood of the drawn offset.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<(Vec<f64>, f64)> {
        let mut st = self.storage.borrow_mut();
        let l = chol_slice(&mut st, self.size)?;
        let z: Vec<f64> = (0..self.size).map(|_| StandardNormal.sample(rng)).collect();
        let delta = multiply_lower(l, &z);
        let nll = 0.5 * z.iter().map(|z| z * z).sum::<f64>();
        Ok((delta, nll))
    }

    /// Draws `nsample` residual vectors, stored consecutively in the
    /// returned vector: elements `[n*size, (n+1)*size)` hold sample `n`.
    ///
    /// Factorizes once up front, so this is faster than repeated
    /// [`Self::sample`] calls for large `nsample`.
    pub fn sample_batch<R: Rng + ?Sized>(&self, nsample: usize, rng: &mut R) -> Result<Vec<f64>> {
        let mut st = self.storage.borrow_mut();
        let l = chol_slice(&mut st, self.size)?;
        let mut out = Vec::with_capacity(nsample * self.size);
        let mut z = vec![0.0; self.size];
        for _ in 0..nsample {
            for v in z.iter_mut() {
                *v = StandardNormal.sample(rng);
            }
            out.extend_from_slice(&multiply_lower(l, &z));
        }
        Ok(out)
    }

    /// Natural log of the determinant of the covariance.
    pub fn log_determinant(&self) -> Result<f64> {
        let mut st = self.storage.borrow_mut();
        let l = chol_slice(&mut st, self.size)?;
        Ok(2.0 * (0..self.size).map(|j| l[packed::diag_index(j)].ln()).sum::<f64>())
    }

    /// True iff the currently-held covariance admits a Cholesky
    /// factorization.
    pub fn is_positive_definite(&self) -> bool {
        let mut st = self.storage.borrow_mut();
        chol_slice(&mut st, self.size).is_ok()
    }

    /// Eliminates every row and column whose index is not in `keep`,
    /// re-indexing the survivors in ascending original-index order.
    /// Pruning is done in place.
    pub fn prune(&mut self, keep: &BTreeSet<usize>) -> Result<()> {
        for &k in keep {
            if k >= self.size {
                return Err(Error::InvalidArgument(format!(
                    "kept index {k} outside a size-{} matrix",
                    self.size
                )));
            }
        }
        if keep.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot prune a covariance matrix to zero size".to_string(),
            ));
        }
        if keep.len() == self.size {
            return Ok(());
        }
        let new_size = keep.len();
        let st = self.storage.get_mut();
        cov_slice(st, self.size)?;
        let (cov, icov, chol) = expanded(st, self.size);
        if let Some(c) = cov {
            let kept: Vec<usize> = keep.iter().copied().collect();
            // kept[k] >= k, so every read is at or beyond the write cursor.
            for nj in 0..new_size {
                for ni in 0..=nj {
                    c[ni + nj * (nj + 1) / 2] = c[kept[ni] + kept[nj] * (kept[nj] + 1) / 2];
                }
            }
            c.truncate(packed::packed_len(new_size));
        }
        *icov = None;
        *chol = None;
        self.size = new_size;
        Ok(())
    }

    /// Requests lossless compression to the diagonal-plus-sparse form.
    ///
    /// Compression happens only when the sparse encoding of the inverse
    /// covariance is smaller than one packed vector; returns whether the
    /// matrix is compressed afterwards. Any subsequent operation other than
    /// the size and compression queries (and [`Self::add_inverse`] on the
    /// argument side) decompresses transparently.
    pub fn compress(&self) -> bool {
        let mut st = self.storage.borrow_mut();
        if matches!(*st, Storage::Compressed { .. }) {
            return true;
        }
        let icov = match icov_slice(&mut st, self.size) {
            Ok(Some(ic)) => ic,
            Ok(None) | Err(_) => return false,
        };
        let mut diag = vec![0.0; self.size];
        let mut offdiag = Vec::new();
        for j in 0..self.size {
            let base = j * (j + 1) / 2;
            for i in 0..=j {
                let v = icov[base + i];
                if i == j {
                    diag[j] = v;
                } else if v != 0.0 {
                    offdiag.push((base + i, v));
                }
            }
        }
        if self.size + 2 * offdiag.len() < packed::packed_len(self.size) {
            *st = Storage::Compressed { diag, offdiag };
            true
        } else {
            false
        }
    }

    /// True iff this matrix is currently compressed.
    pub fn is_compressed(&self) -> bool {
        matches!(*self.storage.borrow(), Storage::Compressed { .. })
    }

    /// Bytes of storage allocated by this object.
    pub fn get_memory_usage(&self) -> usize {
        let vec_bytes = |v: &Option<Vec<f64>>| {
            v.as_ref().map_or(0, |v| v.capacity() * mem::size_of::<f64>())
        };
        mem::size_of::<Self>()
            + match &*self.storage.borrow() {
                Storage::Expanded { cov, icov, chol } => {
                    vec_bytes(cov) + vec_bytes(icov) + vec_bytes(chol)
                }
                Storage::Compressed { diag, offdiag } => {
                    diag.capacity() * mem::size_of::<f64>()
                        + offdiag.capacity() * mem::size_of::<(usize, f64)>()
                }
            }
    }

    /// Compact state string `[MICDZV] nnnnnnn`: one letter per internal
    /// vector (`-` when unallocated) followed by [`Self::get_memory_usage`].
    /// M, I, C are the covariance, inverse, and Cholesky caches; D, Z, V
    /// are the compressed diagonal and off-diagonal vectors.
    pub fn get_memory_state(&self) -> String {
        let tag = |symbol: char, allocated: bool| if allocated { symbol } else { '-' };
        let tags = match &*self.storage.borrow() {
            Storage::Expanded { cov, icov, chol } => [
                tag('M', cov.is_some()),
                tag('I', icov.is_some()),
                tag('C', chol.is_some()),
                '-',
                '-',
                '-',
            ],
            Storage::Compressed { offdiag, .. } => [
                '-',
                '-',
                '-',
                'D',
                tag('Z', !offdiag.is_empty()),
                tag('V', !offdiag.is_empty()),
            ],
        };
        format!("[{}] {:7}", tags.iter().collect::<String>(), self.get_memory_usage())
    }

    /// Prints the matrix elements row by row. With `normalized`, diagonal
    /// entries print as sqrt(cov) and off-diagonals as correlation
    /// coefficients `rho(i,j) = cov(i,j)/sqrt(cov(i,i)*cov(j,j))`.
    pub fn print_to_stream<W: Write>(&self, out: &mut W, normalized: bool) -> Result<()> {
        for i in 0..self.size {
            for j in 0..self.size {
                let value = if normalized {
                    let c = self.get_covariance(i, j)?;
                    if i == j {
                        c.sqrt()
                    } else {
                        c / (self.get_covariance(i, i)? * self.get_covariance(j, j)?).sqrt()
                    }
                } else {
                    self.get_covariance(i, j)?
                };
                write!(out, " {value:+10.3e}")?;
            }
            writeln!(out)?;
        }
        Ok(())
    }
}

/// Multiplies a packed transposed lower-triangular factor by a vector:
/// `out[i] = sum_{j<=i} L(i,j) z[j]`.
fn multiply_lower(l: &[f64], z: &[f64]) -> Vec<f64> {
    let n = z.len();
    let mut out = vec![0.0; n];
    for i in 0..n {
        let base = i * (i + 1) / 2;
        out[i] = (0..=i).map(|j| l[base + j] * z[j]).sum();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_new_rejects_zero_size() {
        assert!(matches!(CovarianceMatrix::new(0), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_from_packed_size_inference() {
        let m = CovarianceMatrix::from_packed(vec![1.0, 0.0, 2.0, 0.0, 0.0, 4.0]).unwrap();
        assert_eq!(m.size(), 3);
        assert_eq!(m.get_covariance(1, 1).unwrap(), 2.0);
        assert!(CovarianceMatrix::from_packed(vec![1.0; 5]).is_err());
    }

    #[test]
    fn test_set_get_symmetry() {
        let mut m = CovarianceMatrix::new(3).unwrap();
        m.set_covariance(0, 0, 1.0).unwrap();
        m.set_covariance(2, 0, 0.25).unwrap();
        assert_eq!(m.get_covariance(0, 2).unwrap(), 0.25);
        assert_eq!(m.get_covariance(2, 0).unwrap(), 0.25);
        // Unset elements of a fresh matrix read as zero.
        assert_eq!(m.get_covariance(1, 2).unwrap(), 0.0);
    }

    #[test]
    fn test_diagonal_must_stay_positive() {
        let mut m = CovarianceMatrix::new(2).unwrap();
        assert!(matches!(m.set_covariance(1, 1, 0.0), Err(Error::InvalidArgument(_))));
        assert!(matches!(m.set_inverse_covariance(0, 0, -1.0), Err(Error::InvalidArgument(_))));
        assert!(matches!(m.set_covariance(2, 0, 1.0), Err(Error::OutOfRange(_))));
    }

    #[test]
    fn test_inverse_conversion() {
        // [[2, 1], [1, 2]] has inverse [[2, -1], [-1, 2]] / 3.
        let mut m = CovarianceMatrix::new(2).unwrap();
        m.set_covariance(0, 0, 2.0).unwrap();
        m.set_covariance(0, 1, 1.0).unwrap();
        m.set_covariance(1, 1, 2.0).unwrap();
        assert!((m.get_inverse_covariance(0, 0).unwrap() - 2.0 / 3.0).abs() < 1e-12);
        assert!((m.get_inverse_covariance(1, 0).unwrap() + 1.0 / 3.0).abs() < 1e-12);
        // Round trip back to the covariance after an inverse-side write.
        m.set_inverse_covariance(0, 0, 1.0).unwrap();
        assert!(m.get_covariance(0, 0).unwrap() > 0.0);
    }

    #[test]
    fn test_not_positive_definite_surfaces() {
        let mut m = CovarianceMatrix::new(2).unwrap();
        m.set_covariance(0, 0, 1.0).unwrap();
        m.set_covariance(1, 1, 1.0).unwrap();
        m.set_covariance(0, 1, 2.0).unwrap();
        assert!(matches!(
            m.get_inverse_covariance(0, 0),
            Err(Error::NotPositiveDefinite(_))
        ));
        assert!(!m.is_positive_definite());
    }

    #[test]
    fn test_multiply_and_chi_square() {
        let m = CovarianceMatrix::with_diagonal(&[2.0, 4.0]).unwrap();
        let mut v = vec![1.0, 1.0];
        m.multiply_by_covariance(&mut v).unwrap();
        assert_eq!(v, vec![2.0, 4.0]);
        m.multiply_by_inverse_covariance(&mut v).unwrap();
        assert_eq!(v, vec![1.0, 1.0]);
        let chi2 = m.chi_square(&[2.0, 2.0]).unwrap();
        assert!((chi2 - (4.0 / 2.0 + 4.0 / 4.0)).abs() < 1e-12);
        assert!(matches!(m.chi_square(&[1.0]), Err(Error::SizeMismatch(_))));
    }

    #[test]
    fn test_apply_scale_factor() {
        let mut m = CovarianceMatrix::with_diagonal(&[1.0, 1.0]).unwrap();
        // Populate all three caches before scaling.
        let _ = m.get_inverse_covariance(0, 0).unwrap();
        let _ = m.log_determinant().unwrap();
        m.apply_scale_factor(4.0).unwrap();
        assert_eq!(m.get_covariance(0, 0).unwrap(), 4.0);
        assert_eq!(m.get_inverse_covariance(0, 0).unwrap(), 0.25);
        assert!((m.log_determinant().unwrap() - 2.0 * 4.0_f64.ln()).abs() < 1e-12);
        assert!(m.apply_scale_factor(0.0).is_err());
    }

    #[test]
    fn test_triple_product() {
        // A = diag(2), B = diag(4): A . Binv . A = diag(1).
        let mut a = CovarianceMatrix::diagonal(2, 2.0).unwrap();
        let b = CovarianceMatrix::diagonal(2, 4.0).unwrap();
        a.replace_with_triple_product(&b).unwrap();
        assert!((a.get_covariance(0, 0).unwrap() - 1.0).abs() < 1e-12);
        assert!((a.get_covariance(0, 1).unwrap()).abs() < 1e-12);
    }

    #[test]
    fn test_add_inverse_closed_form() {
        // Cinv = n1/v1 + n2/v2 per diagonal entry.
        let (v1, v2, n1, n2) = (2.0, 0.5, 3.0, 5.0);
        let mut c = CovarianceMatrix::diagonal(2, v1 / n1).unwrap();
        let other = CovarianceMatrix::diagonal(2, v2).unwrap();
        c.add_inverse(&other, n2).unwrap();
        let expect = n1 / v1 + n2 / v2;
        assert!((c.get_inverse_covariance(0, 0).unwrap() - expect).abs() < 1e-12);
        assert!(matches!(c.add_inverse(&other, 0.0), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_add_inverse_from_compressed() {
        let mut c = CovarianceMatrix::new(2).unwrap();
        let other = CovarianceMatrix::diagonal(2, 0.25).unwrap();
        assert!(other.compress());
        c.add_inverse(&other, 2.0).unwrap();
        assert!(other.is_compressed());
        assert_eq!(c.get_inverse_covariance(0, 0).unwrap(), 8.0);
        assert_eq!(c.get_inverse_covariance(0, 1).unwrap(), 0.0);
    }

    #[test]
    fn test_compress_lossless() {
        let mut m = CovarianceMatrix::new(3).unwrap();
        for j in 0..3 {
            m.set_inverse_covariance(j, j, 0.5).unwrap();
        }
        assert!(m.compress());
        assert!(m.is_compressed());
        assert_eq!(m.get_inverse_covariance(1, 1).unwrap(), 0.5);
        assert!(!m.is_compressed());
        assert!((m.get_covariance(1, 1).unwrap() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_compress_skips_dense_matrices() {
        let mut m = CovarianceMatrix::diagonal(3, 1.0).unwrap();
        for j in 0..3 {
            for i in 0..j {
                m.set_covariance(i, j, 0.1).unwrap();
            }
        }
        assert!(!m.compress());
        assert!(!m.is_compressed());
    }

    #[test]
    fn test_eigen_modes() {
        let m = CovarianceMatrix::with_diagonal(&[4.0, 1.0]).unwrap();
        let (values, modes) = m.get_eigen_modes().unwrap();
        assert!((values[0] - 1.0).abs() < 1e-12);
        assert!((values[1] - 4.0).abs() < 1e-12);
        // Lowest mode points along axis 1, up to sign.
        assert!((modes[1].abs() - 1.0).abs() < 1e-12);
        assert!(modes[0].abs() < 1e-12);
    }

    #[test]
    fn test_rescale_eigenvalues() {
        let mut m = CovarianceMatrix::with_diagonal(&[1.0, 2.0]).unwrap();
        m.rescale_eigenvalues(&[2.0, 2.0]).unwrap();
        assert!((m.get_covariance(0, 0).unwrap() - 2.0).abs() < 1e-12);
        assert!((m.get_covariance(1, 1).unwrap() - 4.0).abs() < 1e-12);
        assert!(m.rescale_eigenvalues(&[1.0]).is_err());
        assert!(m.rescale_eigenvalues(&[1.0, -1.0]).is_err());
    }

    #[test]
    fn test_prune() {
        let mut m = CovarianceMatrix::with_diagonal(&[1.0, 2.0, 3.0]).unwrap();
        m.set_covariance(0, 2, 0.25).unwrap();
        let keep: BTreeSet<usize> = [0, 2].into_iter().collect();
        m.prune(&keep).unwrap();
        assert_eq!(m.size(), 2);
        assert_eq!(m.get_covariance(0, 0).unwrap(), 1.0);
        assert_eq!(m.get_covariance(1, 1).unwrap(), 3.0);
        assert_eq!(m.get_covariance(0, 1).unwrap(), 0.25);
        assert!(m.prune(&[5].into_iter().collect()).is_err());
        assert!(m.prune(&BTreeSet::new()).is_err());
    }

    #[test]
    fn test_prune_full_set_is_noop() {
        let mut m = CovarianceMatrix::with_diagonal(&[1.0, 2.0]).unwrap();
        m.prune(&[0, 1].into_iter().collect()).unwrap();
        assert_eq!(m.size(), 2);
        assert_eq!(m.get_covariance(1, 1).unwrap(), 2.0);
    }

    #[test]
    fn test_sample_shapes_and_nll() {
        let m = CovarianceMatrix::diagonal(3, 1.0).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let (delta, nll) = m.sample(&mut rng).unwrap();
        assert_eq!(delta.len(), 3);
        // Unit covariance: nll must equal delta.delta/2.
        let direct = 0.5 * delta.iter().map(|d| d * d).sum::<f64>();
        assert!((nll - direct).abs() < 1e-12);
        let batch = m.sample_batch(10, &mut rng).unwrap();
        assert_eq!(batch.len(), 30);
    }

    #[test]
    fn test_sample_requires_positive_definite() {
        let m = CovarianceMatrix::new(2).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(m.sample(&mut rng), Err(Error::NotPositiveDefinite(_))));
    }

    #[test]
    fn test_log_determinant() {
        let m = CovarianceMatrix::with_diagonal(&[2.0, 2.0]).unwrap();
        assert!((m.log_determinant().unwrap() - 4.0_f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_random_covariance_determinant() {
        let mut rng = StdRng::seed_from_u64(42);
        let scale = 2.5;
        let m = CovarianceMatrix::random(4, scale, &mut rng).unwrap();
        assert!(m.is_positive_definite());
        assert!((m.log_determinant().unwrap() - 4.0 * scale.ln()).abs() < 1e-9);
    }

    #[test]
    fn test_memory_state_tags() {
        let mut m = CovarianceMatrix::new(2).unwrap();
        assert!(m.get_memory_state().starts_with("[------]"));
        m.set_covariance(0, 0, 1.0).unwrap();
        assert!(m.get_memory_state().starts_with("[M-----]"));
        m.set_covariance(1, 1, 1.0).unwrap();
        let _ = m.get_inverse_covariance(0, 0).unwrap();
        assert!(m.get_memory_state().starts_with("[MIC---]"));
        assert!(m.compress());
        assert!(m.get_memory_state().starts_with("[---D--]"));
    }

    #[test]
    fn test_print_to_stream() {
        let m = CovarianceMatrix::with_diagonal(&[4.0, 1.0]).unwrap();
        let mut buf = Vec::new();
        m.print_to_stream(&mut buf, true).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 2);
        // Normalized diagonal prints sqrt of the variance.
        assert!(text.lines().next().unwrap().contains("+2.000e0"));
    }
}
