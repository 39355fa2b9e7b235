//! Sparse binned-data container with shared covariance.
//!
//! A [`BinnedData`] owns sparse values over a grid's bin space: `offset`
//! maps every global bin index to a compact offset (or nothing), `index`
//! is the insertion-ordered list of occupied bins, and `data` holds one
//! value per occupied bin. The data vector is kept in either the raw
//! ("unweighted") or the inverse-covariance-applied ("weighted")
//! representation, toggling lazily with a one-slot cache of the other
//! form.
//!
//! A covariance matrix may be shared by several datasets through `Rc`;
//! in-place mutation requires exclusive ownership, and operations that
//! must mutate a shared matrix clone it first. This copy-on-write
//! discipline is the only aliasing control: everything is single-threaded.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::io::Write;
use std::mem;
use std::rc::Rc;

use cb_core::{Error, Grid, Result};
use rand::Rng;

use crate::covariance::CovarianceMatrix;

/// The data vector, its representation tag, and the one-slot cache of the
/// alternate representation.
#[derive(Debug, Clone)]
struct DataState {
    data: Vec<f64>,
    cache: Vec<f64>,
    weighted: bool,
}

/// Sparse measured values over a grid, with correlated uncertainties.
pub struct BinnedData<G: Grid> {
    grid: Rc<G>,
    offset: Vec<Option<usize>>,
    index: Vec<usize>,
    state: RefCell<DataState>,
    covariance: Option<Rc<CovarianceMatrix>>,
    /// Stand-in for an inverse-variance-only covariance when none is
    /// attached.
    weight: f64,
    finalized: bool,
}

impl<G: Grid> Clone for BinnedData<G> {
    fn clone(&self) -> Self {
        Self {
            grid: Rc::clone(&self.grid),
            offset: self.offset.clone(),
            index: self.index.clone(),
            state: RefCell::new(self.state.borrow().clone()),
            // The covariance is shared by reference, not deep-copied.
            covariance: self.covariance.clone(),
            weight: self.weight,
            finalized: self.finalized,
        }
    }
}

impl<G: Grid> BinnedData<G> {
    /// Creates an empty dataset bound to the grid: scalar weight 1,
    /// unweighted, not finalized.
    pub fn new(grid: Rc<G>) -> Self {
        let n_total = grid.n_bins_total();
        Self {
            grid,
            offset: vec![None; n_total],
            index: Vec::new(),
            state: RefCell::new(DataState { data: Vec::new(), cache: Vec::new(), weighted: false }),
            covariance: None,
            weight: 1.0,
            finalized: false,
        }
    }

    /// Fresh empty dataset sharing only this dataset's grid binding.
    pub fn clone_binning(&self) -> Self {
        Self::new(Rc::clone(&self.grid))
    }

    /// The grid this dataset is bound to.
    pub fn grid(&self) -> &Rc<G> {
        &self.grid
    }

    /// Total number of bins in the grid.
    pub fn n_bins_total(&self) -> usize {
        self.grid.n_bins_total()
    }

    /// Number of bins that currently hold data.
    pub fn n_bins_with_data(&self) -> usize {
        self.index.len()
    }

    /// Occupied global bin indices in insertion order.
    pub fn indices(&self) -> &[usize] {
        &self.index
    }

    /// Global index of the bin stored at the given compact offset.
    pub fn index_at_offset(&self, offset: usize) -> Result<usize> {
        self.index.get(offset).copied().ok_or_else(|| {
            Error::OutOfRange(format!(
                "offset {offset} beyond the {} occupied bins",
                self.index.len()
            ))
        })
    }

    /// Compact offset of the bin with the given global index.
    pub fn offset_for_index(&self, index: usize) -> Result<usize> {
        self.offset_of(index)?
            .ok_or_else(|| Error::EmptyBin(format!("no data at index {index}")))
    }

    /// True iff the bin with the given global index holds data.
    pub fn has_data(&self, index: usize) -> Result<bool> {
        Ok(self.offset_of(index)?.is_some())
    }

    /// True iff a covariance matrix is attached.
    pub fn has_covariance(&self) -> bool {
        self.covariance.is_some()
    }

    /// True iff no other dataset shares the attached covariance (vacuously
    /// true when none is attached).
    pub fn is_covariance_modifiable(&self) -> bool {
        self.covariance.as_ref().map_or(true, |c| Rc::strong_count(c) == 1)
    }

    /// Shared handle to the attached covariance, if any.
    pub fn covariance_matrix(&self) -> Option<Rc<CovarianceMatrix>> {
        self.covariance.clone()
    }

    /// True iff this dataset has been finalized.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Forbids adding new bins or attaching/replacing covariance from now
    /// on. Irreversible.
    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    fn offset_of(&self, index: usize) -> Result<Option<usize>> {
        self.grid.check_index(index)?;
        Ok(self.offset[index])
    }

    /// Lazily toggles the stored representation. With `flush`, the cache of
    /// the alternate representation is discarded; otherwise it is kept (or
    /// populated) so the next toggle is a swap.
    fn set_weighted(&self, weighted: bool, flush: bool) -> Result<()> {
        let mut st = self.state.borrow_mut();
        if weighted != st.weighted {
            if !st.cache.is_empty() {
                let DataState { data, cache, .. } = &mut *st;
                mem::swap(data, cache);
            } else {
                let mut transformed = st.data.clone();
                if let Some(cov) = &self.covariance {
                    if !transformed.is_empty() {
                        if weighted {
                            cov.multiply_by_inverse_covariance(&mut transformed)?;
                        } else {
                            cov.multiply_by_covariance(&mut transformed)?;
                        }
                    }
                } else if self.weight != 1.0 {
                    // The scalar weight plays the role of Cinv.
                    for v in &mut transformed {
                        if weighted {
                            *v *= self.weight;
                        } else {
                            *v /= self.weight;
                        }
                    }
                }
                if flush {
                    st.data = transformed;
                } else {
                    st.cache = mem::replace(&mut st.data, transformed);
                }
            }
            st.weighted = weighted;
        }
        if flush {
            st.cache.clear();
        }
        Ok(())
    }

    /// Forces the stored representation back to raw values, flushing any
    /// cache. Call before mutating the covariance so the stored data
    /// survive the change of correlation structure.
    pub fn unweight_data(&self) -> Result<()> {
        self.set_weighted(false, true)
    }

    /// Returns the value at the given global index in the requested
    /// representation, converting and caching the alternate form on demand.
    pub fn get_data(&self, index: usize, weighted: bool) -> Result<f64> {
        let offset = self.offset_for_index(index)?;
        self.set_weighted(weighted, false)?;
        Ok(self.state.borrow().data[offset])
    }

    /// Sets or creates the value at the given global index.
    ///
    /// New bins cannot be added after finalization or once a covariance
    /// fixes the correlation structure. Flushes the representation cache.
    pub fn set_data(&mut self, index: usize, value: f64, weighted: bool) -> Result<()> {
        self.set_weighted(weighted, true)?;
        match self.offset_of(index)? {
            Some(offset) => self.state.get_mut().data[offset] = value,
            None => {
                if self.finalized {
                    return Err(Error::Finalized(format!(
                        "cannot add a bin at index {index} to a finalized dataset"
                    )));
                }
                if self.covariance.is_some() {
                    return Err(Error::HasCovariance(format!(
                        "cannot add a bin at index {index} once a covariance is attached"
                    )));
                }
                let offset = self.index.len();
                self.offset[index] = Some(offset);
                self.index.push(index);
                self.state.get_mut().data.push(value);
            }
        }
        Ok(())
    }

    /// Accumulates `delta` into the existing value at the given index.
    pub fn add_data(&mut self, index: usize, delta: f64, weighted: bool) -> Result<()> {
        let offset = self.offset_for_index(index)?;
        self.set_weighted(weighted, true)?;
        self.state.get_mut().data[offset] += delta;
        Ok(())
    }

    /// True iff the grids are congruent, and (unless `only_binning`) the
    /// ordered occupied-bin lists match exactly, and (unless
    /// `ignore_covariance`) both either have or lack a covariance.
    pub fn is_congruent(&self, other: &Self, only_binning: bool, ignore_covariance: bool) -> bool {
        if !self.grid.is_congruent(&other.grid) {
            return false;
        }
        if !only_binning {
            // Order matters: this is a list comparison, not a set one.
            if self.index != other.index {
                return false;
            }
            if !ignore_covariance && self.has_covariance() != other.has_covariance() {
                return false;
            }
        }
        true
    }

    /// Merges `weight * other` into this dataset.
    ///
    /// Starting from empty only binning congruence is required and the
    /// occupied bins, covariance presence, and scalar weight are taken
    /// over from `other`; otherwise the datasets must be fully congruent.
    /// Data are combined in weighted form and inverse covariances (or
    /// scalar weights) add: the precision-weighted combination rule.
    pub fn add(&mut self, other: &Self, weight: f64) -> Result<()> {
        if weight == 0.0 {
            return Ok(());
        }
        if self.n_bins_with_data() == 0 {
            if !self.is_congruent(other, true, false) {
                return Err(Error::NotCongruent("datasets have different binning".to_string()));
            }
            for k in 0..other.index.len() {
                self.set_data(other.index[k], 0.0, false)?;
            }
            if other.has_covariance() {
                self.covariance =
                    Some(Rc::new(CovarianceMatrix::new(self.n_bins_with_data())?));
            } else {
                // Will accumulate other's weight below.
                self.weight = 0.0;
            }
            // Our zero data vector already doubles as Cinv.data, so flip the
            // tag without transforming anything.
            self.state.get_mut().weighted = true;
        } else {
            if !self.is_congruent(other, false, false) {
                return Err(Error::NotCongruent("datasets are not congruent".to_string()));
            }
            if self.has_covariance() && !self.is_covariance_modifiable() {
                return Err(Error::NotModifiable(
                    "cannot merge into a dataset with a shared covariance".to_string(),
                ));
            }
        }
        self.set_weighted(true, true)?;
        other.set_weighted(true, false)?;
        {
            let mut st = self.state.borrow_mut();
            let ost = other.state.borrow();
            for (dst, src) in st.data.iter_mut().zip(ost.data.iter()) {
                *dst += weight * src;
            }
        }
        if let Some(rc) = &mut self.covariance {
            let other_cov = other.covariance.as_ref().ok_or_else(|| {
                Error::NotCongruent("other dataset has no covariance".to_string())
            })?;
            Rc::get_mut(rc)
                .ok_or_else(|| {
                    Error::NotModifiable(
                        "cannot merge into a dataset with a shared covariance".to_string(),
                    )
                })?
                .add_inverse(other_cov, weight)?;
        } else {
            self.weight += other.weight * weight;
        }
        Ok(())
    }

    /// Returns covariance element `(index1, index2)` addressed by global
    /// bin indices.
    pub fn get_covariance(&self, index1: usize, index2: usize) -> Result<f64> {
        let (cov, o1, o2) = self.covariance_offsets(index1, index2)?;
        cov.get_covariance(o1, o2)
    }

    /// Returns inverse-covariance element `(index1, index2)` addressed by
    /// global bin indices.
    pub fn get_inverse_covariance(&self, index1: usize, index2: usize) -> Result<f64> {
        let (cov, o1, o2) = self.covariance_offsets(index1, index2)?;
        cov.get_inverse_covariance(o1, o2)
    }

    fn covariance_offsets(
        &self,
        index1: usize,
        index2: usize,
    ) -> Result<(&CovarianceMatrix, usize, usize)> {
        let cov = self.covariance.as_deref().ok_or_else(|| {
            Error::NoCovariance("no covariance attached to this dataset".to_string())
        })?;
        Ok((cov, self.offset_for_index(index1)?, self.offset_for_index(index2)?))
    }

    /// Sets covariance element `(index1, index2)` addressed by global bin
    /// indices, lazily creating a matrix sized to the current bin count.
    ///
    /// Does not force a representation switch, so the meaning of stored
    /// values continues to depend on the current weighted/unweighted tag.
    pub fn set_covariance(&mut self, index1: usize, index2: usize, value: f64) -> Result<()> {
        let (o1, o2) = (self.offset_for_index(index1)?, self.offset_for_index(index2)?);
        self.writable_covariance()?.set_covariance(o1, o2, value)
    }

    /// Counterpart of [`Self::set_covariance`] for the inverse.
    pub fn set_inverse_covariance(
        &mut self,
        index1: usize,
        index2: usize,
        value: f64,
    ) -> Result<()> {
        let (o1, o2) = (self.offset_for_index(index1)?, self.offset_for_index(index2)?);
        self.writable_covariance()?.set_inverse_covariance(o1, o2, value)
    }

    fn writable_covariance(&mut self) -> Result<&mut CovarianceMatrix> {
        if self.covariance.is_none() {
            if self.finalized {
                return Err(Error::Finalized(
                    "cannot attach a covariance to a finalized dataset".to_string(),
                ));
            }
            self.covariance = Some(Rc::new(CovarianceMatrix::new(self.n_bins_with_data())?));
        }
        match self.covariance.as_mut() {
            Some(rc) => Rc::get_mut(rc).ok_or_else(|| {
                Error::NotModifiable("covariance is shared with another dataset".to_string())
            }),
            None => unreachable!("covariance was attached above"),
        }
    }

    /// Replaces (shares) the covariance with the supplied matrix, which
    /// must be sized to the current count of bins with data.
    pub fn set_covariance_matrix(&mut self, covariance: Rc<CovarianceMatrix>) -> Result<()> {
        if self.finalized {
            return Err(Error::Finalized(
                "cannot replace the covariance of a finalized dataset".to_string(),
            ));
        }
        if covariance.size() != self.n_bins_with_data() {
            return Err(Error::SizeMismatch(format!(
                "covariance size {} does not match {} bins with data",
                covariance.size(),
                self.n_bins_with_data()
            )));
        }
        self.covariance = Some(covariance);
        Ok(())
    }

    /// Attaches `other`'s covariance by reference.
    pub fn share_covariance_matrix(&mut self, other: &Self) -> Result<()> {
        if self.finalized {
            return Err(Error::Finalized(
                "cannot attach a covariance to a finalized dataset".to_string(),
            ));
        }
        let covariance = other.covariance.clone().ok_or_else(|| {
            Error::NoCovariance("other dataset has no covariance to share".to_string())
        })?;
        if !self.is_congruent(other, false, true) {
            return Err(Error::NotCongruent("datasets are not congruent".to_string()));
        }
        self.covariance = Some(covariance);
        Ok(())
    }

    /// Replaces a shared covariance with a private deep copy so this
    /// dataset becomes the sole owner. No-op if none is attached or the
    /// matrix is already exclusively owned.
    pub fn clone_covariance(&mut self) {
        if let Some(rc) = &mut self.covariance {
            if Rc::strong_count(rc) > 1 {
                *rc = Rc::new((**rc).clone());
            }
        }
    }

    /// Converts the data to unweighted form, discards the covariance, and
    /// substitutes the given positive scalar weight.
    pub fn drop_covariance(&mut self, weight: f64) -> Result<()> {
        if self.finalized {
            return Err(Error::Finalized(
                "cannot drop the covariance of a finalized dataset".to_string(),
            ));
        }
        if weight <= 0.0 {
            return Err(Error::InvalidArgument(format!(
                "scalar weight must be positive, got {weight}"
            )));
        }
        self.unweight_data()?;
        self.covariance = None;
        self.weight = weight;
        Ok(())
    }

    /// Re-expresses the covariance under the change of basis given by `D`:
    /// `D` is replaced with `D . Cinv . D` using this dataset's original
    /// covariance `C`, then `D` and the dataset's covariance are swapped,
    /// so the dataset ends up owning the transformed matrix and `D` holds
    /// the original one.
    pub fn transform_covariance(&mut self, d: &mut CovarianceMatrix) -> Result<()> {
        if self.covariance.is_none() {
            return Err(Error::NoCovariance("no covariance to transform".to_string()));
        }
        // The stored values must not depend on the covariance while it
        // changes underneath them.
        self.unweight_data()?;
        if let Some(rc) = &self.covariance {
            d.replace_with_triple_product(rc)?;
        }
        if let Some(rc) = self.covariance.as_mut() {
            match Rc::get_mut(rc) {
                Some(own) => mem::swap(own, d),
                None => {
                    // Leave other owners of the original matrix untouched.
                    let original = (**rc).clone();
                    *rc = Rc::new(mem::replace(d, original));
                }
            }
        }
        Ok(())
    }

    /// Rescales the covariance eigenmodes in place by the supplied
    /// per-mode factors, cloning a shared matrix first.
    pub fn rescale_eigenvalues(&mut self, mode_scales: &[f64]) -> Result<()> {
        if self.covariance.is_none() {
            return Err(Error::NoCovariance("no covariance to transform".to_string()));
        }
        if mode_scales.len() != self.n_bins_with_data() {
            return Err(Error::SizeMismatch(format!(
                "{} mode scales for {} bins with data",
                mode_scales.len(),
                self.n_bins_with_data()
            )));
        }
        self.unweight_data()?;
        self.clone_covariance();
        match self.covariance.as_mut() {
            Some(rc) => Rc::get_mut(rc)
                .ok_or_else(|| {
                    Error::NotModifiable("covariance is shared with another dataset".to_string())
                })?
                .rescale_eigenvalues(mode_scales),
            None => unreachable!("covariance presence was checked above"),
        }
    }

    /// Projects the data vector onto a subspace of covariance eigenmodes:
    /// `nkeep > 0` keeps the lowest `nkeep` modes, `nkeep < 0` the highest
    /// `|nkeep|`. Returns the number of modes dropped.
    pub fn project_onto_modes(&mut self, nkeep: isize) -> Result<usize> {
        if self.finalized {
            return Err(Error::Finalized("cannot project a finalized dataset".to_string()));
        }
        let size = self.n_bins_with_data();
        let modes = match &self.covariance {
            Some(cov) => cov.get_eigen_modes()?.1,
            None => {
                return Err(Error::NoCovariance("no covariance to define modes".to_string()))
            }
        };
        if nkeep == 0 || nkeep.unsigned_abs() >= size {
            return Err(Error::InvalidArgument(format!(
                "cannot keep {nkeep} of {size} modes"
            )));
        }
        let (first, last) = if nkeep > 0 {
            (0, nkeep as usize)
        } else {
            (size - nkeep.unsigned_abs(), size)
        };
        self.set_weighted(false, true)?;
        let data = &mut self.state.get_mut().data;
        let mut projected = vec![0.0; size];
        for k in first..last {
            let mode = &modes[k * size..(k + 1) * size];
            let dot: f64 = mode.iter().zip(data.iter()).map(|(m, d)| m * d).sum();
            for (p, m) in projected.iter_mut().zip(mode) {
                *p += dot * m;
            }
        }
        *data = projected;
        Ok(size - nkeep.unsigned_abs())
    }

    /// Keeps only the bins whose global indices appear in `keep`,
    /// compacting the bookkeeping in ascending original-offset order and
    /// pruning the covariance in place (cloning it first if shared).
    /// A `keep` set covering every occupied bin is a no-op.
    pub fn prune(&mut self, keep: &BTreeSet<usize>) -> Result<()> {
        if self.finalized {
            return Err(Error::Finalized("cannot prune a finalized dataset".to_string()));
        }
        let mut offsets = BTreeSet::new();
        for &index in keep {
            if let Some(offset) = self.offset_of(index)? {
                offsets.insert(offset);
            }
        }
        if offsets.len() == self.n_bins_with_data() {
            return Ok(());
        }
        self.set_weighted(false, true)?;
        self.offset = vec![None; self.grid.n_bins_total()];
        let st = self.state.get_mut();
        for (new_offset, &old_offset) in offsets.iter().enumerate() {
            // old_offset >= new_offset, so nothing still needed is clobbered.
            let index = self.index[old_offset];
            self.offset[index] = Some(new_offset);
            self.index[new_offset] = index;
            st.data[new_offset] = st.data[old_offset];
        }
        self.index.truncate(offsets.len());
        st.data.truncate(offsets.len());
        if self.covariance.is_some() {
            self.clone_covariance();
            match self.covariance.as_mut() {
                Some(rc) => Rc::get_mut(rc)
                    .ok_or_else(|| {
                        Error::NotModifiable(
                            "covariance is shared with another dataset".to_string(),
                        )
                    })?
                    .prune(&offsets)?,
                None => unreachable!("covariance presence was checked above"),
            }
        }
        Ok(())
    }

    /// Chi-square of the prediction against this dataset:
    /// `(pred - data) . Cinv . (pred - data)`, or the scalar-weighted sum
    /// of squared residuals when no covariance is attached.
    pub fn chi_square(&self, pred: &[f64]) -> Result<f64> {
        if pred.len() != self.n_bins_with_data() {
            return Err(Error::SizeMismatch(format!(
                "prediction length {} does not match {} bins with data",
                pred.len(),
                self.n_bins_with_data()
            )));
        }
        self.set_weighted(false, false)?;
        let (residuals, unweighted) = {
            let st = self.state.borrow();
            let residuals: Vec<f64> =
                pred.iter().zip(st.data.iter()).map(|(p, d)| p - d).collect();
            let unweighted = residuals.iter().map(|r| r * r).sum::<f64>();
            (residuals, unweighted)
        };
        match &self.covariance {
            Some(cov) => cov.chi_square(&residuals),
            None => Ok(self.weight * unweighted),
        }
    }

    /// Per-bin effective weights that reproduce the correlated chi-square
    /// as a weighted sum of squared residuals: for `delta = data - pred`,
    /// bin `j` gets `sum_k Cinv(j,k) delta_k / delta_j`, or `Cinv(j,j)`
    /// when `delta_j` is exactly zero (avoiding the 0/0 ratio), or the
    /// scalar weight when no covariance is attached.
    pub fn get_decorrelated_weights(&self, pred: &[f64]) -> Result<Vec<f64>> {
        let nbins = self.n_bins_with_data();
        if pred.len() != nbins {
            return Err(Error::SizeMismatch(format!(
                "prediction length {} does not match {nbins} bins with data",
                pred.len()
            )));
        }
        self.set_weighted(false, false)?;
        let delta: Vec<f64> = {
            let st = self.state.borrow();
            st.data.iter().zip(pred.iter()).map(|(d, p)| d - p).collect()
        };
        let mut dweights = Vec::with_capacity(nbins);
        for j in 0..nbins {
            let dweight = match &self.covariance {
                Some(cov) => {
                    if delta[j] == 0.0 {
                        cov.get_inverse_covariance(j, j)?
                    } else {
                        let mut sum = 0.0;
                        for (k, &dk) in delta.iter().enumerate() {
                            sum += cov.get_inverse_covariance(j, k)? * dk;
                        }
                        sum / delta[j]
                    }
                }
                None => self.weight,
            };
            dweights.push(dweight);
        }
        Ok(dweights)
    }

    /// Draws a new dataset whose values are this dataset's unweighted
    /// values plus Gaussian noise sampled from the attached covariance
    /// (noise-free copy when none is attached); the covariance is shared
    /// with the result.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Self> {
        let mut sampled = self.clone_binning();
        sampled.offset = self.offset.clone();
        sampled.index = self.index.clone();
        let mut data = match &self.covariance {
            Some(cov) => cov.sample(rng)?.0,
            None => vec![0.0; self.n_bins_with_data()],
        };
        self.set_weighted(false, false)?;
        {
            let st = self.state.borrow();
            for (noise, value) in data.iter_mut().zip(st.data.iter()) {
                *noise += value;
            }
        }
        sampled.state.get_mut().data = data;
        if let Some(cov) = &self.covariance {
            sampled.set_covariance_matrix(Rc::clone(cov))?;
        }
        Ok(sampled)
    }

    /// A single effective weight summarizing the covariance's overall
    /// scale, `exp(-log det C / nbins)`, or the scalar weight when no
    /// covariance is attached.
    pub fn get_scalar_weight(&self) -> Result<f64> {
        match &self.covariance {
            Some(cov) => Ok((-cov.log_determinant()? / self.n_bins_with_data() as f64).exp()),
            None => Ok(self.weight),
        }
    }

    /// Forces the requested representation, drops the cache of the
    /// alternate one, and compresses the covariance if any. Returns
    /// whether covariance compression occurred.
    pub fn compress(&self, weighted: bool) -> Result<bool> {
        self.set_weighted(weighted, true)?;
        // Release the cache capacity too, not just its length.
        self.state.borrow_mut().cache = Vec::new();
        Ok(self.covariance.as_ref().map_or(false, |cov| cov.compress()))
    }

    /// True iff the attached covariance is currently compressed.
    pub fn is_compressed(&self) -> bool {
        self.covariance.as_ref().map_or(false, |cov| cov.is_compressed())
    }

    /// Bytes of storage allocated by this object.
    pub fn get_memory_usage(&self, include_covariance: bool) -> usize {
        let st = self.state.borrow();
        let mut total = mem::size_of::<Self>()
            + self.offset.capacity() * mem::size_of::<Option<usize>>()
            + self.index.capacity() * mem::size_of::<usize>()
            + (st.data.capacity() + st.cache.capacity()) * mem::size_of::<f64>();
        if include_covariance {
            if let Some(cov) = &self.covariance {
                total += cov.get_memory_usage();
            }
        }
        total
    }

    /// Compact state string: memory usage, the representation tag
    /// (`CinvD` when weighted, `D` otherwise) with `+`/`-` marking whether
    /// the complement is cached, then the shared-ownership count and state
    /// of the covariance.
    pub fn get_memory_state(&self) -> String {
        let st = self.state.borrow();
        let mut out = format!(
            "{:6} {}{} ",
            self.get_memory_usage(false),
            if st.weighted { "CinvD" } else { "    D" },
            if st.cache.is_empty() { '-' } else { '+' }
        );
        drop(st);
        match &self.covariance {
            Some(cov) => {
                out.push_str(&format!("refcount {:2} ", Rc::strong_count(cov)));
                out.push_str(&cov.get_memory_state());
            }
            None => out.push_str("no covariance"),
        }
        out
    }

    /// Prints one aligned `[index] value` line per occupied bin.
    pub fn print_to_stream<W: Write>(&self, out: &mut W) -> Result<()> {
        for &index in &self.index {
            writeln!(out, "[{index:4}] {:+10.3e}", self.get_data(index, false)?)?;
        }
        Ok(())
    }

    /// Writes one `<index> <value>` line per occupied bin in insertion
    /// order, at full round-trip precision.
    pub fn save_data<W: Write>(&self, out: &mut W, weighted: bool) -> Result<()> {
        for &index in &self.index {
            writeln!(out, "{index} {}", self.get_data(index, weighted)?)?;
        }
        Ok(())
    }

    /// Writes `<index1> <index2> <value>` lines for all diagonal
    /// inverse-covariance entries and all nonzero off-diagonals with
    /// `index2 > index1` (in occupied-bin order), scaled by `scale`.
    pub fn save_inverse_covariance<W: Write>(&self, out: &mut W, scale: f64) -> Result<()> {
        let cov = self.covariance.as_deref().ok_or_else(|| {
            Error::NoCovariance("no covariance attached to this dataset".to_string())
        })?;
        if !cov.is_positive_definite() {
            return Err(Error::NotPositiveDefinite(
                "cannot save the inverse of a non-positive-definite covariance".to_string(),
            ));
        }
        for (a, &index1) in self.index.iter().enumerate() {
            let value = scale * self.get_inverse_covariance(index1, index1)?;
            writeln!(out, "{index1} {index1} {value}")?;
            for &index2 in &self.index[a + 1..] {
                let value = scale * self.get_inverse_covariance(index1, index2)?;
                if value != 0.0 {
                    writeln!(out, "{index1} {index2} {value}")?;
                }
            }
        }
        Ok(())
    }
}
