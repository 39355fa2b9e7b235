//! Grid capability consumed by the binned-data container.
//!
//! A grid is an immutable value-to-index lookup table over a bin space.
//! The container only ever needs the total bin count, index validation,
//! and a congruence test, so that is the whole trait surface.

use crate::{Error, Result};

/// Capability interface for a multi-dimensional bin grid.
pub trait Grid {
    /// Total number of bins in the grid.
    fn n_bins_total(&self) -> usize;

    /// Validates a global bin index against this grid's bin space.
    fn check_index(&self, index: usize) -> Result<()>;

    /// True iff both grids have identical axis definitions.
    fn is_congruent(&self, other: &Self) -> bool;
}

/// Uniform 1D binning of a finite interval `[min, max]` into `n` bins.
#[derive(Debug, Clone, PartialEq)]
pub struct UniformGrid {
    min: f64,
    max: f64,
    bin_width: f64,
    n_bins: usize,
}

impl UniformGrid {
    /// Creates a uniform binning of `[min, max]` with `n_bins` bins.
    pub fn new(min: f64, max: f64, n_bins: usize) -> Result<Self> {
        if max <= min {
            return Err(Error::InvalidArgument(format!(
                "uniform grid needs max > min, got [{min}, {max}]"
            )));
        }
        if n_bins == 0 {
            return Err(Error::InvalidArgument("uniform grid needs at least one bin".to_string()));
        }
        Ok(Self { min, max, bin_width: (max - min) / n_bins as f64, n_bins })
    }

    /// Returns the bin index containing `value`.
    ///
    /// The upper interval edge maps to the last bin.
    pub fn bin_index(&self, value: f64) -> Result<usize> {
        if value < self.min || value > self.max {
            return Err(Error::OutOfRange(format!(
                "value {value} outside the interval [{}, {}]",
                self.min, self.max
            )));
        }
        let index = ((value - self.min) / self.bin_width) as usize;
        Ok(index.min(self.n_bins - 1))
    }

    /// Lower edge of the specified bin.
    pub fn bin_low_edge(&self, index: usize) -> Result<f64> {
        self.check_index(index)?;
        Ok(self.min + index as f64 * self.bin_width)
    }

    /// Upper edge of the specified bin.
    pub fn bin_high_edge(&self, index: usize) -> Result<f64> {
        Ok(self.bin_low_edge(index)? + self.bin_width)
    }

    /// Full width of the specified bin.
    pub fn bin_width(&self, index: usize) -> Result<f64> {
        self.check_index(index)?;
        Ok(self.bin_width)
    }

    /// Midpoint of the specified bin.
    pub fn bin_center(&self, index: usize) -> Result<f64> {
        Ok(self.bin_low_edge(index)? + 0.5 * self.bin_width)
    }
}

impl Grid for UniformGrid {
    fn n_bins_total(&self) -> usize {
        self.n_bins
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.n_bins {
            return Err(Error::OutOfRange(format!(
                "bin index {index} outside a grid with {} bins",
                self.n_bins
            )));
        }
        Ok(())
    }

    fn is_congruent(&self, other: &Self) -> bool {
        self == other
    }
}
