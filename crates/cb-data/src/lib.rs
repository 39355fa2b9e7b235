//! # cb-data
//!
//! The two tightly coupled engines at the heart of covbin:
//!
//! - [`CovarianceMatrix`]: a fixed-size symmetric positive-definite matrix
//!   with lazily synchronized covariance / inverse-covariance / Cholesky
//!   representations and a lossless diagonal-compression mode.
//! - [`BinnedData`]: a sparse-over-dense data store keyed by grid bin index,
//!   with a lazily toggled weighted (inverse-covariance-applied) vs
//!   unweighted representation and copy-on-write sharing of a covariance
//!   matrix across datasets.
//!
//! Everything is synchronous and single-threaded; randomness is injected
//! explicitly into the sampling calls (`rand::Rng`).

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Sparse binned-data container with shared covariance.
pub mod binned;
/// Symmetric positive-definite covariance matrix engine.
pub mod covariance;
/// BLAS-style packed symmetric storage helpers.
pub mod packed;

pub use binned::BinnedData;
pub use covariance::CovarianceMatrix;
