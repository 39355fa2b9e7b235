//! # cb-core
//!
//! Shared building blocks for the covbin workspace:
//! - the typed error enum and `Result` alias used by every engine
//! - the grid capability trait consumed by the binned-data container,
//!   together with a reference uniform-grid implementation
//!
//! The numerical engines themselves live in `cb-data`; this crate has no
//! linear-algebra dependencies.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error types and the crate-wide `Result` alias.
pub mod error;
/// Grid capability trait plus a uniform reference implementation.
pub mod grid;

pub use error::{Error, Result};
pub use grid::{Grid, UniformGrid};
