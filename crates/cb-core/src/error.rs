//! Error types for covbin.
//!
//! Every failure in the core surfaces immediately to the caller as one of
//! these typed variants; the engines perform no internal suppression,
//! fallback, or logging.

use thiserror::Error;

/// covbin error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed construction parameter: non-positive size, bad packed-vector
    /// length, non-positive diagonal, non-positive scale or weight.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Index outside `[0, size)` or outside the grid's bin space.
    #[error("index out of range: {0}")]
    OutOfRange(String),

    /// Query or mutation addressed at a bin with no stored value.
    #[error("bin is empty: {0}")]
    EmptyBin(String),

    /// Vector or array argument length does not match the expected dimension.
    #[error("size mismatch: {0}")]
    SizeMismatch(String),

    /// Operation requires a covariance matrix that is not attached.
    #[error("no covariance attached: {0}")]
    NoCovariance(String),

    /// A required Cholesky decomposition or determinant failed numerically.
    #[error("matrix is not positive definite: {0}")]
    NotPositiveDefinite(String),

    /// Attempt to add a bin, attach or replace a covariance, or prune, after
    /// finalization.
    #[error("object is finalized: {0}")]
    Finalized(String),

    /// Attempt to mutate a covariance matrix that is shared and not
    /// exclusively owned.
    #[error("covariance is shared: {0}")]
    NotModifiable(String),

    /// Merge or share operation between datasets whose binning, occupied-bin
    /// list, or covariance presence differ.
    #[error("datasets are not congruent: {0}")]
    NotCongruent(String),

    /// Attempt to add a new bin once a covariance fixes the correlation
    /// structure.
    #[error("covariance already attached: {0}")]
    HasCovariance(String),

    /// I/O error from the plain-text persistence surface.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::EmptyBin("no data at index 7".to_string());
        assert_eq!(err.to_string(), "bin is empty: no data at index 7");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "closed");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
