//! Error types for the reconstruction engine
//!
//! Structural preconditions and file exchange failures are fatal and
//! surface through this enum; per-slice numerical or geometric trouble is
//! handled locally by the iterative stages and never aborts a run.

use thiserror::Error;

/// Main error type for reconstruction operations.
#[derive(Error, Debug)]
pub enum ReconError {
    /// A required setup step was skipped or ran in the wrong order.
    #[error("Precondition violation: {0}")]
    Precondition(String),

    /// Image dimensions or grids do not agree.
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// The mask has no overlap with the reconstruction ROI.
    #[error("Region of interest is empty: {0}")]
    EmptyRoi(String),

    /// File I/O or NIfTI parsing failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// A remote registration worker did not produce an expected file.
    #[error("Missing exchange file: {0}")]
    MissingExchangeFile(String),
}

/// Result type for reconstruction operations.
pub type Result<T> = std::result::Result<T, ReconError>;

impl ReconError {
    /// Create a precondition error.
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Create a dimension mismatch error.
    pub fn dimension_mismatch(msg: impl Into<String>) -> Self {
        Self::DimensionMismatch(msg.into())
    }

    /// Create an I/O error.
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ReconError::precondition("set the mask after the template");
        assert_eq!(
            err.to_string(),
            "Precondition violation: set the mask after the template"
        );
    }

    #[test]
    fn test_error_kind() {
        let err = ReconError::dimension_mismatch("mask 10x10x10 vs volume 8x8x8");
        assert!(matches!(err, ReconError::DimensionMismatch(_)));
    }
}
