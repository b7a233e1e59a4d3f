//! Error taxonomy for the reduction pipeline.
//!
//! Contract violations (bad paths, mismatched shapes, impossible
//! geometry) surface as errors; degraded-but-usable results carry
//! quality flags on the result types instead and never abort a batch.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during reduction and photometry.
#[derive(Error, Debug)]
pub enum Error {
    /// The requested file does not exist.
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    /// The file exists but is not a usable 2-D image with the required
    /// metadata.
    #[error("unsupported or corrupt image file {path}: {reason}")]
    Format {
        path: PathBuf,
        reason: String,
        #[source]
        source: Option<fitsio::compat::errors::Error>,
    },

    /// Input images disagree in dimensions.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    /// Aperture/annulus radii violate the measurement contract.
    #[error("invalid aperture geometry: {0}")]
    InvalidGeometry(String),

    /// The flat field cannot normalize anything (non-positive mean).
    #[error("degenerate flat field: {0}")]
    DegenerateFlat(String),

    /// A fit or combination has too few inputs to be determined.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// A filesystem write/read failed outside the FITS layer.
    #[error("I/O error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Format {
            path: path.into(),
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn fits(path: impl Into<PathBuf>, source: fitsio::compat::errors::Error) -> Self {
        Error::Format {
            path: path.into(),
            reason: "FITS I/O error".to_string(),
            source: Some(source),
        }
    }
}
