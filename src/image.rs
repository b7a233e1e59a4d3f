//! In-memory science frame: a 2-D pixel grid plus acquisition metadata.
//!
//! Images follow the crate-wide `ndarray` convention of `[row, col]`
//! indexing with `(height, width)` dimensions. A `Frame` is immutable
//! once constructed; every pipeline stage produces new frames.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Days between the Julian date epoch and the Unix epoch.
const UNIX_EPOCH_JD: f64 = 2_440_587.5;

/// Offset between Modified Julian Date and Julian Date.
pub const MJD_OFFSET: f64 = 2_400_000.5;

/// A scalar metadata value carried through from acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetaValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Logical(bool),
}

/// Acquisition metadata attached 1:1 to a frame.
///
/// The fields the pipeline actually reads are typed; anything else the
/// caller wants preserved rides along in `extra` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMeta {
    /// Exposure time in seconds.
    pub exposure_s: f64,
    /// Filter identifier (e.g. "B", "V", "r'").
    pub filter: String,
    /// Observation timestamp as a Julian date.
    pub jd: f64,
    /// Airmass at mid-exposure, if recorded.
    pub airmass: Option<f64>,
    /// Target name, if recorded.
    pub object: Option<String>,
    /// Caller-supplied passthrough keys, preserved on save.
    pub extra: BTreeMap<String, MetaValue>,
}

impl FrameMeta {
    /// Minimal metadata with the required fields only.
    pub fn new(exposure_s: f64, filter: impl Into<String>, jd: f64) -> Self {
        FrameMeta {
            exposure_s,
            filter: filter.into(),
            jd,
            airmass: None,
            object: None,
            extra: BTreeMap::new(),
        }
    }
}

/// Convert a UTC timestamp to a Julian date.
pub fn datetime_to_jd(t: DateTime<Utc>) -> f64 {
    t.timestamp() as f64 / 86_400.0 + t.timestamp_subsec_nanos() as f64 / 86_400.0e9 + UNIX_EPOCH_JD
}

/// A 2-D science image with its metadata record.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    data: Array2<f64>,
    meta: FrameMeta,
}

impl Frame {
    /// Build a frame, rejecting degenerate pixel grids.
    pub fn new(data: Array2<f64>, meta: FrameMeta) -> Result<Self> {
        let (rows, cols) = data.dim();
        if rows == 0 || cols == 0 {
            return Err(Error::InsufficientData(format!(
                "frame must be non-empty, got {rows}x{cols}"
            )));
        }
        Ok(Frame { data, meta })
    }

    /// Pixel data, `[row, col]` indexed.
    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    /// Acquisition metadata.
    pub fn meta(&self) -> &FrameMeta {
        &self.meta
    }

    /// `(rows, cols)` dimensions.
    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Split the frame into its parts.
    pub fn into_parts(self) -> (Array2<f64>, FrameMeta) {
        (self.data, self.meta)
    }
}
