//! Application of master calibration frames to science images.

use log::warn;
use rayon::prelude::*;

use crate::combine::MasterFrame;
use crate::error::{Error, Result};
use crate::image::Frame;

/// A bias-subtracted, flat-fielded science frame.
///
/// Pixels where the flat field was unusable are set to NaN and counted;
/// downstream stages ignore NaN pixels, so a handful of bad flat pixels
/// never aborts a science frame.
#[derive(Debug, Clone)]
pub struct CalibratedFrame {
    /// The calibrated image with the original metadata.
    pub frame: Frame,
    /// Number of pixels masked because of a degenerate flat value.
    pub masked_pixels: usize,
}

/// Bias-subtract and flat-field one science frame.
///
/// The flat is normalized by its own mean to a dimensionless field
/// before division. Flat pixels that are non-positive after
/// normalization are masked in the output rather than failing the
/// frame; only a flat that cannot normalize at all (non-positive mean)
/// is rejected outright.
pub fn calibrate(science: &Frame, bias: &MasterFrame, flat: &MasterFrame) -> Result<CalibratedFrame> {
    let shape = science.dim();
    for actual in [bias.dim(), flat.dim()] {
        if actual != shape {
            return Err(Error::ShapeMismatch {
                expected: shape,
                actual,
            });
        }
    }

    let flat_mean = flat
        .data()
        .mean()
        .filter(|m| *m > 0.0 && m.is_finite())
        .ok_or_else(|| {
            Error::DegenerateFlat("master flat mean is non-positive or non-finite".to_string())
        })?;

    let mut data = science.data() - bias.data();
    let mut masked_pixels = 0usize;
    for (out, &flat_px) in data.iter_mut().zip(flat.data().iter()) {
        let norm = flat_px / flat_mean;
        if norm > 0.0 {
            *out /= norm;
        } else {
            *out = f64::NAN;
            masked_pixels += 1;
        }
    }

    if masked_pixels > 0 {
        warn!(
            "masked {} degenerate flat pixel(s) while calibrating frame at JD {}",
            masked_pixels,
            science.meta().jd
        );
    }

    Ok(CalibratedFrame {
        frame: Frame::new(data, science.meta().clone())?,
        masked_pixels,
    })
}

/// Calibrate a batch of science frames over a worker pool.
///
/// Frames are independent, so each result stands alone: one bad frame
/// surfaces as an `Err` in its slot without affecting the others.
/// Output order matches input order.
pub fn calibrate_batch(
    frames: &[Frame],
    bias: &MasterFrame,
    flat: &MasterFrame,
) -> Vec<Result<CalibratedFrame>> {
    frames
        .par_iter()
        .map(|frame| calibrate(frame, bias, flat))
        .collect()
}
