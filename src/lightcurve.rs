//! Differential light-curve construction from a time-ordered frame
//! sequence.
//!
//! Built as an explicit two-phase pipeline: an independently testable
//! per-frame measurement step (parallel over frames), followed by an
//! assemble-and-sort step that normalizes the series and records gaps.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use log::warn;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::detect::refine_centroid;
use crate::error::{Error, Result};
use crate::image::Frame;
use crate::photometry::{measure, Aperture, Quality};
use crate::stats;

/// Configuration for light-curve extraction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LightCurveConfig {
    /// Aperture/annulus geometry used for every star.
    pub aperture: Aperture,
    /// Half-width of the re-centroiding window in pixels. Positions
    /// drift frame to frame; each star is re-centroided near its
    /// expected position instead of using a fixed pixel coordinate.
    pub recentroid_radius: usize,
}

impl Default for LightCurveConfig {
    fn default() -> Self {
        LightCurveConfig {
            aperture: Aperture::default(),
            recentroid_radius: 10,
        }
    }
}

/// One sample of the differential light curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LightCurvePoint {
    /// Observation time (Julian date, from frame metadata).
    pub jd: f64,
    /// Target flux over the summed comparison flux, normalized so the
    /// series median is 1.0.
    pub relative_flux: f64,
    /// Propagated 1-sigma uncertainty on the relative flux.
    pub uncertainty: f64,
    /// Combined quality of the contributing measurements.
    pub quality: Quality,
}

/// A frame that produced no light-curve point, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameGap {
    /// Index of the frame in the input sequence.
    pub index: usize,
    /// Observation time of the skipped frame.
    pub jd: f64,
    /// Why the frame was skipped.
    pub reason: String,
}

/// Result of measuring a single frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameMeasurement {
    /// A usable differential measurement.
    Point(LightCurvePoint),
    /// The frame could not contribute; the reason is recorded.
    Gap { jd: f64, reason: String },
}

/// The assembled light curve plus every recorded gap.
#[derive(Debug, Clone, PartialEq)]
pub struct LightCurve {
    /// Points sorted by time ascending; equal timestamps keep their
    /// input order.
    pub points: Vec<LightCurvePoint>,
    /// Frames that were skipped, in input order.
    pub gaps: Vec<FrameGap>,
}

impl LightCurve {
    /// Write the tabular artifact consumed by plotting collaborators.
    ///
    /// Column names and order are part of the downstream contract:
    /// `time,relative_flux,uncertainty,quality`.
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut file = File::create(path).map_err(|e| Error::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        writeln!(file, "time,relative_flux,uncertainty,quality").map_err(|e| Error::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        for point in &self.points {
            writeln!(
                file,
                "{:.8},{:.8},{:.8},{}",
                point.jd, point.relative_flux, point.uncertainty, point.quality
            )
            .map_err(|e| Error::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        }
        Ok(())
    }
}

/// Phase 1: measure one frame into a point or a recorded gap.
///
/// The target and every comparison star are re-centroided near their
/// expected positions. A frame is skipped (gap, not failure) when the
/// target or any comparison star is undetectable, or a comparison star
/// measures below the SNR floor — a bad comparison would silently bias
/// the ratio.
pub fn measure_frame(
    frame: &Frame,
    target: (f64, f64),
    comparisons: &[(f64, f64)],
    config: &LightCurveConfig,
) -> FrameMeasurement {
    let jd = frame.meta().jd;
    let image = frame.data().view();
    let gap = |reason: String| FrameMeasurement::Gap { jd, reason };

    let Some((t_row, t_col)) =
        refine_centroid(&image, target.0, target.1, config.recentroid_radius)
    else {
        return gap("target star undetectable".to_string());
    };
    let target_phot = match measure(&image, t_row, t_col, &config.aperture) {
        Ok(p) => p,
        Err(e) => return gap(format!("target measurement failed: {e}")),
    };

    let mut comparison_flux = 0.0;
    let mut comparison_var = 0.0;
    let mut edge = target_phot.quality.edge;
    for (k, &(row, col)) in comparisons.iter().enumerate() {
        let Some((c_row, c_col)) = refine_centroid(&image, row, col, config.recentroid_radius)
        else {
            return gap(format!("comparison star {k} undetectable"));
        };
        let phot = match measure(&image, c_row, c_col, &config.aperture) {
            Ok(p) => p,
            Err(e) => return gap(format!("comparison star {k} measurement failed: {e}")),
        };
        if phot.quality.low_snr {
            return gap(format!("comparison star {k} below SNR floor"));
        }
        edge |= phot.quality.edge;
        // Equal-weighted sum of comparison fluxes.
        comparison_flux += phot.flux;
        comparison_var += phot.flux_err.powi(2);
    }

    if comparison_flux <= 0.0 {
        return gap("non-positive comparison flux".to_string());
    }

    let relative_flux = target_phot.flux / comparison_flux;
    // Ratio error propagation in quadrature.
    let uncertainty = relative_flux.abs()
        * ((target_phot.flux_err / target_phot.flux).powi(2)
            + (comparison_var.sqrt() / comparison_flux).powi(2))
        .sqrt();

    FrameMeasurement::Point(LightCurvePoint {
        jd,
        relative_flux,
        uncertainty: if uncertainty.is_finite() {
            uncertainty
        } else {
            f64::NAN
        },
        quality: Quality {
            low_snr: target_phot.quality.low_snr,
            edge,
        },
    })
}

/// Phase 2: build the differential light curve for a frame sequence.
///
/// Frames are measured independently (parallel map), assembled in time
/// order (stable sort, so equal timestamps retain input order) and
/// normalized so the median relative flux is 1.0. Skipped frames are
/// returned as gaps; an entirely gap-filled sequence is an error.
pub fn build(
    frames: &[Frame],
    target: (f64, f64),
    comparisons: &[(f64, f64)],
    config: &LightCurveConfig,
) -> Result<LightCurve> {
    config.aperture.validate()?;
    if frames.is_empty() {
        return Err(Error::InsufficientData("no frames provided".to_string()));
    }

    let measurements: Vec<FrameMeasurement> = frames
        .par_iter()
        .map(|frame| measure_frame(frame, target, comparisons, config))
        .collect();

    let mut points = Vec::new();
    let mut gaps = Vec::new();
    for (index, measurement) in measurements.into_iter().enumerate() {
        match measurement {
            FrameMeasurement::Point(point) => points.push(point),
            FrameMeasurement::Gap { jd, reason } => {
                warn!("frame {index} (JD {jd}) skipped: {reason}");
                gaps.push(FrameGap { index, jd, reason });
            }
        }
    }

    if points.is_empty() {
        return Err(Error::InsufficientData(format!(
            "all {} frames were skipped",
            frames.len()
        )));
    }

    // Sorting by timestamp is an explicit step; insertion order is the
    // frame order, and the stable sort keeps it for duplicates.
    points.sort_by(|a, b| a.jd.total_cmp(&b.jd));

    let fluxes: Vec<f64> = points.iter().map(|p| p.relative_flux).collect();
    match stats::median(&fluxes).filter(|m| *m > 0.0) {
        Some(med) => {
            for point in &mut points {
                point.relative_flux /= med;
                point.uncertainty /= med;
            }
        }
        None => warn!("light curve median is non-positive; skipping normalization"),
    }

    Ok(LightCurve { points, gaps })
}
