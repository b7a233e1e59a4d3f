//! Circular-aperture photometry with local annulus background.
//!
//! Aperture sums use fractional pixel weights so the measured flux
//! varies continuously as the source position moves across pixel
//! boundaries. The local background is the sigma-clipped median of an
//! annulus around the aperture.

use std::fmt;

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::stats;

/// Supersampling grid per axis for pixels crossing the aperture edge.
const EDGE_SUBSAMPLES: usize = 32;
/// Sigma for the annulus background clip.
const ANNULUS_CLIP_SIGMA: f64 = 3.0;
/// Iteration cap for the annulus background clip.
const ANNULUS_CLIP_ITERS: usize = 5;

/// Aperture and background-annulus geometry in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aperture {
    /// Photometry aperture radius.
    pub radius: f64,
    /// Inner radius of the background annulus.
    pub annulus_inner: f64,
    /// Outer radius of the background annulus.
    pub annulus_outer: f64,
}

impl Aperture {
    /// Build a validated aperture geometry.
    pub fn new(radius: f64, annulus_inner: f64, annulus_outer: f64) -> Result<Self> {
        let aperture = Aperture {
            radius,
            annulus_inner,
            annulus_outer,
        };
        aperture.validate()?;
        Ok(aperture)
    }

    /// Check the geometry contract.
    pub fn validate(&self) -> Result<()> {
        if !(self.radius > 0.0 && self.annulus_inner > 0.0 && self.annulus_outer > 0.0) {
            return Err(Error::InvalidGeometry(format!(
                "radii must be positive: r={}, inner={}, outer={}",
                self.radius, self.annulus_inner, self.annulus_outer
            )));
        }
        if self.annulus_inner < self.radius {
            return Err(Error::InvalidGeometry(format!(
                "annulus inner radius {} is inside the aperture radius {}",
                self.annulus_inner, self.radius
            )));
        }
        if self.annulus_outer <= self.annulus_inner {
            return Err(Error::InvalidGeometry(format!(
                "annulus outer radius {} must exceed inner radius {}",
                self.annulus_outer, self.annulus_inner
            )));
        }
        Ok(())
    }
}

impl Default for Aperture {
    fn default() -> Self {
        Aperture {
            radius: 10.0,
            annulus_inner: 15.0,
            annulus_outer: 20.0,
        }
    }
}

/// Quality flags recorded on a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Quality {
    /// Flux is below 3x its uncertainty.
    pub low_snr: bool,
    /// Aperture or annulus extended beyond the image bounds.
    pub edge: bool,
}

impl Quality {
    pub fn is_good(&self) -> bool {
        !self.low_snr && !self.edge
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.low_snr, self.edge) {
            (false, false) => write!(f, "OK"),
            (true, false) => write!(f, "LOW_SNR"),
            (false, true) => write!(f, "EDGE"),
            (true, true) => write!(f, "LOW_SNR+EDGE"),
        }
    }
}

/// Flux measurement for one source in one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotometryResult {
    /// Background-subtracted aperture flux.
    pub flux: f64,
    /// 1-sigma flux uncertainty.
    pub flux_err: f64,
    /// Background level per pixel from the annulus.
    pub background: f64,
    /// Background standard deviation per pixel.
    pub background_std: f64,
    /// Effective aperture area actually summed (in-bounds, unmasked).
    pub aperture_area: f64,
    /// Measurement quality flags.
    pub quality: Quality,
}

impl PhotometryResult {
    /// Instrumental magnitude, `None` for non-positive flux.
    pub fn instrumental_mag(&self) -> Option<f64> {
        (self.flux > 0.0).then(|| -2.5 * self.flux.log10())
    }
}

/// Fraction of a unit pixel centered at offset `(dr, dc)` from the
/// aperture center that falls inside radius `r`.
///
/// Pixels entirely inside or outside are classified by their corner
/// distances; boundary pixels are supersampled on a fixed grid.
fn pixel_fraction(dr: f64, dc: f64, r: f64) -> f64 {
    // Nearest and farthest points of the pixel square from the center.
    let near_r = (dr.abs() - 0.5).max(0.0);
    let near_c = (dc.abs() - 0.5).max(0.0);
    let far_r = dr.abs() + 0.5;
    let far_c = dc.abs() + 0.5;

    let r2 = r * r;
    if far_r * far_r + far_c * far_c <= r2 {
        return 1.0;
    }
    if near_r * near_r + near_c * near_c >= r2 {
        return 0.0;
    }

    let step = 1.0 / EDGE_SUBSAMPLES as f64;
    let mut inside = 0usize;
    for i in 0..EDGE_SUBSAMPLES {
        let sr = dr - 0.5 + (i as f64 + 0.5) * step;
        for j in 0..EDGE_SUBSAMPLES {
            let sc = dc - 0.5 + (j as f64 + 0.5) * step;
            if sr * sr + sc * sc <= r2 {
                inside += 1;
            }
        }
    }
    inside as f64 / (EDGE_SUBSAMPLES * EDGE_SUBSAMPLES) as f64
}

/// Measure background-subtracted flux for a source position.
///
/// The measurement proceeds even when the aperture or annulus leaves
/// the image: only in-bounds pixels contribute, with the background
/// scaled by the in-bounds aperture area, and the result carries the
/// `EDGE` flag. Masked (NaN) pixels are excluded from sums and areas.
pub fn measure(
    image: &ArrayView2<f64>,
    row: f64,
    col: f64,
    aperture: &Aperture,
) -> Result<PhotometryResult> {
    aperture.validate()?;
    let (rows, cols) = image.dim();

    let reach = aperture.annulus_outer + 1.0;
    let mut edge = row - reach < 0.0
        || col - reach < 0.0
        || row + reach > rows as f64 - 1.0
        || col + reach > cols as f64 - 1.0;

    let r_lo = ((row - reach).floor().max(0.0)) as usize;
    let c_lo = ((col - reach).floor().max(0.0)) as usize;
    let r_hi = ((row + reach).ceil() as usize).min(rows.saturating_sub(1));
    let c_hi = ((col + reach).ceil() as usize).min(cols.saturating_sub(1));

    let mut aperture_sum = 0.0;
    let mut aperture_area = 0.0;
    let mut annulus = Vec::new();

    let inner2 = aperture.annulus_inner.powi(2);
    let outer2 = aperture.annulus_outer.powi(2);

    for r in r_lo..=r_hi {
        for c in c_lo..=c_hi {
            let dr = r as f64 - row;
            let dc = c as f64 - col;
            let value = image[[r, c]];

            // Masked (NaN) pixels are dropped from both the sum and
            // the effective area.
            let weight = pixel_fraction(dr, dc, aperture.radius);
            if weight > 0.0 && !value.is_nan() {
                aperture_sum += weight * value;
                aperture_area += weight;
            }

            let d2 = dr * dr + dc * dc;
            if d2 >= inner2 && d2 < outer2 && !value.is_nan() {
                annulus.push(value);
            }
        }
    }

    let (background, background_std, n_annulus) =
        match stats::sigma_clipped_stats(&annulus, ANNULUS_CLIP_SIGMA, ANNULUS_CLIP_ITERS) {
            Some(bkg) => (bkg.median, bkg.std_dev, annulus.len() - bkg.clipped),
            None => {
                // No usable annulus pixels at all; treat as an edge
                // case with zero background rather than failing.
                edge = true;
                (0.0, 0.0, 0)
            }
        };

    let flux = aperture_sum - background * aperture_area;

    // Shot noise on the source plus background noise scaled by the
    // aperture area, including the uncertainty of the background mean
    // itself, combined in quadrature.
    let mut variance = flux.max(0.0) + aperture_area * background_std.powi(2);
    if n_annulus > 0 {
        variance += (aperture_area * background_std).powi(2) / n_annulus as f64;
    }
    let flux_err = variance.sqrt();

    let quality = Quality {
        low_snr: flux < 3.0 * flux_err,
        edge,
    };

    Ok(PhotometryResult {
        flux,
        flux_err,
        background,
        background_std,
        aperture_area,
        quality,
    })
}
