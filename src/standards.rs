//! Photometric calibration against standard stars.
//!
//! Fits, per filter, the transformation from instrumental to catalog
//! magnitudes: `m_cat - m_inst = ZP + C * color`, where `ZP` is the
//! zero point and `C` the color term.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use log::{info, warn};
use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::photometry::PhotometryResult;

/// A measured standard star with its catalog values.
#[derive(Debug, Clone, PartialEq)]
pub struct StandardObservation {
    /// Aperture measurement of the standard.
    pub phot: PhotometryResult,
    /// Catalog magnitude in the observed filter.
    pub catalog_mag: f64,
    /// Catalog color index (e.g. B-V).
    pub color_index: f64,
    /// Filter the observation was taken in.
    pub filter: String,
}

/// Tunables for the standard-star fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StandardsConfig {
    /// Residual threshold, in sigma, for the single outlier-rejection
    /// pass after the initial fit.
    pub reject_sigma: f64,
}

impl Default for StandardsConfig {
    fn default() -> Self {
        StandardsConfig { reject_sigma: 3.0 }
    }
}

/// Fitted transformation for one filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSolution {
    /// Filter this solution applies to.
    pub filter: String,
    /// Magnitude zero point.
    pub zero_point: f64,
    /// Color term coefficient.
    pub color_coefficient: f64,
    /// RMS of the fit residuals in magnitudes.
    pub residual_rms: f64,
    /// Number of standards used in the final fit.
    pub standard_count: usize,
    /// Standards dropped for non-positive flux or outlying residuals.
    pub rejected_count: usize,
}

impl CalibrationSolution {
    /// Apply the solution to an instrumental magnitude.
    pub fn calibrate_mag(&self, instrumental_mag: f64, color_index: f64) -> f64 {
        instrumental_mag + self.zero_point + self.color_coefficient * color_index
    }
}

/// One usable data point of the per-filter fit.
struct FitPoint {
    color: f64,
    /// `m_cat - m_inst`, the quantity the model predicts.
    excess: f64,
}

/// Least-squares solve of `excess = ZP + C * color` via the normal
/// equations. Two parameters, so a 2x2 solve is exact.
fn solve_normal_equations(points: &[FitPoint]) -> Option<(f64, f64)> {
    let n = points.len() as f64;
    let sum_c: f64 = points.iter().map(|p| p.color).sum();
    let sum_cc: f64 = points.iter().map(|p| p.color * p.color).sum();
    let sum_y: f64 = points.iter().map(|p| p.excess).sum();
    let sum_cy: f64 = points.iter().map(|p| p.color * p.excess).sum();

    let lhs = Matrix2::new(n, sum_c, sum_c, sum_cc);
    let rhs = Vector2::new(sum_y, sum_cy);
    lhs.lu().solve(&rhs).map(|theta| (theta[0], theta[1]))
}

fn residual_rms(points: &[FitPoint], zero_point: f64, color_coefficient: f64) -> f64 {
    let sum_sq: f64 = points
        .iter()
        .map(|p| (p.excess - zero_point - color_coefficient * p.color).powi(2))
        .sum();
    (sum_sq / points.len() as f64).sqrt()
}

fn fit_filter(
    filter: &str,
    mut points: Vec<FitPoint>,
    mut rejected: usize,
    config: &StandardsConfig,
) -> Result<CalibrationSolution> {
    if points.len() < 3 {
        return Err(Error::InsufficientData(format!(
            "filter {filter}: {} usable standards, need at least 3",
            points.len()
        )));
    }

    let (mut zero_point, mut color_coefficient) =
        solve_normal_equations(&points).ok_or_else(|| {
            Error::InsufficientData(format!(
                "filter {filter}: color indices are degenerate, color term is unconstrained"
            ))
        })?;
    let mut rms = residual_rms(&points, zero_point, color_coefficient);

    // One bounded rejection pass: drop residual outliers and refit
    // once, but only when enough standards survive for the refit.
    if rms > 0.0 {
        let threshold = config.reject_sigma * rms;
        let inliers: Vec<FitPoint> = points
            .iter()
            .filter(|p| (p.excess - zero_point - color_coefficient * p.color).abs() <= threshold)
            .map(|p| FitPoint {
                color: p.color,
                excess: p.excess,
            })
            .collect();
        let dropped = points.len() - inliers.len();
        if dropped > 0 && inliers.len() >= 3 {
            warn!("filter {filter}: rejected {dropped} outlying standard(s), refitting");
            rejected += dropped;
            points = inliers;
            (zero_point, color_coefficient) =
                solve_normal_equations(&points).ok_or_else(|| {
                    Error::InsufficientData(format!(
                        "filter {filter}: degenerate colors after outlier rejection"
                    ))
                })?;
            rms = residual_rms(&points, zero_point, color_coefficient);
        }
    }

    let standard_count = points.len();

    info!(
        "filter {filter}: ZP={zero_point:.4} C={color_coefficient:.4} rms={rms:.4} ({standard_count} standards)"
    );

    Ok(CalibrationSolution {
        filter: filter.to_string(),
        zero_point,
        color_coefficient,
        residual_rms: rms,
        standard_count,
        rejected_count: rejected,
    })
}

/// Fit zero point and color term per filter from standard-star
/// observations.
///
/// Standards with non-positive measured flux are dropped (and counted
/// as rejected). Each filter needs at least 3 usable standards and a
/// non-degenerate spread of color indices. Solutions are returned in
/// filter-name order.
pub fn fit_standards(
    observations: &[StandardObservation],
    config: &StandardsConfig,
) -> Result<Vec<CalibrationSolution>> {
    if observations.is_empty() {
        return Err(Error::InsufficientData(
            "no standard-star observations provided".to_string(),
        ));
    }

    let mut by_filter: BTreeMap<&str, (Vec<FitPoint>, usize)> = BTreeMap::new();
    for obs in observations {
        let entry = by_filter.entry(obs.filter.as_str()).or_default();
        match obs.phot.instrumental_mag() {
            Some(m_inst) => entry.0.push(FitPoint {
                color: obs.color_index,
                excess: obs.catalog_mag - m_inst,
            }),
            None => {
                warn!(
                    "filter {}: dropping standard with non-positive flux {}",
                    obs.filter, obs.phot.flux
                );
                entry.1 += 1;
            }
        }
    }

    by_filter
        .into_iter()
        .map(|(filter, (points, rejected))| fit_filter(filter, points, rejected, config))
        .collect()
}

/// Write per-filter solutions as the tabular calibration artifact.
///
/// Columns: `filter,zero_point,color_coefficient,residual_rms,standard_count`.
pub fn write_solutions_csv<P: AsRef<Path>>(
    path: P,
    solutions: &[CalibrationSolution],
) -> Result<()> {
    let path = path.as_ref();
    let io_err = |e| Error::Io {
        path: path.to_path_buf(),
        source: e,
    };

    let mut file = File::create(path).map_err(io_err)?;
    writeln!(
        file,
        "filter,zero_point,color_coefficient,residual_rms,standard_count"
    )
    .map_err(io_err)?;
    for s in solutions {
        writeln!(
            file,
            "{},{:.6},{:.6},{:.6},{}",
            s.filter, s.zero_point, s.color_coefficient, s.residual_rms, s.standard_count
        )
        .map_err(io_err)?;
    }
    Ok(())
}
