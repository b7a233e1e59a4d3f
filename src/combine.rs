//! Statistical combination of same-shape frame stacks into master
//! calibration frames.
//!
//! The combiner is the single synchronization point of the pipeline:
//! every science frame depends on the same master bias and flat, so all
//! input frames must be resident before combination starts.

use log::info;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::stats;

/// How a stack of frames is reduced to one value per pixel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CombineMethod {
    /// Per-pixel arithmetic mean.
    Mean,
    /// Per-pixel median.
    Median,
    /// Per-pixel mean after iterative sigma clipping across the stack.
    SigmaClippedMean { sigma: f64, max_iters: usize },
}

impl Default for CombineMethod {
    fn default() -> Self {
        CombineMethod::SigmaClippedMean {
            sigma: 3.0,
            max_iters: 5,
        }
    }
}

impl CombineMethod {
    /// Short identifier used in persisted provenance headers.
    pub fn name(&self) -> &'static str {
        match self {
            CombineMethod::Mean => "mean",
            CombineMethod::Median => "median",
            CombineMethod::SigmaClippedMean { .. } => "sigclip",
        }
    }
}

/// Provenance of a combined master frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombineProvenance {
    /// Number of input frames combined.
    pub frame_count: usize,
    /// Combination method (including clip parameters).
    pub method: CombineMethod,
    /// Maximum clip iterations actually run at any pixel.
    pub iterations_used: usize,
    /// Fraction of pixels where clipping left fewer than 2 samples and
    /// the unclipped mean was used instead.
    pub fallback_fraction: f64,
}

/// A combined calibration frame. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterFrame {
    data: Array2<f64>,
    provenance: CombineProvenance,
}

impl MasterFrame {
    pub(crate) fn from_parts(data: Array2<f64>, provenance: CombineProvenance) -> Self {
        MasterFrame { data, provenance }
    }

    /// Combined pixel data.
    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    /// Combination provenance record.
    pub fn provenance(&self) -> &CombineProvenance {
        &self.provenance
    }

    /// `(rows, cols)` dimensions.
    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }
}

/// Outcome of sigma-clipping one pixel's stack of samples.
struct PixelClip {
    value: f64,
    iterations: usize,
    fell_back: bool,
}

/// Iteratively clip one pixel's samples and average the survivors.
///
/// Bounded loop: terminates when an iteration masks nothing new or the
/// cap is hit. If fewer than 2 samples survive, falls back to the
/// unclipped mean so a local outlier excess never fails the frame.
fn clip_pixel(samples: &[f64], sigma: f64, max_iters: usize) -> PixelClip {
    let plain_mean = samples.iter().sum::<f64>() / samples.len() as f64;

    let mut survivors = samples.to_vec();
    let mut iterations = 0;
    for _ in 0..max_iters {
        let n = survivors.len() as f64;
        let mean = survivors.iter().sum::<f64>() / n;
        let std = (survivors.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
        if std <= f64::EPSILON {
            break;
        }
        let before = survivors.len();
        survivors.retain(|v| (v - mean).abs() <= sigma * std);
        iterations += 1;
        if survivors.len() == before || survivors.len() < 2 {
            break;
        }
    }

    if survivors.len() < 2 {
        return PixelClip {
            value: plain_mean,
            iterations,
            fell_back: true,
        };
    }

    PixelClip {
        value: survivors.iter().sum::<f64>() / survivors.len() as f64,
        iterations,
        fell_back: false,
    }
}

fn check_shapes(frames: &[Array2<f64>]) -> Result<(usize, usize)> {
    let expected = frames[0].dim();
    for frame in &frames[1..] {
        if frame.dim() != expected {
            return Err(Error::ShapeMismatch {
                expected,
                actual: frame.dim(),
            });
        }
    }
    Ok(expected)
}

/// Combine a non-empty stack of same-shape frames into a master frame.
pub fn combine(frames: &[Array2<f64>], method: CombineMethod) -> Result<MasterFrame> {
    if frames.is_empty() {
        return Err(Error::InsufficientData(
            "no frames provided for combination".to_string(),
        ));
    }
    let (rows, cols) = check_shapes(frames)?;

    let mut data = Array2::zeros((rows, cols));
    let mut iterations_used = 0usize;
    let mut fallback_pixels = 0usize;

    let mut stack = vec![0.0; frames.len()];
    for row in 0..rows {
        for col in 0..cols {
            for (k, frame) in frames.iter().enumerate() {
                stack[k] = frame[[row, col]];
            }
            data[[row, col]] = match method {
                CombineMethod::Mean => stack.iter().sum::<f64>() / stack.len() as f64,
                CombineMethod::Median => stats::median(&stack).unwrap_or(f64::NAN),
                CombineMethod::SigmaClippedMean { sigma, max_iters } => {
                    let clip = clip_pixel(&stack, sigma, max_iters);
                    iterations_used = iterations_used.max(clip.iterations);
                    if clip.fell_back {
                        fallback_pixels += 1;
                    }
                    clip.value
                }
            };
        }
    }

    let fallback_fraction = fallback_pixels as f64 / (rows * cols) as f64;
    info!(
        "combined {} frames ({}x{}) with {}: {} fallback pixels ({:.4}%)",
        frames.len(),
        rows,
        cols,
        method.name(),
        fallback_pixels,
        fallback_fraction * 100.0
    );

    Ok(MasterFrame::from_parts(
        data,
        CombineProvenance {
            frame_count: frames.len(),
            method,
            iterations_used,
            fallback_fraction,
        },
    ))
}

/// Build a master bias by combining zero-exposure frames.
pub fn master_bias(frames: &[Array2<f64>], method: CombineMethod) -> Result<MasterFrame> {
    combine(frames, method)
}

/// Build a normalized master flat from flat-field exposures.
///
/// Each flat is bias-subtracted (when a master bias is supplied) and
/// divided by its own median before combination, so exposures taken at
/// different illumination levels combine consistently. The combined
/// frame is renormalized to unit median.
pub fn master_flat(
    frames: &[Array2<f64>],
    bias: Option<&MasterFrame>,
    method: CombineMethod,
) -> Result<MasterFrame> {
    if frames.is_empty() {
        return Err(Error::InsufficientData(
            "no flat frames provided".to_string(),
        ));
    }
    let shape = check_shapes(frames)?;
    if let Some(bias) = bias {
        if bias.dim() != shape {
            return Err(Error::ShapeMismatch {
                expected: shape,
                actual: bias.dim(),
            });
        }
    }

    let mut normalized = Vec::with_capacity(frames.len());
    for frame in frames {
        let mut flat = frame.clone();
        if let Some(bias) = bias {
            flat -= bias.data();
        }
        let samples: Vec<f64> = flat.iter().copied().collect();
        let med = stats::median(&samples)
            .filter(|m| *m > 0.0)
            .ok_or_else(|| {
                Error::DegenerateFlat("flat frame has non-positive median".to_string())
            })?;
        flat /= med;
        normalized.push(flat);
    }

    let combined = combine(&normalized, method)?;
    let samples: Vec<f64> = combined.data().iter().copied().collect();
    let med = stats::median(&samples)
        .filter(|m| *m > 0.0)
        .ok_or_else(|| {
            Error::DegenerateFlat("combined flat has non-positive median".to_string())
        })?;

    let provenance = combined.provenance().clone();
    let data = combined.data() / med;
    Ok(MasterFrame::from_parts(data, provenance))
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn constant_stack(n: usize, shape: (usize, usize), value: f64) -> Vec<Array2<f64>> {
        (0..n).map(|_| Array2::from_elem(shape, value)).collect()
    }

    #[test]
    fn constant_stack_is_identity_for_all_methods() {
        let frames = constant_stack(6, (4, 5), 42.0);
        for method in [
            CombineMethod::Mean,
            CombineMethod::Median,
            CombineMethod::default(),
        ] {
            let master = combine(&frames, method).unwrap();
            for &v in master.data().iter() {
                assert_relative_eq!(v, 42.0);
            }
            assert_eq!(master.provenance().frame_count, 6);
            assert_relative_eq!(master.provenance().fallback_fraction, 0.0);
        }
    }

    #[test]
    fn sigma_clip_rejects_outlier_plain_mean_does_not() {
        let mut frames = constant_stack(5, (3, 3), 100.0);
        // Tiny spread so the clipper has a nonzero std to work with.
        for (k, frame) in frames.iter_mut().enumerate() {
            frame.mapv_inplace(|v| v + (k as f64 - 2.0) * 0.01);
        }
        frames[0][[1, 1]] = 10_000.0;

        let clipped = combine(&frames, CombineMethod::default()).unwrap();
        assert_relative_eq!(clipped.data()[[1, 1]], 100.0, epsilon = 0.1);

        let mean = combine(&frames, CombineMethod::Mean).unwrap();
        assert!(mean.data()[[1, 1]] > 1000.0);
    }

    #[test]
    fn fallback_counts_pixels_with_excess_outliers() {
        // Two wildly disagreeing values among five leaves the clipper
        // unable to keep 2 consistent samples at that pixel.
        let mut frames = constant_stack(5, (2, 2), 100.0);
        for (k, frame) in frames.iter_mut().enumerate() {
            frame.mapv_inplace(|v| v + k as f64 * 0.01);
        }
        frames[0][[0, 0]] = -5_000.0;
        frames[1][[0, 0]] = 9_000.0;
        frames[2][[0, 0]] = 20_000.0;

        let master = combine(&frames, CombineMethod::default()).unwrap();
        assert!(master.provenance().fallback_fraction > 0.0);
        // The fallback is the plain mean, not a failure.
        assert!(master.data()[[0, 0]].is_finite());
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let frames = vec![Array2::zeros((3, 3)), Array2::zeros((3, 4))];
        match combine(&frames, CombineMethod::Mean) {
            Err(Error::ShapeMismatch { expected, actual }) => {
                assert_eq!(expected, (3, 3));
                assert_eq!(actual, (3, 4));
            }
            other => panic!("expected ShapeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(matches!(
            combine(&[], CombineMethod::Mean),
            Err(Error::InsufficientData(_))
        ));
    }

    #[test]
    fn master_flat_normalizes_to_unit_median() {
        let bias = master_bias(&constant_stack(3, (4, 4), 100.0), CombineMethod::Median).unwrap();
        // Flats at different illumination levels, same bias.
        let flats: Vec<Array2<f64>> = [1000.0, 2000.0, 1500.0]
            .iter()
            .map(|&level| Array2::from_elem((4, 4), level + 100.0))
            .collect();

        let flat = master_flat(&flats, Some(&bias), CombineMethod::Median).unwrap();
        for &v in flat.data().iter() {
            assert_relative_eq!(v, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn master_flat_rejects_nonpositive_frames() {
        let flats = vec![Array2::from_elem((3, 3), -5.0)];
        assert!(matches!(
            master_flat(&flats, None, CombineMethod::Median),
            Err(Error::DegenerateFlat(_))
        ));
    }
}
