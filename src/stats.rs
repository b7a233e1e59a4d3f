//! Robust statistics primitives shared by the pipeline stages.
//!
//! All functions ignore NaN samples, which is how masked pixels
//! propagate through the pipeline without special-case plumbing.

/// Result of iterative sigma clipping over a sample set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClippedStats {
    /// Mean of the surviving samples.
    pub mean: f64,
    /// Median of the surviving samples.
    pub median: f64,
    /// Standard deviation of the surviving samples.
    pub std_dev: f64,
    /// Iterations actually run before convergence or the cap.
    pub iterations: usize,
    /// Number of samples clipped away.
    pub clipped: usize,
}

/// Calculate the median of a slice, filtering out NaN values.
///
/// Returns `None` if no valid samples remain. Even-length data returns
/// the average of the two middle values.
pub fn median(values: &[f64]) -> Option<f64> {
    let mut valid: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if valid.is_empty() {
        return None;
    }
    valid.sort_by(|a, b| a.total_cmp(b));

    let mid = valid.len() / 2;
    Some(if valid.len() % 2 == 0 {
        (valid[mid - 1] + valid[mid]) / 2.0
    } else {
        valid[mid]
    })
}

/// Mean and population standard deviation of the non-NaN samples.
///
/// Returns `None` for an empty (or all-NaN) input.
pub fn mean_std(values: &[f64]) -> Option<(f64, f64)> {
    let valid: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if valid.is_empty() {
        return None;
    }
    let n = valid.len() as f64;
    let mean = valid.iter().sum::<f64>() / n;
    let variance = valid.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some((mean, variance.sqrt()))
}

/// Iteratively sigma-clip a sample set and report robust statistics.
///
/// Each iteration recomputes mean and standard deviation of the
/// surviving samples and masks everything farther than
/// `sigma * std_dev` from the mean. The loop terminates when an
/// iteration masks no new samples, or after `max_iters` iterations.
///
/// Returns `None` if no valid samples remain after NaN filtering.
pub fn sigma_clipped_stats(values: &[f64], sigma: f64, max_iters: usize) -> Option<ClippedStats> {
    let mut survivors: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if survivors.is_empty() {
        return None;
    }
    let initial = survivors.len();

    let mut iterations = 0;
    for _ in 0..max_iters {
        let (mean, std_dev) = mean_std(&survivors)?;
        if std_dev <= f64::EPSILON {
            break;
        }
        let before = survivors.len();
        survivors.retain(|v| (v - mean).abs() <= sigma * std_dev);
        iterations += 1;
        if survivors.len() == before {
            break;
        }
        // A pathological clip can empty the set; fall back to the last
        // surviving statistics rather than returning nothing.
        if survivors.is_empty() {
            return Some(ClippedStats {
                mean,
                median: mean,
                std_dev,
                iterations,
                clipped: initial,
            });
        }
    }

    let (mean, std_dev) = mean_std(&survivors)?;
    let median = median(&survivors)?;
    Some(ClippedStats {
        mean,
        median,
        std_dev,
        iterations,
        clipped: initial - survivors.len(),
    })
}
