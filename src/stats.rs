//! Replicate statistics: normalisation to percent inhibition, mean and
//! standard error per row, and iterative IQR outlier replacement.
//!
//! Missing cells are `NaN` throughout and are skipped by every statistic,
//! the way pandas treats them.

use serde::Serialize;

use crate::data::model::{ResponseKind, ResponseScale};

/// Values at or below this maximum are read as ratios whatever the declared scale.
pub const RATIO_AUTODETECT_MAX: f64 = 2.0;
/// Largest maximum still read as a ratio when the scale is declared as one.
pub const DECLARED_RATIO_MAX: f64 = 5.0;
/// IQR multiplier for outlier fences.
pub const IQR_THRESHOLD: f64 = 1.0;
pub const MAX_OUTLIER_ITERATIONS: usize = 3;
/// Outlier removal needs at least this many replicate columns.
pub const MIN_REPLICATES_FOR_OUTLIERS: usize = 3;

// ---------------------------------------------------------------------------
// NaN-aware reductions
// ---------------------------------------------------------------------------

fn present(values: &[f64]) -> impl Iterator<Item = f64> + '_ {
    values.iter().copied().filter(|v| !v.is_nan())
}

/// Maximum over non-missing values, `NaN` when there are none.
pub fn nan_max(values: &[f64]) -> f64 {
    present(values).fold(f64::NAN, f64::max)
}

/// Minimum over non-missing values, `NaN` when there are none.
pub fn nan_min(values: &[f64]) -> f64 {
    present(values).fold(f64::NAN, f64::min)
}

/// Mean over non-missing values, `NaN` when there are none.
pub fn nan_mean(values: &[f64]) -> f64 {
    let (sum, n) = present(values).fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 { f64::NAN } else { sum / n as f64 }
}

/// Standard error of the mean: sample standard deviation (n - 1) over
/// `sqrt(n)`.  `None` with fewer than two values.
pub fn sem(values: &[f64]) -> Option<f64> {
    let n = present(values).count();
    if n < 2 {
        return None;
    }
    let mean = nan_mean(values);
    let ss: f64 = present(values).map(|v| (v - mean).powi(2)).sum();
    let sd = (ss / (n - 1) as f64).sqrt();
    Some(sd / (n as f64).sqrt())
}

/// Quantile with linear interpolation between closest ranks.
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = present(values).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64))
}

/// Median of non-missing values.
pub fn median(values: &[f64]) -> Option<f64> {
    quantile(values, 0.5)
}

// ---------------------------------------------------------------------------
// Normalisation
// ---------------------------------------------------------------------------

/// Convert raw replicate values to percent inhibition, in place.
///
/// Ratios are scaled by 100 when the declared scale is `Ratio` and the
/// table maximum is at most 5, or whenever the maximum is at most 2.
/// Viability `v` becomes inhibition `100 - v`.  Returns whether the values
/// were rescaled.
pub fn normalize(matrix: &mut [Vec<f64>], kind: ResponseKind, scale: ResponseScale) -> bool {
    let max = matrix.iter().map(|row| nan_max(row)).fold(f64::NAN, f64::max);
    let rescale = (scale == ResponseScale::Ratio && max <= DECLARED_RATIO_MAX)
        || max <= RATIO_AUTODETECT_MAX;
    if rescale {
        log::info!("Responses peak at {max}; reading them as ratios");
    }

    for v in matrix.iter_mut().flat_map(|row| row.iter_mut()) {
        if rescale {
            *v *= 100.0;
        }
        if kind == ResponseKind::Viability {
            *v = 100.0 - *v;
        }
    }
    rescale
}

// ---------------------------------------------------------------------------
// Outliers
// ---------------------------------------------------------------------------

/// Blank out values outside `[Q1 - t·IQR, Q3 + t·IQR]`.  Returns how many
/// values were removed.
pub fn remove_row_outliers(row: &mut [f64], threshold: f64) -> usize {
    let (Some(q1), Some(q3)) = (quantile(row, 0.25), quantile(row, 0.75)) else {
        return 0;
    };
    let iqr = q3 - q1;
    let (low, high) = (q1 - threshold * iqr, q3 + threshold * iqr);

    let mut removed = 0;
    for v in row.iter_mut() {
        if *v < low || *v > high {
            *v = f64::NAN;
            removed += 1;
        }
    }
    removed
}

/// Fill missing values with the mean of the present ones.
fn impute_row_mean(row: &mut [f64]) {
    let mean = nan_mean(row);
    for v in row.iter_mut().filter(|v| v.is_nan()) {
        *v = mean;
    }
}

// ---------------------------------------------------------------------------
// Per-row summary
// ---------------------------------------------------------------------------

/// Mean response of one row and its replicate spread.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReplicateSummary {
    pub mean: f64,
    /// Absent with a single replicate column or fewer than two values.
    pub sem: Option<f64>,
    /// Values replaced by the row mean during outlier removal.
    pub outliers_replaced: usize,
}

/// Collapse replicate columns into mean and SEM per row.
///
/// With outlier removal and at least three replicate columns, rows are
/// cleaned iteratively: drop IQR outliers, impute the row mean, and keep
/// the result while the summed SEM keeps shrinking (at most
/// [`MAX_OUTLIER_ITERATIONS`] rounds).
pub fn summarize_replicates(matrix: &[Vec<f64>], remove_outliers: bool) -> Vec<ReplicateSummary> {
    let width = matrix.iter().map(Vec::len).max().unwrap_or(0);

    if width <= 1 {
        return matrix
            .iter()
            .map(|row| ReplicateSummary {
                mean: row.first().copied().unwrap_or(f64::NAN),
                sem: None,
                outliers_replaced: 0,
            })
            .collect();
    }

    let mut current = matrix.to_vec();
    let mut replaced = vec![0usize; matrix.len()];

    if remove_outliers && width >= MIN_REPLICATES_FOR_OUTLIERS {
        let mut best = f64::INFINITY;
        for round in 0..MAX_OUTLIER_ITERATIONS {
            let mut candidate = current.clone();
            let removed: Vec<usize> = candidate
                .iter_mut()
                .map(|row| {
                    let n = remove_row_outliers(row, IQR_THRESHOLD);
                    impute_row_mean(row);
                    n
                })
                .collect();
            let total: f64 = candidate.iter().filter_map(|row| sem(row)).sum();
            log::debug!("Outlier round {}: summed SEM {total:.4} (best {best:.4})", round + 1);

            if total < best {
                best = total;
                current = candidate;
                for (acc, n) in replaced.iter_mut().zip(removed) {
                    *acc += n;
                }
            } else {
                break;
            }
        }
    }

    current
        .iter()
        .zip(replaced)
        .map(|(row, outliers_replaced)| ReplicateSummary {
            mean: nan_mean(row),
            sem: sem(row),
            outliers_replaced,
        })
        .collect()
}
