//! Two-stage dose-response fit: a coarse bounded fit that also derives
//! plateau estimates from the raw responses, then a refinement that tries
//! two starting points and rescues shallow slopes.

use serde::Serialize;

use super::lm::{LeastSquaresFit, LeastSquaresOptions, least_squares};
use super::model::{Bounds, FourPl};
use crate::stats::{median, nan_max, nan_mean, nan_min};

/// Slopes at or below this are refitted with tighter slope bounds.
pub const SHALLOW_SLOPE: f64 = 0.2;

/// Plateau estimates and starting curve from the first stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct InitialFit {
    /// Estimated lower plateau, within `[0, 99]`.
    pub bottom: f64,
    /// Estimated upper plateau, within `[1, 100]`.
    pub top: f64,
    pub slope: f64,
    pub log10_ic50: f64,
}

/// Final curve of the second stage.
#[derive(Debug, Clone)]
pub struct RefinedFit {
    pub params: FourPl,
    pub ic50_stderr: Option<f64>,
    /// Population standard deviation of the residuals.
    pub residual_std: f64,
    pub fit: LeastSquaresFit,
}

/// Running mean over a trailing window; `NaN` until the window is full.
fn rolling_mean(values: &[f64], window: usize) -> Vec<f64> {
    (0..values.len())
        .map(|i| {
            if i + 1 < window {
                f64::NAN
            } else {
                values[i + 1 - window..=i].iter().sum::<f64>() / window as f64
            }
        })
        .collect()
}

/// First stage.  `x` is log10 molar dose sorted ascending, `y` percent
/// inhibition.
pub fn initial_fit(x: &[f64], y: &[f64]) -> InitialFit {
    let min_y = nan_min(y);
    let max_y = nan_max(y);
    let min_x = nan_min(x);
    let max_x = nan_max(x);

    let start = FourPl {
        slope: 1.0,
        bottom: 0.0,
        top: 100.0,
        log10_ic50: median(x).unwrap_or(min_x),
    };
    let bounds = Bounds::new(
        (0.0, 4.0),
        (0.0, min_y.max(5.0)),
        (max_y.min(95.0), 100.0),
        (min_x, max_x),
    );
    let fit = least_squares(x, y, start, &bounds, LeastSquaresOptions::default());
    let fitted = fit.params;
    log::debug!("Initial 4PL fit: {fitted:?} after {} iterations", fit.iterations);

    let bottom = min_y.clamp(0.0, 99.0).min(fitted.bottom.clamp(0.0, 99.0));

    let top_pre = max_y
        .min(100.0)
        .max(1.0)
        .max(fitted.top.min(100.0).max(1.0));

    // Plateau correction: when the response falls off again at the highest
    // doses, the plateau is what the curve reached before the drop.
    let running = rolling_mean(y, 3);
    let mut top_run = top_pre;
    if let Some((&last, head)) = running.split_last() {
        if nan_max(head) > last {
            let above: Vec<f64> = running
                .iter()
                .zip(y)
                .filter(|(r, _)| **r > last)
                .map(|(_, v)| *v)
                .collect();
            top_run = nan_max(&above);
        }
    }
    if max_y > top_run {
        let above: Vec<f64> = y.iter().copied().filter(|v| *v > top_run).collect();
        top_run = nan_mean(&above) + 1.0;
    }
    let top_post = top_run.max(1.0).min(100.0);
    let mut top = top_pre.max(top_post);

    let mut log10_ic50 = fitted.log10_ic50;
    if bottom >= top || log10_ic50 > max_x {
        log10_ic50 = max_x;
    } else if log10_ic50 < min_x {
        log10_ic50 = min_x;
    }
    if max_y < 0.0 {
        log10_ic50 = max_x;
    } else if min_y > 100.0 {
        log10_ic50 = min_x;
    }
    if y.len() > 2 && nan_mean(&y[..y.len() - 2]) < 5.0 {
        log10_ic50 = max_x;
    }

    if bottom == top {
        top += 0.001;
    }

    InitialFit {
        bottom,
        top,
        slope: fitted.slope,
        log10_ic50,
    }
}

/// Second stage.
pub fn refine_fit(x: &[f64], y: &[f64], initial: &InitialFit) -> RefinedFit {
    let min_x = nan_min(x);
    let max_x = nan_max(x);
    let top_floor = (initial.top * 0.9).min(90.0);
    let bottom_ceiling = (initial.bottom * 1.1).max(10.0);

    let mut bounds = Bounds::new(
        (0.0, 4.0),
        (0.0, bottom_ceiling),
        (top_floor, 100.0),
        (min_x, max_x),
    );
    let start = FourPl {
        slope: initial.slope,
        bottom: initial.bottom,
        top: initial.top,
        log10_ic50: initial.log10_ic50,
    };
    let options = LeastSquaresOptions::default();

    let from_initial = least_squares(x, y, start, &bounds, options);
    let from_median = least_squares(
        x,
        y,
        FourPl {
            log10_ic50: median(x).unwrap_or(initial.log10_ic50),
            ..start
        },
        &bounds,
        options,
    );
    let mut chosen = if from_initial.residual_std() < from_median.residual_std() {
        from_initial
    } else {
        from_median
    };

    if chosen.params.slope <= SHALLOW_SLOPE {
        log::debug!(
            "Slope {:.3} is shallow; refitting with slope in [0.1, 2.5]",
            chosen.params.slope
        );
        bounds.lower[0] = 0.1;
        bounds.upper[0] = 2.5;
        chosen = least_squares(x, y, start, &bounds, options);
    }

    RefinedFit {
        params: chosen.params,
        ic50_stderr: chosen.stderr.map(|se| se[3]),
        residual_std: chosen.residual_std(),
        fit: chosen,
    }
}
