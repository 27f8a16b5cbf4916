//! Bounded Levenberg-Marquardt least squares for the 4PL model.
//!
//! Steps are solved on the free parameters only: a parameter sitting on a
//! bound whose gradient pushes it outward is held fixed for that iteration,
//! and every trial point is projected back into the box.

use nalgebra::{DMatrix, DVector, SMatrix, SVector};

use super::model::{Bounds, FourPl, N_PARAMS};

type NormalMatrix = SMatrix<f64, N_PARAMS, N_PARAMS>;
type ParamVector = SVector<f64, N_PARAMS>;

#[derive(Debug, Clone, Copy)]
pub struct LeastSquaresOptions {
    pub max_iterations: usize,
    /// Relative SSR decrease below which the fit is considered converged.
    pub tolerance: f64,
}

impl Default for LeastSquaresOptions {
    fn default() -> Self {
        Self {
            max_iterations: 2000,
            tolerance: 1e-12,
        }
    }
}

/// Outcome of a bounded fit.
#[derive(Debug, Clone)]
pub struct LeastSquaresFit {
    pub params: FourPl,
    /// `model - data` per point.
    pub residuals: Vec<f64>,
    pub ssr: f64,
    /// Standard errors scaled by the reduced chi-square; `None` when the
    /// problem has no degrees of freedom or a singular normal matrix.
    pub stderr: Option<[f64; N_PARAMS]>,
    pub iterations: usize,
    pub converged: bool,
}

impl LeastSquaresFit {
    /// Population standard deviation of the residuals.
    pub fn residual_std(&self) -> f64 {
        let n = self.residuals.len() as f64;
        if n == 0.0 {
            return f64::NAN;
        }
        let mean = self.residuals.iter().sum::<f64>() / n;
        (self.residuals.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n).sqrt()
    }
}

fn sum_squares(params: &FourPl, x: &[f64], y: &[f64]) -> f64 {
    x.iter()
        .zip(y)
        .map(|(&xi, &yi)| (params.eval(xi) - yi).powi(2))
        .sum()
}

/// Normal matrix `JᵀJ` and gradient `Jᵀ(y - f)`.
fn normal_equations(params: &FourPl, x: &[f64], y: &[f64]) -> (NormalMatrix, ParamVector) {
    let mut jtj = NormalMatrix::zeros();
    let mut jtr = ParamVector::zeros();
    for (&xi, &yi) in x.iter().zip(y) {
        let g = ParamVector::from(params.gradient(xi));
        let r = yi - params.eval(xi);
        jtr += g * r;
        jtj += g * g.transpose();
    }
    (jtj, jtr)
}

/// Fit a 4PL curve to `(x, y)` starting at `start`, constrained to `bounds`.
pub fn least_squares(
    x: &[f64],
    y: &[f64],
    start: FourPl,
    bounds: &Bounds,
    options: LeastSquaresOptions,
) -> LeastSquaresFit {
    let mut p = bounds.clamp(start.to_array());
    let mut ssr = sum_squares(&FourPl::from_array(p), x, y);
    let mut lambda = 1e-3;
    let mut converged = false;
    let mut iterations = 0;

    while iterations < options.max_iterations {
        iterations += 1;
        let current = FourPl::from_array(p);
        let (jtj, jtr) = normal_equations(&current, x, y);

        let free: Vec<usize> = (0..N_PARAMS)
            .filter(|&i| {
                let pinned_low = p[i] <= bounds.lower[i] && jtr[i] < 0.0;
                let pinned_high = p[i] >= bounds.upper[i] && jtr[i] > 0.0;
                !(pinned_low || pinned_high)
            })
            .collect();
        if free.is_empty() {
            converged = true;
            break;
        }

        let mut improved = false;
        while lambda < 1e16 {
            let k = free.len();
            let mut a = DMatrix::from_fn(k, k, |r, c| jtj[(free[r], free[c])]);
            for (ri, &i) in free.iter().enumerate() {
                a[(ri, ri)] += lambda * jtj[(i, i)].max(1e-12);
            }
            let b = DVector::from_fn(k, |r, _| jtr[free[r]]);

            let Some(step) = solve(a, b) else {
                lambda *= 10.0;
                continue;
            };

            let mut trial = p;
            for (ri, &i) in free.iter().enumerate() {
                trial[i] += step[ri];
            }
            let trial = bounds.clamp(trial);
            let trial_ssr = sum_squares(&FourPl::from_array(trial), x, y);

            if trial_ssr.is_finite() && trial_ssr <= ssr {
                let decrease = ssr - trial_ssr;
                let stalled = trial
                    .iter()
                    .zip(p.iter())
                    .all(|(t, o)| (t - o).abs() <= 1e-12 * (o.abs() + 1e-12));
                p = trial;
                ssr = trial_ssr;
                lambda = (lambda / 10.0).max(1e-15);
                improved = true;
                if stalled || decrease <= options.tolerance * (ssr + options.tolerance) {
                    converged = true;
                }
                break;
            }
            lambda *= 10.0;
        }

        if !improved {
            // No downhill step at any damping: a (bounded) minimum.
            converged = true;
            break;
        }
        if converged {
            break;
        }
    }

    let params = FourPl::from_array(p);
    let residuals: Vec<f64> = x
        .iter()
        .zip(y)
        .map(|(&xi, &yi)| params.eval(xi) - yi)
        .collect();
    let stderr = standard_errors(&params, x, y, ssr);

    LeastSquaresFit {
        params,
        residuals,
        ssr,
        stderr,
        iterations,
        converged,
    }
}

fn standard_errors(params: &FourPl, x: &[f64], y: &[f64], ssr: f64) -> Option<[f64; N_PARAMS]> {
    if x.len() <= N_PARAMS {
        return None;
    }
    let (jtj, _) = normal_equations(params, x, y);
    let cov = jtj.try_inverse()?;
    let scale = ssr / (x.len() - N_PARAMS) as f64;
    let mut out = [0.0; N_PARAMS];
    for (i, se) in out.iter_mut().enumerate() {
        let v = cov[(i, i)] * scale;
        if !v.is_finite() || v < 0.0 {
            return None;
        }
        *se = v.sqrt();
    }
    Some(out)
}

/// LU solve of the damped system; `None` when singular or not finite.
fn solve(a: DMatrix<f64>, b: DVector<f64>) -> Option<DVector<f64>> {
    if a.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let x = a.lu().solve(&b)?;
    x.iter().all(|v| v.is_finite()).then_some(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wide_bounds() -> Bounds {
        Bounds::new((0.0, 4.0), (-20.0, 50.0), (50.0, 120.0), (-10.0, -3.0))
    }

    fn doses() -> Vec<f64> {
        (0..9).map(|i| -9.0 + 0.5 * i as f64).collect()
    }

    #[test]
    fn recovers_exact_parameters() {
        let truth = FourPl {
            slope: 1.3,
            bottom: 4.0,
            top: 92.0,
            log10_ic50: -6.8,
        };
        let x = doses();
        let y: Vec<f64> = x.iter().map(|&xi| truth.eval(xi)).collect();
        let start = FourPl {
            slope: 1.0,
            bottom: 0.0,
            top: 100.0,
            log10_ic50: -6.0,
        };
        let fit = least_squares(&x, &y, start, &wide_bounds(), LeastSquaresOptions::default());
        assert!(fit.converged);
        assert!(fit.ssr < 1e-12, "ssr {}", fit.ssr);
        assert!((fit.params.log10_ic50 - truth.log10_ic50).abs() < 1e-5);
        assert!((fit.params.slope - truth.slope).abs() < 1e-5);
        assert!(fit.residual_std() < 1e-6);
    }

    #[test]
    fn respects_bounds() {
        let truth = FourPl {
            slope: 1.0,
            bottom: 0.0,
            top: 100.0,
            log10_ic50: -6.0,
        };
        let x = doses();
        let y: Vec<f64> = x.iter().map(|&xi| truth.eval(xi)).collect();
        let bounds = Bounds::new((0.0, 4.0), (0.0, 10.0), (50.0, 80.0), (-10.0, -3.0));
        let fit = least_squares(&x, &y, truth, &bounds, LeastSquaresOptions::default());
        assert!(fit.params.top <= 80.0 + 1e-12);
        assert!(fit.params.top >= 50.0);
    }

    #[test]
    fn stderr_needs_degrees_of_freedom() {
        let x = vec![-8.0, -7.0, -6.0, -5.0];
        let y = vec![5.0, 20.0, 70.0, 95.0];
        let start = FourPl {
            slope: 1.0,
            bottom: 0.0,
            top: 100.0,
            log10_ic50: -6.5,
        };
        let fit = least_squares(&x, &y, start, &wide_bounds(), LeastSquaresOptions::default());
        assert!(fit.stderr.is_none());
    }

    #[test]
    fn noisy_fit_reports_stderr() {
        let truth = FourPl {
            slope: 1.0,
            bottom: 2.0,
            top: 95.0,
            log10_ic50: -6.5,
        };
        let x = doses();
        let noise = [1.5, -2.0, 0.7, -0.3, 2.2, -1.1, 0.4, -1.8, 1.0];
        let y: Vec<f64> = x.iter().zip(noise).map(|(&xi, e)| truth.eval(xi) + e).collect();
        let fit = least_squares(&x, &y, truth, &wide_bounds(), LeastSquaresOptions::default());
        let se = fit.stderr.expect("nine points leave five degrees of freedom");
        assert!(se[3] > 0.0 && se[3] < 0.5);
        assert!((fit.params.log10_ic50 + 6.5).abs() < 0.2);
    }

    #[test]
    fn solves_small_systems() {
        let a = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, 3.0]);
        let x = solve(a, DVector::from_vec(vec![3.0, 5.0])).unwrap();
        assert!((x[0] - 0.8).abs() < 1e-12 && (x[1] - 1.4).abs() < 1e-12);
        assert!(solve(DMatrix::zeros(1, 1), DVector::from_vec(vec![1.0])).is_none());
        assert!(solve(DMatrix::from_element(1, 1, f64::NAN), DVector::from_vec(vec![1.0])).is_none());
    }

    #[test]
    fn normal_matrix_is_symmetric() {
        let params = FourPl {
            slope: 1.2,
            bottom: 3.0,
            top: 90.0,
            log10_ic50: -6.5,
        };
        let x = doses();
        let y: Vec<f64> = x.iter().map(|&xi| params.eval(xi) + 1.0).collect();
        let (jtj, jtr) = normal_equations(&params, &x, &y);
        assert!((jtj - jtj.transpose()).amax() < 1e-9);
        // Constant residual of +1: gradient is the column sums of J.
        let col_sums: f64 = x.iter().map(|&xi| params.gradient(xi)[1]).sum();
        assert!((jtr[1] - col_sums).abs() < 1e-9);
    }
}
