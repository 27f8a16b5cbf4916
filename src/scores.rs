//! Drug sensitivity scores derived from a fitted curve, and goodness-of-fit
//! statistics comparing observed and fitted responses.

use serde::Serialize;

use std::f64::consts::{LN_10, PI, SQRT_2};

use crate::fit::{FourPl, integrate};

/// Round half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let f = 10f64.powi(decimals);
    (value * f).round() / f
}

// ---------------------------------------------------------------------------
// Areas
// ---------------------------------------------------------------------------

/// Area between the curve and `baseline` (AUC) and between the curve and
/// `max_inhibition` (AAC) over the tested log10 range, 2 decimals each.
pub fn auc_aac(curve: &FourPl, baseline: f64, max_inhibition: f64, min_x: f64, max_x: f64) -> (f64, f64) {
    let auc = integrate(|x| curve.eval(x) - baseline, min_x, max_x);
    let aac = integrate(|x| max_inhibition - curve.eval(x), min_x, max_x);
    (round_to(auc, 2), round_to(aac, 2))
}

/// Area above 50 % inhibition over `[start, start + limit]`, as a
/// percentage of the box between `baseline` and `max_inhibition`.
pub fn xepto50(curve: &FourPl, start: f64, baseline: f64, max_inhibition: f64, limit: f64) -> Option<f64> {
    let area = integrate(|x| curve.eval(x) - 50.0, start, start + limit);
    let area_of_interest = (max_inhibition - baseline) * limit;
    let score = area / area_of_interest * 100.0;
    score.is_finite().then(|| round_to(score, 2))
}

// ---------------------------------------------------------------------------
// Drug sensitivity score
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DssKind {
    /// Normalised area above the baseline.
    Dss1,
    /// DSS1 divided by `log10(top)`.
    Dss2,
    /// DSS2 weighted by the active share of the tested range.
    Dss3,
}

/// Inputs of [`dss`]; concentrations in the configured unit.
#[derive(Debug, Clone, Copy)]
pub struct DssInput {
    pub ic50: f64,
    pub slope: f64,
    pub top: f64,
    pub min_concentration: f64,
    pub max_concentration: f64,
    pub baseline: f64,
    /// Factor converting the configured unit to molar.
    pub to_molar: f64,
}

/// Drug sensitivity score.  `None` when an input is not a number.
pub fn dss(input: &DssInput, kind: DssKind) -> Option<f64> {
    let DssInput {
        ic50,
        slope,
        top,
        min_concentration,
        max_concentration,
        baseline: y,
        to_molar,
    } = *input;
    let min_con = (min_concentration * to_molar).log10();
    if [ic50, slope, top, min_con, max_concentration]
        .iter()
        .any(|v| v.is_nan())
    {
        return None;
    }
    if ic50 >= max_concentration || slope == 0.0 {
        return Some(0.0);
    }

    let a = top.min(100.0);
    let b = slope.abs();
    let d = 0.0;
    if a <= y {
        return Some(0.0);
    }

    let c = (ic50 * to_molar).log10();
    let x2 = (max_concentration * to_molar).log10();
    // Dose where the curve crosses the baseline (inverse of the logistic).
    let x1 = if y != 0.0 {
        let cross = c - ((a - y).ln() - (y - d).ln()) / (b * LN_10);
        if cross < min_con {
            min_con
        } else if cross > x2 {
            x2
        } else {
            cross
        }
    } else {
        min_con
    };

    let curve = FourPl {
        slope: b,
        bottom: d,
        top: a,
        log10_ic50: c,
    };
    let int_y = integrate(|x| curve.eval(x), x1, x2) - y * (x2 - x1);
    let total_area = (x2 - min_con) * (100.0 - y);
    let share = int_y / total_area * 100.0;

    let norm = match kind {
        DssKind::Dss1 => share,
        DssKind::Dss2 => {
            if a.log10() <= 0.0 {
                return Some(0.0);
            }
            let v = share / a.log10();
            if v > 50.0 { 0.0 } else { v }
        }
        DssKind::Dss3 => {
            if a.log10() <= 0.0 {
                return Some(0.0);
            }
            share * (2.0 / a.log10()) * ((x2 - x1) / (x2 - min_con))
        }
    };

    if !norm.is_finite() || !(0.0..=100.0).contains(&norm) {
        Some(0.0)
    } else {
        Some(round_to(norm, 2))
    }
}

// ---------------------------------------------------------------------------
// Fit quality
// ---------------------------------------------------------------------------

/// Goodness-of-fit statistics between observed and fitted responses.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualityScores {
    /// Coefficient of determination with the observed responses as the
    /// truth and the fitted ones as the prediction. Tools that pass the
    /// arguments the other way round (fitted as truth) report a different
    /// value, and so a different adjusted R².
    pub r2: f64,
    pub adjusted_r2: Option<f64>,
    /// Standard error of the estimate, `sqrt(SSR / (n - 2))`.
    pub syx: Option<f64>,
    pub rmse: f64,
    /// Shapiro-Wilk p-value of the residuals.
    pub normality_p: Option<f64>,
    pub explained_variance: f64,
    pub max_error: f64,
    /// Square root of the mean absolute error.
    pub root_mean_abs_error: f64,
    pub mape: f64,
}

pub fn quality_scores(observed: &[f64], fitted: &[f64]) -> QualityScores {
    let n = observed.len().min(fitted.len());
    let nf = n as f64;
    let residuals: Vec<f64> = observed.iter().zip(fitted).map(|(o, f)| o - f).collect();

    let mean_obs = observed.iter().sum::<f64>() / nf;
    let ssr: f64 = residuals.iter().map(|r| r * r).sum();
    let sst: f64 = observed.iter().map(|o| (o - mean_obs).powi(2)).sum();
    let r2 = if sst > 0.0 {
        1.0 - ssr / sst
    } else if ssr == 0.0 {
        1.0
    } else {
        0.0
    };

    let adjusted_r2 = (n > 2).then(|| 1.0 - (1.0 - r2) * (nf - 1.0) / (nf - 2.0));
    let syx = (n > 2).then(|| (ssr / (nf - 2.0)).sqrt());

    let mean_res = residuals.iter().sum::<f64>() / nf;
    let var_res = residuals.iter().map(|r| (r - mean_res).powi(2)).sum::<f64>() / nf;
    let var_obs = sst / nf;
    let explained_variance = if var_obs > 0.0 {
        1.0 - var_res / var_obs
    } else if var_res == 0.0 {
        1.0
    } else {
        0.0
    };

    let abs: Vec<f64> = residuals.iter().map(|r| r.abs()).collect();
    let mae = abs.iter().sum::<f64>() / nf;
    let mape = abs
        .iter()
        .zip(observed)
        .map(|(e, o)| e / o.abs().max(f64::EPSILON))
        .sum::<f64>()
        / nf;

    QualityScores {
        r2,
        adjusted_r2,
        syx,
        rmse: (ssr / nf).sqrt(),
        normality_p: shapiro_wilk(&residuals).map(|(_, p)| p),
        explained_variance,
        max_error: abs.iter().copied().fold(0.0, f64::max),
        root_mean_abs_error: mae.sqrt(),
        mape,
    }
}

// ---------------------------------------------------------------------------
// Shapiro-Wilk (Royston 1995, algorithm AS R94)
// ---------------------------------------------------------------------------

/// `c[0] + c[1]·x + c[2]·x² + …`
fn poly(c: &[f64], x: f64) -> f64 {
    c.iter().rev().fold(0.0, |acc, &ci| acc * x + ci)
}

/// Shapiro-Wilk `(W, p)` for 3 to 5000 values; `None` outside that range
/// or when all values are equal.
pub fn shapiro_wilk(values: &[f64]) -> Option<(f64, f64)> {
    let mut x: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    let n = x.len();
    if !(3..=5000).contains(&n) {
        return None;
    }
    x.sort_by(f64::total_cmp);
    let range = x[n - 1] - x[0];
    if range < 1e-19 {
        return None;
    }

    let nn2 = n / 2;
    let an = n as f64;
    let mut a = vec![0.0; nn2];
    if n == 3 {
        a[0] = 0.5f64.sqrt();
    } else {
        const C1: [f64; 6] = [0.0, 0.221157, -0.147981, -2.071190, 4.434685, -2.706056];
        const C2: [f64; 6] = [0.0, 0.042981, -0.293762, -1.752461, 5.682633, -3.582633];
        let an25 = an + 0.25;
        let m: Vec<f64> = (1..=nn2)
            .map(|i| normal_quantile((i as f64 - 0.375) / an25))
            .collect();
        let summ2 = 2.0 * m.iter().map(|v| v * v).sum::<f64>();
        let ssumm2 = summ2.sqrt();
        let rsn = 1.0 / an.sqrt();
        let a1 = poly(&C1, rsn) - m[0] / ssumm2;

        let (first_free, fac) = if n > 5 {
            let a2 = -m[1] / ssumm2 + poly(&C2, rsn);
            let fac = ((summ2 - 2.0 * m[0] * m[0] - 2.0 * m[1] * m[1])
                / (1.0 - 2.0 * a1 * a1 - 2.0 * a2 * a2))
                .sqrt();
            a[1] = a2;
            (2, fac)
        } else {
            let fac = ((summ2 - 2.0 * m[0] * m[0]) / (1.0 - 2.0 * a1 * a1)).sqrt();
            (1, fac)
        };
        a[0] = a1;
        for i in first_free..nn2 {
            a[i] = -m[i] / fac;
        }
    }

    // W = (Σ aᵢ·(x₍ₙ₋ᵢ₎ - x₍ᵢ₎))² / Σ(x - x̄)²
    let mean = x.iter().sum::<f64>() / an;
    let ss: f64 = x.iter().map(|v| (v - mean).powi(2)).sum();
    let b: f64 = (0..nn2).map(|i| a[i] * (x[n - 1 - i] - x[i])).sum();
    let w = (b * b / ss).min(1.0);

    if n == 3 {
        const PI6: f64 = 6.0 / PI;
        const STQR: f64 = PI / 3.0;
        let p = (PI6 * (w.sqrt().asin() - STQR)).clamp(0.0, 1.0);
        return Some((w, p));
    }

    let w1 = 1.0 - w;
    if w1 <= 0.0 {
        return Some((w, 1.0));
    }
    let mut y = w1.ln();
    let (mu, sigma) = if n <= 11 {
        let gamma = poly(&[-2.273, 0.459], an);
        if y >= gamma {
            return Some((w, 1e-99));
        }
        y = -(gamma - y).ln();
        (
            poly(&[0.544, -0.39978, 0.025054, -6.714e-4], an),
            poly(&[1.3822, -0.77857, 0.062767, -0.0020322], an).exp(),
        )
    } else {
        let ln_n = an.ln();
        (
            poly(&[-1.5861, -0.31082, -0.083751, 0.0038915], ln_n),
            poly(&[-0.4803, -0.082676, 0.0030302], ln_n).exp(),
        )
    };
    let p = normal_upper_tail((y - mu) / sigma);
    Some((w, p.clamp(0.0, 1.0)))
}

// ---------------------------------------------------------------------------
// Normal distribution helpers
// ---------------------------------------------------------------------------

fn erfc(x: f64) -> f64 {
    if x < 0.0 {
        return 2.0 - erfc(-x);
    }
    if x < 2.0 {
        // Maclaurin series of erf.
        let mut term = x;
        let mut sum = x;
        let x2 = x * x;
        for k in 1..200 {
            term *= -x2 / k as f64;
            let add = term / (2 * k + 1) as f64;
            sum += add;
            if add.abs() < 1e-17 * sum.abs() {
                break;
            }
        }
        return 1.0 - 2.0 / PI.sqrt() * sum;
    }
    // Continued fraction (modified Lentz) for larger arguments.
    let tiny = 1e-300;
    let mut f = x;
    let mut c = x;
    let mut d = 0.0;
    for k in 1..500 {
        let ak = k as f64 / 2.0;
        d = x + ak * d;
        d = if d.abs() < tiny { tiny } else { d };
        c = x + ak / c;
        c = if c.abs() < tiny { tiny } else { c };
        d = 1.0 / d;
        let delta = c * d;
        f *= delta;
        if (delta - 1.0).abs() < 1e-16 {
            break;
        }
    }
    (-x * x).exp() / PI.sqrt() / f
}

/// `P(Z > z)` for a standard normal `Z`.
pub fn normal_upper_tail(z: f64) -> f64 {
    0.5 * erfc(z / SQRT_2)
}

/// Inverse of the standard normal CDF (Acklam's rational approximation with
/// one Halley refinement step).
pub fn normal_quantile(p: f64) -> f64 {
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    const A: [f64; 6] = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];
    const P_LOW: f64 = 0.02425;

    let tail = |q: f64| {
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    };
    let x = if p < P_LOW {
        tail((-2.0 * p.ln()).sqrt())
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        -tail((-2.0 * (1.0 - p).ln()).sqrt())
    };

    let e = 0.5 * erfc(-x / SQRT_2) - p;
    let u = e * (2.0 * PI).sqrt() * (x * x / 2.0).exp();
    x - u / (1.0 + x * u / 2.0)
}
