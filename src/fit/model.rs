use serde::Serialize;

use std::f64::consts::LN_10;

// ---------------------------------------------------------------------------
// FourPl – the four-parameter logistic (Hill) curve
// ---------------------------------------------------------------------------

/// Parameters of `y = bottom + (top - bottom) / (1 + 10^(slope·(log10_ic50 - x)))`
/// where `x` is the log10 molar concentration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FourPl {
    /// Hill slope; positive slopes rise with dose.
    pub slope: f64,
    /// Lower asymptote (response at zero dose).
    pub bottom: f64,
    /// Upper asymptote (maximal response).
    pub top: f64,
    /// Inflection point, log10 molar.
    pub log10_ic50: f64,
}

pub const N_PARAMS: usize = 4;

impl FourPl {
    /// Response at log10 molar concentration `x`.
    pub fn eval(&self, x: f64) -> f64 {
        self.bottom + (self.top - self.bottom) * self.fraction(x)
    }

    /// Share of the span reached at `x`: `1 / (1 + 10^(slope·(c - x)))`,
    /// evaluated without overflow for steep curves.
    fn fraction(&self, x: f64) -> f64 {
        let t = self.slope * (self.log10_ic50 - x) * LN_10;
        if t > 0.0 {
            let e = (-t).exp();
            e / (1.0 + e)
        } else {
            1.0 / (1.0 + t.exp())
        }
    }

    /// Partial derivatives in parameter order `[slope, bottom, top, log10_ic50]`.
    pub fn gradient(&self, x: f64) -> [f64; N_PARAMS] {
        let p = self.fraction(x);
        let span = self.top - self.bottom;
        let dp = p * (1.0 - p) * LN_10;
        [
            span * dp * (x - self.log10_ic50),
            1.0 - p,
            p,
            -span * dp * self.slope,
        ]
    }

    pub fn to_array(self) -> [f64; N_PARAMS] {
        [self.slope, self.bottom, self.top, self.log10_ic50]
    }

    pub fn from_array(p: [f64; N_PARAMS]) -> Self {
        FourPl {
            slope: p[0],
            bottom: p[1],
            top: p[2],
            log10_ic50: p[3],
        }
    }
}

// ---------------------------------------------------------------------------
// Box constraints
// ---------------------------------------------------------------------------

/// Inclusive `(lower, upper)` limits per parameter, same order as
/// [`FourPl::to_array`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub lower: [f64; N_PARAMS],
    pub upper: [f64; N_PARAMS],
}

impl Bounds {
    pub fn new(slope: (f64, f64), bottom: (f64, f64), top: (f64, f64), log10_ic50: (f64, f64)) -> Self {
        Bounds {
            lower: [slope.0, bottom.0, top.0, log10_ic50.0],
            upper: [slope.1, bottom.1, top.1, log10_ic50.1],
        }
    }

    /// Clip every parameter into its interval.  A lower limit above the
    /// upper one wins, matching how start values are clipped.
    pub fn clamp(&self, p: [f64; N_PARAMS]) -> [f64; N_PARAMS] {
        let mut out = p;
        for i in 0..N_PARAMS {
            out[i] = out[i].min(self.upper[i]).max(self.lower[i]);
        }
        out
    }
}
