/// Absolute tolerance of [`integrate`].
pub const TOLERANCE: f64 = 1e-10;
const MAX_DEPTH: u32 = 50;

/// Definite integral of `f` over `[a, b]` by adaptive Simpson quadrature.
/// Reversed limits flip the sign; equal limits give zero.
pub fn integrate<F: Fn(f64) -> f64>(f: F, a: f64, b: f64) -> f64 {
    if a == b || !a.is_finite() || !b.is_finite() {
        return 0.0;
    }
    if b < a {
        return -integrate(f, b, a);
    }
    let fa = f(a);
    let fb = f(b);
    let m = 0.5 * (a + b);
    let fm = f(m);
    let whole = simpson(a, b, fa, fm, fb);
    adapt(&f, a, b, fa, fm, fb, whole, TOLERANCE, MAX_DEPTH)
}

fn simpson(a: f64, b: f64, fa: f64, fm: f64, fb: f64) -> f64 {
    (b - a) / 6.0 * (fa + 4.0 * fm + fb)
}

#[allow(clippy::too_many_arguments)]
fn adapt<F: Fn(f64) -> f64>(
    f: &F,
    a: f64,
    b: f64,
    fa: f64,
    fm: f64,
    fb: f64,
    whole: f64,
    tol: f64,
    depth: u32,
) -> f64 {
    let m = 0.5 * (a + b);
    let lm = 0.5 * (a + m);
    let rm = 0.5 * (m + b);
    let flm = f(lm);
    let frm = f(rm);
    let left = simpson(a, m, fa, flm, fm);
    let right = simpson(m, b, fm, frm, fb);
    let delta = left + right - whole;
    if depth == 0 || delta.abs() <= 15.0 * tol {
        return left + right + delta / 15.0;
    }
    adapt(f, a, m, fa, flm, fm, left, tol / 2.0, depth - 1)
        + adapt(f, m, b, fm, frm, fb, right, tol / 2.0, depth - 1)
}
