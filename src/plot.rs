//! Dose-response plots rendered as standalone SVG documents.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};

use crate::analysis::CurveResult;
use crate::color::ColorMap;
use crate::data::filter::CurveKey;
use crate::stats::{nan_max, nan_min};

const WIDTH: f64 = 720.0;
const HEIGHT: f64 = 480.0;
const MARGIN_LEFT: f64 = 70.0;
const MARGIN_RIGHT: f64 = 20.0;
const MARGIN_TOP: f64 = 50.0;
const MARGIN_BOTTOM: f64 = 60.0;
/// Fine-grid points skipped between polyline vertices.
const CURVE_STRIDE: usize = 20;

const INTERPOLATED_COLOR: &str = "#2ca02c";
const IC50_COLOR: &str = "#1f3fbf";
const IC50_LABEL_COLOR: &str = "#7b2d8e";

// ---------------------------------------------------------------------------
// Axes
// ---------------------------------------------------------------------------

/// Vertical extent: always covers 0-100 % inhibition, widened by 2 points
/// beyond the lowest / highest experimental or fitted value.
pub fn y_range(plot_min: f64, plot_max: f64) -> (f64, f64) {
    ((plot_min - 2.0).min(0.0), (plot_max + 2.0).max(100.0))
}

/// Round tick positions (1, 2 or 5 × 10^k apart) covering `[lo, hi]`.
fn nice_ticks(lo: f64, hi: f64, target: usize) -> Vec<f64> {
    let span = hi - lo;
    if !span.is_finite() || span <= 0.0 {
        return vec![lo];
    }
    let raw = span / target.max(1) as f64;
    let magnitude = 10f64.powf(raw.log10().floor());
    let step = [1.0, 2.0, 5.0, 10.0]
        .iter()
        .map(|m| m * magnitude)
        .find(|s| *s >= raw)
        .unwrap_or(10.0 * magnitude);
    let first = (lo / step).ceil() as i64;
    let last = (hi / step).floor() as i64;
    (first..=last)
        .map(|k| (k as f64 * step * 1e6).round() / 1e6)
        .collect()
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Maps data coordinates onto the drawing area.
struct Frame {
    x_lo: f64,
    x_hi: f64,
    y_lo: f64,
    y_hi: f64,
}

impl Frame {
    fn px(&self, x: f64) -> f64 {
        MARGIN_LEFT + (x - self.x_lo) / (self.x_hi - self.x_lo) * (WIDTH - MARGIN_LEFT - MARGIN_RIGHT)
    }

    fn py(&self, y: f64) -> f64 {
        HEIGHT - MARGIN_BOTTOM - (y - self.y_lo) / (self.y_hi - self.y_lo) * (HEIGHT - MARGIN_TOP - MARGIN_BOTTOM)
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

pub fn plot_title(key: &CurveKey) -> String {
    format!(
        "Curve for Exp: {} Cell line: {} Drug: {}",
        key.experiment, key.cell_line, key.drug_name
    )
}

/// Render one fitted curve: data with SEM error bars, the fitted logistic,
/// and dashed markers at the interpolated dose and the IC50.
pub fn render_svg(result: &CurveResult, color: &str) -> String {
    let trace = &result.trace;
    let (y_lo, y_hi) = y_range(trace.plot_min, trace.plot_max);
    let x_min = nan_min(&trace.fine_x);
    let x_max = nan_max(&trace.fine_x);
    let pad = if x_max > x_min { (x_max - x_min) * 0.05 } else { 0.5 };
    let frame = Frame {
        x_lo: x_min - pad,
        x_hi: x_max + pad,
        y_lo,
        y_hi,
    };

    let mut svg = String::new();
    let _ = writeln!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{WIDTH}" height="{HEIGHT}" viewBox="0 0 {WIDTH} {HEIGHT}" font-family="sans-serif" font-size="12">"#
    );
    let _ = writeln!(svg, r#"<rect width="100%" height="100%" fill="white"/>"#);

    // Axes and ticks
    let (left, right) = (frame.px(frame.x_lo), frame.px(frame.x_hi));
    let (top, bottom) = (frame.py(frame.y_hi), frame.py(frame.y_lo));
    let _ = writeln!(
        svg,
        r#"<rect x="{left:.1}" y="{top:.1}" width="{:.1}" height="{:.1}" fill="none" stroke="black"/>"#,
        right - left,
        bottom - top
    );
    for t in nice_ticks(frame.x_lo, frame.x_hi, 6) {
        let x = frame.px(t);
        let _ = writeln!(
            svg,
            r#"<line x1="{x:.1}" y1="{bottom:.1}" x2="{x:.1}" y2="{:.1}" stroke="black"/><text x="{x:.1}" y="{:.1}" text-anchor="middle">{}</text>"#,
            bottom + 5.0,
            bottom + 18.0,
            t
        );
    }
    for t in nice_ticks(frame.y_lo, frame.y_hi, 6) {
        let y = frame.py(t);
        let _ = writeln!(
            svg,
            r#"<line x1="{:.1}" y1="{y:.1}" x2="{left:.1}" y2="{y:.1}" stroke="black"/><text x="{:.1}" y="{:.1}" text-anchor="end">{}</text>"#,
            left - 5.0,
            left - 8.0,
            y + 4.0,
            t
        );
    }
    let _ = writeln!(
        svg,
        r#"<text x="{:.1}" y="{:.1}" text-anchor="middle">Log10 Concentration (Molar)</text>"#,
        (left + right) / 2.0,
        HEIGHT - 15.0
    );
    let _ = writeln!(
        svg,
        r#"<text x="18" y="{:.1}" text-anchor="middle" transform="rotate(-90 18 {:.1})">Inhibition %</text>"#,
        (top + bottom) / 2.0,
        (top + bottom) / 2.0
    );
    let _ = writeln!(
        svg,
        r#"<text x="{:.1}" y="28" text-anchor="middle" font-size="14">{}</text>"#,
        WIDTH / 2.0,
        escape(&plot_title(&result.key))
    );

    // Fitted curve
    let mut points: Vec<String> = trace
        .fine_x
        .iter()
        .zip(&trace.fine_y)
        .step_by(CURVE_STRIDE)
        .map(|(&x, &y)| format!("{:.2},{:.2}", frame.px(x), frame.py(y)))
        .collect();
    if let (Some(&x), Some(&y)) = (trace.fine_x.last(), trace.fine_y.last()) {
        points.push(format!("{:.2},{:.2}", frame.px(x), frame.py(y)));
    }
    let _ = writeln!(
        svg,
        r#"<polyline points="{}" fill="none" stroke="{color}" stroke-width="2"/>"#,
        points.join(" ")
    );

    // Data points
    for (i, (&x, &y)) in trace.log10_dose.iter().zip(&trace.inhibition).enumerate() {
        let (cx, cy) = (frame.px(x), frame.py(y));
        if let Some(sem) = trace.sem.as_ref().and_then(|s| s.get(i).copied().flatten()) {
            let (y1, y2) = (frame.py(y - sem), frame.py(y + sem));
            let _ = writeln!(
                svg,
                r#"<line x1="{cx:.2}" y1="{y1:.2}" x2="{cx:.2}" y2="{y2:.2}" stroke="{color}"/>"#
            );
        }
        let _ = writeln!(
            svg,
            r#"<circle cx="{cx:.2}" cy="{cy:.2}" r="4" fill="{color}" stroke="black" stroke-width="0.5"/>"#
        );
    }

    // Markers
    let interp_x = frame.px(trace.log10_interpolated);
    let ic50_x = frame.px(trace.log10_ic50);
    for (x, stroke) in [(interp_x, INTERPOLATED_COLOR), (ic50_x, IC50_COLOR)] {
        if x.is_finite() {
            let _ = writeln!(
                svg,
                r#"<line x1="{x:.2}" y1="{top:.1}" x2="{x:.2}" y2="{bottom:.1}" stroke="{stroke}" stroke-dasharray="6 4"/>"#
            );
        }
    }
    let annotations = [
        (
            interp_x,
            frame.py(y_lo + 45.0),
            INTERPOLATED_COLOR,
            format!(
                "Interp@ {}% = {:.3}",
                result.ic_interpolated_at, result.ic_interpolated
            ),
        ),
        (
            ic50_x,
            frame.py(y_lo + 1.0),
            IC50_LABEL_COLOR,
            format!("IC50 = {:.3}", result.ic50),
        ),
    ];
    for (x, y, fill, text) in annotations {
        if x.is_finite() {
            let _ = writeln!(
                svg,
                r#"<text x="{:.2}" y="{y:.2}" fill="{fill}" transform="rotate(-90 {:.2} {y:.2})">{}</text>"#,
                x - 4.0,
                x - 4.0,
                escape(&text)
            );
        }
    }

    // Legend
    let legend = [
        (color, "Actual Data".to_string()),
        (color, "Fitted Logistic Curve".to_string()),
        (
            INTERPOLATED_COLOR,
            format!("Interpolated at {}%", result.ic_interpolated_at),
        ),
        (IC50_COLOR, "IC50".to_string()),
    ];
    for (i, (swatch, label)) in legend.iter().enumerate() {
        let y = top + 16.0 + 16.0 * i as f64;
        let _ = writeln!(
            svg,
            r#"<rect x="{:.1}" y="{:.1}" width="10" height="10" fill="{swatch}"/><text x="{:.1}" y="{y:.1}">{}</text>"#,
            left + 10.0,
            y - 9.0,
            left + 26.0,
            escape(label)
        );
    }

    svg.push_str("</svg>\n");
    svg
}

/// File name for a curve, with anything outside `[A-Za-z0-9._-]` replaced.
pub fn plot_file_name(key: &CurveKey) -> String {
    let raw = format!("{}_{}_{}", key.experiment, key.cell_line, key.drug_name);
    let safe: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{safe}.svg")
}

/// Append `_2`, `_3`, ... to the stem until the name is unused.
///
/// Names are compared case-insensitively so distinct curves stay distinct
/// on case-folding filesystems too.
fn unique_file_name(name: String, taken: &mut HashSet<String>) -> String {
    if taken.insert(name.to_ascii_lowercase()) {
        return name;
    }
    let stem = name.strip_suffix(".svg").unwrap_or(&name);
    let mut n = 2;
    loop {
        let candidate = format!("{stem}_{n}.svg");
        if taken.insert(candidate.to_ascii_lowercase()) {
            return candidate;
        }
        n += 1;
    }
}

/// Write one SVG per result into `dir`, colouring curves by drug.
///
/// Keys that sanitize to the same file name get a numeric suffix, so every
/// result ends up in its own file.
pub fn write_plots(dir: &Path, results: &[CurveResult]) -> Result<usize> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create plot directory {}", dir.display()))?;
    let colors = ColorMap::new(results.iter().map(|r| r.key.drug_name.as_str()));
    let mut taken = HashSet::new();

    for result in results {
        let name = unique_file_name(plot_file_name(&result.key), &mut taken);
        let path = dir.join(name);
        let svg = render_svg(result, colors.color_for(&result.key.drug_name));
        std::fs::write(&path, svg).with_context(|| format!("Failed to write {}", path.display()))?;
        log::debug!("Wrote plot {}", path.display());
    }
    log::info!("Wrote {} plot(s) to {}", results.len(), dir.display());
    Ok(results.len())
}
