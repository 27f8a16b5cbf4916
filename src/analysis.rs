//! Per-curve analysis and the batch driver.
//!
//! ```text
//!   Dataset ──normalize──► inhibition % ──summarize──► mean / SEM per row
//!      │                                                   │
//!      └──filter + group──► CurveGroup ──────► CurveInput ◄┘
//!                                                  │ prepare
//!                                                  ▼
//!                              initial_fit ─► refine_fit ─► CurveResult
//! ```

use rayon::prelude::*;
use serde::Serialize;

use crate::config::AnalysisConfig;
use crate::data::filter::{CurveKey, Selection, filtered_indices, group_curves};
use crate::data::model::{ConcentrationUnit, Dataset};
use crate::error::{DoseError, DoseResult};
use crate::fit::{FourPl, InitialFit, RefinedFit, initial_fit, refine_fit};
use crate::scores::{
    DssInput, DssKind, QualityScores, auc_aac, dss, quality_scores, round_to, xepto50,
};
use crate::stats::{ReplicateSummary, nan_max, nan_min, normalize, summarize_replicates};

/// Points in the dense grid used for interpolation and plotting.
pub const FINE_GRID_POINTS: usize = 10_000;
/// Fewest concentrations a 4PL fit is attempted on.
pub const MIN_POINTS: usize = 4;

// ---------------------------------------------------------------------------
// Input preparation
// ---------------------------------------------------------------------------

/// Raw per-curve data gathered from the summarized dataset.
#[derive(Debug, Clone)]
pub struct CurveInput {
    pub key: CurveKey,
    /// In the configured unit.
    pub concentrations: Vec<f64>,
    /// Mean inhibition, percent.
    pub inhibition: Vec<f64>,
    pub sem: Option<Vec<Option<f64>>>,
}

/// Sorted, validated curve data ready for fitting.
#[derive(Debug, Clone)]
pub struct PreparedCurve {
    pub concentrations: Vec<f64>,
    /// log10 molar.
    pub log10_dose: Vec<f64>,
    pub inhibition: Vec<f64>,
    pub sem: Option<Vec<Option<f64>>>,
}

impl CurveInput {
    pub fn prepare(&self, unit: ConcentrationUnit) -> DoseResult<PreparedCurve> {
        let group = self.key.to_string();

        let mut points: Vec<(f64, f64, Option<f64>)> = Vec::with_capacity(self.concentrations.len());
        let mut dropped = 0;
        for (i, (&c, &y)) in self.concentrations.iter().zip(&self.inhibition).enumerate() {
            if !c.is_finite() {
                return Err(DoseError::NonFiniteData {
                    group,
                    reason: format!("concentration {c} is not finite"),
                });
            }
            if c <= 0.0 {
                return Err(DoseError::NonPositiveConcentration { group, value: c });
            }
            if y.is_nan() {
                dropped += 1;
                continue;
            }
            let sem = self.sem.as_ref().and_then(|s| s.get(i).copied().flatten());
            points.push((c, y, sem));
        }
        if dropped > 0 {
            log::warn!("{group}: dropped {dropped} concentration(s) without any response");
        }

        if points.len() < MIN_POINTS {
            return Err(DoseError::TooFewPoints {
                group,
                found: points.len(),
                required: MIN_POINTS,
            });
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        if points.windows(2).all(|w| w[0].0 == w[1].0) {
            return Err(DoseError::NonFiniteData {
                group,
                reason: "all rows share one concentration".to_string(),
            });
        }

        let mut inhibition: Vec<f64> = points.iter().map(|p| p.1).collect();
        let duplicated = inhibition
            .iter()
            .enumerate()
            .any(|(i, v)| inhibition[..i].contains(v));
        if duplicated {
            // Ties in the response make the plateau logic ambiguous.
            for (i, v) in inhibition.iter_mut().enumerate() {
                *v += 0.01 * i as f64;
            }
        }

        let factor = unit.to_molar();
        Ok(PreparedCurve {
            concentrations: points.iter().map(|p| p.0).collect(),
            log10_dose: points.iter().map(|p| (p.0 * factor).log10()).collect(),
            inhibition,
            sem: self
                .sem
                .as_ref()
                .map(|_| points.iter().map(|p| p.2).collect()),
        })
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Extra descriptive columns reported with `report_quality_scores`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub min_concentration: f64,
    pub max_concentration: f64,
    pub n_concentrations: usize,
    pub unit: ConcentrationUnit,
    pub min_experimental_inhibition: f64,
    pub min_fitted_inhibition: f64,
    pub max_experimental_inhibition: f64,
    pub max_fitted_inhibition: f64,
    pub slope: f64,
    pub ic50_stderr: Option<f64>,
    pub ic50_std_residual: f64,
    pub scores: QualityScores,
}

/// Everything needed to draw a fitted curve.
#[derive(Debug, Clone)]
pub struct CurveTrace {
    pub params: FourPl,
    pub log10_dose: Vec<f64>,
    pub inhibition: Vec<f64>,
    pub sem: Option<Vec<Option<f64>>>,
    pub fine_x: Vec<f64>,
    pub fine_y: Vec<f64>,
    /// log10 molar of the interpolated dose.
    pub log10_interpolated: f64,
    /// log10 molar of the reported IC50.
    pub log10_ic50: f64,
    pub plot_min: f64,
    pub plot_max: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurveResult {
    pub key: CurveKey,
    pub ic50: f64,
    pub ic_interpolated: f64,
    pub ic_interpolated_at: f64,
    pub auc: f64,
    pub aac: f64,
    pub dss1: Option<f64>,
    pub dss2: Option<f64>,
    pub dss3: Option<f64>,
    pub xepto50: Option<f64>,
    pub quality: Option<QualityReport>,
    #[serde(skip)]
    pub trace: CurveTrace,
}

/// Curve that could not be analysed.
#[derive(Debug, Clone)]
pub struct SkippedCurve {
    pub key: CurveKey,
    pub error: DoseError,
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub results: Vec<CurveResult>,
    pub skipped: Vec<SkippedCurve>,
}

// ---------------------------------------------------------------------------
// Curve analysis
// ---------------------------------------------------------------------------

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n < 2 {
        return vec![start; n];
    }
    let step = (end - start) / (n - 1) as f64;
    (0..n)
        .map(|i| if i == n - 1 { end } else { start + step * i as f64 })
        .collect()
}

/// Index of the grid value closest to `target`; first one on ties.
fn nearest(values: &[f64], target: f64) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if (v - target).abs() < (values[best] - target).abs() {
            best = i;
        }
    }
    best
}

/// Grid position and response used as the interpolated IC50.
fn interpolate(fine_x: &[f64], fine_y: &[f64], min_inh: f64, max_inh: f64) -> (f64, f64) {
    let at = |i: usize| (fine_x[i], fine_y[i]);
    if min_inh <= 50.0 && 50.0 <= max_inh {
        at(nearest(fine_y, 50.0))
    } else if min_inh > 50.0 {
        let lowest = nan_min(fine_y);
        if lowest >= 50.0 {
            (fine_x[0], lowest)
        } else {
            at(nearest(fine_y, 50.0))
        }
    } else if max_inh < 50.0 {
        let highest = nan_max(fine_y);
        if highest < 50.0 {
            (fine_x[fine_x.len() - 1], highest)
        } else {
            at(nearest(fine_y, 50.0))
        }
    } else {
        at(nearest(fine_y, (min_inh + max_inh) * 0.5))
    }
}

/// Reported IC50 in the configured unit, after the activity overrides.
fn reported_ic50(curve: &PreparedCurve, params: &FourPl, to_molar: f64) -> f64 {
    let min_conc = nan_min(&curve.concentrations);
    let max_conc = nan_max(&curve.concentrations);
    let min_exp = nan_min(&curve.inhibition);
    let max_exp = nan_max(&curve.inhibition);

    let mut ic50 = 10f64.powf(params.log10_ic50) / to_molar;
    if params.slope < 0.0 {
        ic50 = max_conc;
    }
    if params.bottom > 90.0 {
        ic50 = min_conc;
    }
    if min_exp.max(max_exp) < 10.0 {
        ic50 = max_conc;
    }
    if min_exp > 50.0 {
        ic50 = min_conc;
    }
    ic50
}

/// Fit one curve and derive every score.
pub fn analyze_curve(input: &CurveInput, config: &AnalysisConfig) -> DoseResult<CurveResult> {
    let unit = config.concentration_unit;
    let to_molar = unit.to_molar();
    let curve = input.prepare(unit)?;
    let x = &curve.log10_dose;
    let y = &curve.inhibition;

    let initial: InitialFit = initial_fit(x, y);
    let refined: RefinedFit = refine_fit(x, y, &initial);
    let params = refined.params;
    log::debug!(
        "{}: slope {:.3}, bottom {:.2}, top {:.2}, log10 IC50 {:.3}",
        input.key,
        params.slope,
        params.bottom,
        params.top,
        params.log10_ic50
    );

    let min_x = nan_min(x);
    let max_x = nan_max(x);
    let fine_x = linspace(min_x, max_x, FINE_GRID_POINTS);
    let fine_y: Vec<f64> = fine_x.iter().map(|&xi| params.eval(xi)).collect();
    let fitted: Vec<f64> = x.iter().map(|&xi| params.eval(xi)).collect();

    let min_inh = initial.bottom.min(params.bottom).max(0.0);
    let max_inh = initial.top.max(params.top).min(100.0);

    let (log10_interpolated, response_at) = interpolate(&fine_x, &fine_y, min_inh, max_inh);
    let ic_interpolated = round_to(10f64.powf(log10_interpolated) / to_molar, 2);
    let ic_interpolated_at = round_to(response_at, 1);

    let ic50 = reported_ic50(&curve, &params, to_molar);

    let (auc, aac) = auc_aac(&params, config.baseline, max_inh, min_x, max_x);
    let xepto = xepto50(
        &params,
        log10_interpolated,
        config.baseline,
        max_inh,
        config.integration_limit,
    );

    let min_conc = nan_min(&curve.concentrations);
    let max_conc = nan_max(&curve.concentrations);
    let dss_input = DssInput {
        ic50,
        slope: params.slope,
        top: params.top,
        min_concentration: min_conc,
        max_concentration: max_conc,
        baseline: config.baseline,
        to_molar,
    };

    let min_exp = nan_min(y);
    let max_exp = nan_max(y);
    let quality = config.report_quality_scores.then(|| QualityReport {
        min_concentration: min_conc,
        max_concentration: max_conc,
        n_concentrations: curve.concentrations.len(),
        unit,
        min_experimental_inhibition: round_to(min_exp, 2),
        min_fitted_inhibition: round_to(params.bottom, 2),
        max_experimental_inhibition: round_to(max_exp, 2),
        max_fitted_inhibition: round_to(params.top, 2),
        slope: round_to(params.slope, 2),
        ic50_stderr: refined.ic50_stderr.map(|e| round_to(e, 3)),
        ic50_std_residual: round_to(refined.residual_std, 3),
        scores: quality_scores(y, &fitted),
    });

    Ok(CurveResult {
        key: input.key.clone(),
        ic50: round_to(ic50, 3),
        ic_interpolated,
        ic_interpolated_at,
        auc,
        aac,
        dss1: dss(&dss_input, DssKind::Dss1),
        dss2: dss(&dss_input, DssKind::Dss2),
        dss3: dss(&dss_input, DssKind::Dss3),
        xepto50: xepto,
        quality,
        trace: CurveTrace {
            params,
            log10_dose: curve.log10_dose.clone(),
            inhibition: curve.inhibition.clone(),
            sem: curve.sem.clone(),
            fine_x,
            fine_y,
            log10_interpolated,
            log10_ic50: (ic50 * to_molar).log10(),
            plot_min: min_exp.min(params.bottom),
            plot_max: max_exp.max(params.top),
        },
    })
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// Normalize the dataset to percent inhibition and collapse replicates.
pub fn summarize_dataset(dataset: &Dataset, config: &AnalysisConfig) -> Vec<ReplicateSummary> {
    let mut matrix = dataset.response_matrix();
    normalize(&mut matrix, config.response, config.response_scale);
    summarize_replicates(&matrix, config.remove_outliers)
}

/// Analyse every selected curve of `dataset` in parallel.
///
/// Results keep the grouping order; failing curves are logged and listed
/// in [`BatchReport::skipped`] instead of aborting the batch.
pub fn run_batch(dataset: &Dataset, config: &AnalysisConfig, selection: &Selection) -> BatchReport {
    let summaries = summarize_dataset(dataset, config);
    let replaced: usize = summaries.iter().map(|s| s.outliers_replaced).sum();
    if replaced > 0 {
        log::info!("Replaced {replaced} outlying replicate value(s) with row means");
    }

    let indices = filtered_indices(dataset, selection);
    if !selection.is_empty() {
        log::info!("Selection keeps {} of {} rows", indices.len(), dataset.len());
    }
    let groups = group_curves(dataset, &indices);
    log::info!("Analysing {} curve(s)", groups.len());

    let with_sem = dataset.replicate_count >= 2;
    let outcomes: Vec<(CurveKey, DoseResult<CurveResult>)> = groups
        .par_iter()
        .map(|group| {
            let input = CurveInput {
                key: group.key.clone(),
                concentrations: group.rows.iter().map(|&i| dataset.rows[i].concentration).collect(),
                inhibition: group.rows.iter().map(|&i| summaries[i].mean).collect(),
                sem: with_sem.then(|| group.rows.iter().map(|&i| summaries[i].sem).collect()),
            };
            (group.key.clone(), analyze_curve(&input, config))
        })
        .collect();

    let mut report = BatchReport::default();
    for (key, outcome) in outcomes {
        match outcome {
            Ok(result) => report.results.push(result),
            Err(error) => {
                log::warn!("Skipping curve: {error}");
                report.skipped.push(SkippedCurve { key, error });
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::{Label, Measurement};

    fn key(drug: &str) -> CurveKey {
        CurveKey {
            experiment: Label::Integer(1),
            cell_line: "MOLM13".to_string(),
            drug_name: drug.to_string(),
        }
    }

    /// Half-log dilution series in µM, 1 nM .. 10 µM.
    fn concentrations() -> Vec<f64> {
        (0..9).map(|i| 10f64.powf(-3.0 + 0.5 * i as f64)).collect()
    }

    fn input_from(truth: &FourPl, drug: &str) -> CurveInput {
        let noise = [0.6, -0.8, 0.4, -0.3, 0.9, -0.7, 0.2, -0.5, 0.5];
        let conc = concentrations();
        let inhibition = conc
            .iter()
            .zip(noise)
            .map(|(c, e)| truth.eval((c * 1e-6).log10()) + e)
            .collect();
        CurveInput {
            key: key(drug),
            concentrations: conc,
            inhibition,
            sem: None,
        }
    }

    #[test]
    fn prepare_sorts_and_breaks_ties() {
        let input = CurveInput {
            key: key("A"),
            concentrations: vec![100.0, 1.0, 10.0, 1000.0],
            inhibition: vec![50.0, 5.0, 50.0, 90.0],
            sem: Some(vec![Some(1.0), Some(2.0), None, Some(4.0)]),
        };
        let curve = input.prepare(ConcentrationUnit::Nanomolar).unwrap();
        assert_eq!(curve.concentrations, vec![1.0, 10.0, 100.0, 1000.0]);
        assert!((curve.log10_dose[0] + 9.0).abs() < 1e-12);
        let expected = [5.0, 50.01, 50.02, 90.03];
        for (got, want) in curve.inhibition.iter().zip(expected) {
            assert!((got - want).abs() < 1e-9);
        }
        assert_eq!(curve.sem.unwrap(), vec![Some(2.0), None, Some(1.0), Some(4.0)]);
    }

    #[test]
    fn prepare_rejects_bad_curves() {
        let mut input = CurveInput {
            key: key("A"),
            concentrations: vec![1.0, 10.0, 100.0],
            inhibition: vec![5.0, 40.0, 90.0],
            sem: None,
        };
        assert!(matches!(
            input.prepare(ConcentrationUnit::Micromolar),
            Err(DoseError::TooFewPoints { found: 3, .. })
        ));

        input.concentrations = vec![0.0, 1.0, 10.0, 100.0];
        input.inhibition = vec![1.0, 5.0, 40.0, 90.0];
        assert!(matches!(
            input.prepare(ConcentrationUnit::Micromolar),
            Err(DoseError::NonPositiveConcentration { .. })
        ));

        input.concentrations = vec![1.0, 10.0, 100.0, 1000.0];
        input.inhibition = vec![f64::NAN, 5.0, 40.0, 90.0];
        assert!(matches!(
            input.prepare(ConcentrationUnit::Micromolar),
            Err(DoseError::TooFewPoints { found: 3, .. })
        ));
    }

    #[test]
    fn sigmoid_yields_consistent_scores() {
        let truth = FourPl {
            slope: 1.0,
            bottom: 2.0,
            top: 95.0,
            log10_ic50: -6.5,
        };
        let result = analyze_curve(&input_from(&truth, "A"), &AnalysisConfig::default()).unwrap();
        // 10^-6.5 M = 0.316 µM
        assert!((result.ic50 - 0.316).abs() < 0.05, "ic50 {}", result.ic50);
        assert!((result.ic_interpolated - 0.33).abs() < 0.08);
        assert!((result.ic_interpolated_at - 50.0).abs() <= 0.5);
        assert!(result.auc > 0.0);
        assert!(result.aac > 0.0);
        let dss1 = result.dss1.unwrap();
        assert!(dss1 > 0.0 && dss1 <= 100.0);
        assert!(result.xepto50.unwrap() > 0.0);
        assert!(result.quality.is_none());
        assert_eq!(result.trace.fine_x.len(), FINE_GRID_POINTS);
    }

    #[test]
    fn inactive_drug_reports_highest_concentration() {
        let input = CurveInput {
            key: key("inactive"),
            concentrations: concentrations(),
            inhibition: vec![1.0, 2.0, 0.5, 3.0, 1.5, 4.0, 2.5, 5.0, 6.0],
            sem: None,
        };
        let result = analyze_curve(&input, &AnalysisConfig::default()).unwrap();
        assert_eq!(result.ic50, 10.0);
        assert_eq!(result.dss1, Some(0.0));
    }

    #[test]
    fn fully_active_drug_reports_lowest_concentration() {
        let input = CurveInput {
            key: key("potent"),
            concentrations: concentrations(),
            inhibition: vec![60.0, 65.0, 70.0, 80.0, 88.0, 92.0, 95.0, 97.0, 98.0],
            sem: None,
        };
        let result = analyze_curve(&input, &AnalysisConfig::default()).unwrap();
        assert_eq!(result.ic50, 0.001);
    }

    #[test]
    fn quality_block_follows_config() {
        let truth = FourPl {
            slope: 1.2,
            bottom: 5.0,
            top: 90.0,
            log10_ic50: -7.0,
        };
        let config = AnalysisConfig {
            report_quality_scores: true,
            ..AnalysisConfig::default()
        };
        let result = analyze_curve(&input_from(&truth, "A"), &config).unwrap();
        let quality = result.quality.unwrap();
        assert_eq!(quality.n_concentrations, 9);
        assert_eq!(quality.unit, ConcentrationUnit::Micromolar);
        assert!(quality.scores.r2 > 0.99);
        assert!(quality.ic50_stderr.is_some());
    }

    #[test]
    fn interpolation_falls_back_to_grid_ends() {
        let x = linspace(-9.0, -5.0, 5);
        assert_eq!(x, vec![-9.0, -8.0, -7.0, -6.0, -5.0]);
        let high = vec![60.0, 70.0, 80.0, 85.0, 90.0];
        assert_eq!(interpolate(&x, &high, 60.0, 90.0), (-9.0, 60.0));
        let low = vec![1.0, 2.0, 5.0, 10.0, 20.0];
        assert_eq!(interpolate(&x, &low, 1.0, 20.0), (-5.0, 20.0));
        let mid = vec![10.0, 30.0, 49.0, 70.0, 90.0];
        assert_eq!(interpolate(&x, &mid, 10.0, 90.0), (-7.0, 49.0));
    }

    fn measurement(drug: &str, conc: f64, responses: Vec<f64>) -> Measurement {
        Measurement {
            experiment: Label::Integer(1),
            cell_line: "MOLM13".to_string(),
            drug_name: drug.to_string(),
            concentration: conc,
            responses,
        }
    }

    #[test]
    fn batch_keeps_order_and_collects_skipped_curves() {
        let header = ["Experiment", "Cell_line", "Drug_Name", "Drug_Concentration", "Response_Rep1", "Response_Rep2"]
            .map(String::from)
            .to_vec();
        let viability = [98.0, 95.0, 85.0, 60.0, 30.0, 12.0, 6.0];
        let mut rows = Vec::new();
        for (i, v) in viability.iter().enumerate() {
            let c = 10f64.powi(i as i32);
            rows.push(measurement("Sorafenib", c, vec![*v, v - 1.0]));
        }
        rows.push(measurement("AC220", 10.0, vec![90.0, 91.0]));
        rows.push(measurement("AC220", 100.0, vec![50.0, 52.0]));
        for (i, v) in viability.iter().enumerate() {
            rows.push(measurement("Cytarabine", 10f64.powi(i as i32), vec![*v, *v + 2.0]));
        }
        let dataset = Dataset::from_rows(header, rows);
        let config = AnalysisConfig {
            concentration_unit: ConcentrationUnit::Nanomolar,
            ..AnalysisConfig::default()
        };

        let report = run_batch(&dataset, &config, &Selection::default());
        let drugs: Vec<&str> = report.results.iter().map(|r| r.key.drug_name.as_str()).collect();
        assert_eq!(drugs, vec!["Sorafenib", "Cytarabine"]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].key.drug_name, "AC220");
        assert!(report.results[0].trace.sem.is_some());

        let only = Selection::from_raw(&[], &[], &["Cytarabine".to_string()]);
        let report = run_batch(&dataset, &config, &only);
        assert_eq!(report.results.len(), 1);
        assert!(report.skipped.is_empty());
    }
}
