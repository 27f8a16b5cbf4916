use serde::{Deserialize, Serialize};

use std::ops::RangeInclusive;
use std::path::Path;

use crate::data::model::{ConcentrationUnit, ResponseKind, ResponseScale};
use crate::error::{DoseError, DoseResult};

pub const BASELINE_RANGE: RangeInclusive<f64> = 0.0..=25.0;
pub const INTEGRATION_LIMIT_RANGE: RangeInclusive<f64> = 0.1..=2.0;

/// Settings of one analysis run.  Loaded from JSON; missing keys take
/// their defaults, command-line flags override afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub response: ResponseKind,
    pub response_scale: ResponseScale,
    pub concentration_unit: ConcentrationUnit,
    pub remove_outliers: bool,
    /// Inhibition level (percent) AUC and DSS are measured from.
    pub baseline: f64,
    /// Width of the Xepto50 window, log10 molar.
    pub integration_limit: f64,
    pub report_quality_scores: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            response: ResponseKind::default(),
            response_scale: ResponseScale::default(),
            concentration_unit: ConcentrationUnit::default(),
            remove_outliers: true,
            baseline: 10.0,
            integration_limit: 1.0,
            report_quality_scores: false,
        }
    }
}

impl AnalysisConfig {
    pub fn load(path: Option<&Path>) -> DoseResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let data = std::fs::read_to_string(path).map_err(|e| {
            DoseError::invalid_config(format!("failed to read config {}: {e}", path.display()))
        })?;
        let config: AnalysisConfig = serde_json::from_str(&data).map_err(|e| {
            DoseError::invalid_config(format!("failed to parse config {}: {e}", path.display()))
        })?;
        log::info!("Loaded analysis config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> DoseResult<()> {
        if !BASELINE_RANGE.contains(&self.baseline) {
            return Err(DoseError::invalid_config(format!(
                "baseline must be within {}..={}, got {}",
                BASELINE_RANGE.start(),
                BASELINE_RANGE.end(),
                self.baseline
            )));
        }
        if !INTEGRATION_LIMIT_RANGE.contains(&self.integration_limit) {
            return Err(DoseError::invalid_config(format!(
                "integration_limit must be within {}..={}, got {}",
                INTEGRATION_LIMIT_RANGE.start(),
                INTEGRATION_LIMIT_RANGE.end(),
                self.integration_limit
            )));
        }
        Ok(())
    }
}
