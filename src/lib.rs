//! Dose-response analysis: replicate statistics, four-parameter logistic
//! fits and drug sensitivity scores for batches of drug screening curves.

pub mod analysis;
pub mod color;
pub mod config;
pub mod data;
pub mod error;
pub mod fit;
pub mod plot;
pub mod report;
pub mod scores;
pub mod stats;

pub use analysis::{BatchReport, CurveInput, CurveResult, analyze_curve, run_batch};
pub use config::AnalysisConfig;
pub use data::filter::{CurveKey, Selection};
pub use data::loader::load_file;
pub use data::model::Dataset;
pub use error::{DoseError, DoseResult};
