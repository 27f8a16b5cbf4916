use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Canonical header of a measurement table, replicate columns excluded.
pub const METADATA_COLUMNS: [&str; 4] = [
    "Experiment",
    "Cell_line",
    "Drug_Name",
    "Drug_Concentration",
];

/// Prefix of the replicate columns: `Response_Rep1`, `Response_Rep2`, …
pub const RESPONSE_PREFIX: &str = "Response_Rep";

/// Smallest valid row: four metadata fields and one response.
pub const MIN_COLUMNS: usize = METADATA_COLUMNS.len() + 1;

// ---------------------------------------------------------------------------
// Label – an identifier cell (experiment ids are numbers or names)
// ---------------------------------------------------------------------------

/// An identifier value that keeps integers and free text apart so that
/// experiment `2` sorts before experiment `10`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Label {
    Integer(i64),
    Text(String),
}

impl PartialOrd for Label {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Label {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self, other) {
            (Label::Integer(a), Label::Integer(b)) => a.cmp(b),
            (Label::Text(a), Label::Text(b)) => a.cmp(b),
            (Label::Integer(_), Label::Text(_)) => Ordering::Less,
            (Label::Text(_), Label::Integer(_)) => Ordering::Greater,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Integer(i) => write!(f, "{i}"),
            Label::Text(s) => write!(f, "{s}"),
        }
    }
}

impl Label {
    /// Interpret a raw cell: integers stay numeric, anything else is text.
    pub fn parse(raw: &str) -> Self {
        let s = raw.trim();
        match s.parse::<i64>() {
            Ok(i) => Label::Integer(i),
            Err(_) => Label::Text(s.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Measurement – one row of the input table
// ---------------------------------------------------------------------------

/// A single measurement row: one drug concentration on one cell line in one
/// experiment, with one value per replicate (`NaN` when missing).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub experiment: Label,
    pub cell_line: String,
    pub drug_name: String,
    /// In the unit chosen by [`ConcentrationUnit`], not molar.
    pub concentration: f64,
    pub responses: Vec<f64>,
}

impl Measurement {
    /// Number of replicates actually measured.
    pub fn observed_replicates(&self) -> usize {
        self.responses.iter().filter(|v| !v.is_nan()).count()
    }
}

// ---------------------------------------------------------------------------
// Dataset – the complete loaded table
// ---------------------------------------------------------------------------

/// The full parsed table with pre-computed identifier sets.
#[derive(Debug, Clone)]
pub struct Dataset {
    /// All rows, in file order.
    pub rows: Vec<Measurement>,
    /// Header as found in the file (positional, not necessarily canonical).
    pub header: Vec<String>,
    /// Width of the replicate block; every row is padded to it.
    pub replicate_count: usize,
    pub experiments: BTreeSet<Label>,
    pub cell_lines: BTreeSet<String>,
    pub drugs: BTreeSet<String>,
}

impl Dataset {
    /// Build identifier indices from the loaded rows.
    pub fn from_rows(header: Vec<String>, rows: Vec<Measurement>) -> Self {
        let replicate_count = header.len().saturating_sub(METADATA_COLUMNS.len());
        let mut experiments = BTreeSet::new();
        let mut cell_lines = BTreeSet::new();
        let mut drugs = BTreeSet::new();

        for row in &rows {
            experiments.insert(row.experiment.clone());
            cell_lines.insert(row.cell_line.clone());
            drugs.insert(row.drug_name.clone());
        }

        Dataset {
            rows,
            header,
            replicate_count,
            experiments,
            cell_lines,
            drugs,
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the dataset is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row-major replicate matrix, one `Vec` per row.
    pub fn response_matrix(&self) -> Vec<Vec<f64>> {
        self.rows.iter().map(|r| r.responses.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Measurement conventions
// ---------------------------------------------------------------------------

/// What the replicate columns measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResponseKind {
    /// Fraction of cells alive; converted to inhibition as `100 - v`.
    #[default]
    Viability,
    Inhibition,
}

/// How the replicate values are expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResponseScale {
    #[default]
    Percentage,
    Ratio,
}

/// Unit of `Drug_Concentration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConcentrationUnit {
    Molar,
    Millimolar,
    #[default]
    Micromolar,
    Nanomolar,
    Picomolar,
}

impl ConcentrationUnit {
    /// Factor converting a concentration in this unit to molar.
    pub fn to_molar(self) -> f64 {
        match self {
            ConcentrationUnit::Molar => 1.0,
            ConcentrationUnit::Millimolar => 1e-3,
            ConcentrationUnit::Micromolar => 1e-6,
            ConcentrationUnit::Nanomolar => 1e-9,
            ConcentrationUnit::Picomolar => 1e-12,
        }
    }
}

impl fmt::Display for ConcentrationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConcentrationUnit::Molar => "Molar",
            ConcentrationUnit::Millimolar => "Millimolar",
            ConcentrationUnit::Micromolar => "Micromolar",
            ConcentrationUnit::Nanomolar => "Nanomolar",
            ConcentrationUnit::Picomolar => "Picomolar",
        };
        f.write_str(name)
    }
}

impl FromStr for ConcentrationUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The short SI forms are case sensitive (mM vs M), long names are not.
        match s.trim() {
            "M" => return Ok(ConcentrationUnit::Molar),
            "mM" => return Ok(ConcentrationUnit::Millimolar),
            "uM" | "µM" | "μM" => return Ok(ConcentrationUnit::Micromolar),
            "nM" => return Ok(ConcentrationUnit::Nanomolar),
            "pM" => return Ok(ConcentrationUnit::Picomolar),
            _ => {}
        }
        match s.trim().to_ascii_lowercase().as_str() {
            "molar" => Ok(ConcentrationUnit::Molar),
            "millimolar" => Ok(ConcentrationUnit::Millimolar),
            "micromolar" => Ok(ConcentrationUnit::Micromolar),
            "nanomolar" => Ok(ConcentrationUnit::Nanomolar),
            "picomolar" => Ok(ConcentrationUnit::Picomolar),
            other => Err(format!("unknown concentration unit: {other}")),
        }
    }
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseKind::Viability => f.write_str("Viability"),
            ResponseKind::Inhibition => f.write_str("Inhibition"),
        }
    }
}

impl FromStr for ResponseKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "viability" => Ok(ResponseKind::Viability),
            "inhibition" => Ok(ResponseKind::Inhibition),
            other => Err(format!("unknown response kind: {other}")),
        }
    }
}

impl fmt::Display for ResponseScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseScale::Percentage => f.write_str("Percentage"),
            ResponseScale::Ratio => f.write_str("Ratio"),
        }
    }
}

impl FromStr for ResponseScale {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "percentage" | "percent" | "%" => Ok(ResponseScale::Percentage),
            "ratio" => Ok(ResponseScale::Ratio),
            other => Err(format!("unknown response scale: {other}")),
        }
    }
}
