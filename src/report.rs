//! Result and replicate tables, and the writers for every output format.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{ArrayRef, Float64Builder, Int64Builder, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::UTF8_FULL};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use serde::ser::{SerializeMap, SerializeSeq, Serializer};

use crate::analysis::{BatchReport, CurveResult};
use crate::data::model::{Dataset, Label, METADATA_COLUMNS};
use crate::error::DoseError;
use crate::stats::ReplicateSummary;

pub const RESULT_COLUMNS: [&str; 12] = [
    "Experiment",
    "Cell line",
    "Drug name",
    "IC50",
    "IC interpolated",
    "IC interpolated at",
    "AUC",
    "AAC",
    "DSS1",
    "DSS2",
    "DSS3",
    "Xepto50",
];

pub const QUALITY_COLUMNS: [&str; 20] = [
    "Minimum drug concentration",
    "Maximum drug concentration",
    "Number of concentration",
    "Concentration unit",
    "Minimum experimental inhibition",
    "Minimum fitted inhibition",
    "Maximum experimental inhibition",
    "Maximum fitted inhibition",
    "Slope",
    "IC50 std error",
    "IC50 std residual",
    "R2",
    "Adjusted R2",
    "RMSE",
    "Normality Test (p)",
    "Sy.x",
    "Explained variance",
    "Maximum residual error",
    "Mean absolute error",
    "Mean abs percentage error",
];

pub const REPLICATE_COLUMNS: [&str; 3] = ["Inhibition_Mean", "Inhibition_SEM", "Outliers_Replaced"];

// ---------------------------------------------------------------------------
// Tabular model shared by all writers
// ---------------------------------------------------------------------------

/// One cell of an output table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Entry {
    Text(String),
    Integer(i64),
    /// `None` and `NaN` are written as empty / null.
    Number(Option<f64>),
}

impl Entry {
    fn render(&self) -> String {
        match self {
            Entry::Text(s) => s.clone(),
            Entry::Integer(i) => i.to_string(),
            Entry::Number(Some(v)) if v.is_finite() => v.to_string(),
            Entry::Number(_) => String::new(),
        }
    }
}

impl From<&Label> for Entry {
    fn from(label: &Label) -> Self {
        match label {
            Label::Integer(i) => Entry::Integer(*i),
            Label::Text(s) => Entry::Text(s.clone()),
        }
    }
}

fn num(v: f64) -> Entry {
    Entry::Number(Some(v))
}

/// Column-labelled rows, ready to be written in any supported format.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Entry>>,
}

/// Serializes a row as a JSON object with keys in column order.
struct Record<'a> {
    headers: &'a [String],
    cells: &'a [Entry],
}

impl Serialize for Record<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.headers.len()))?;
        for (h, c) in self.headers.iter().zip(self.cells) {
            map.serialize_entry(h, c)?;
        }
        map.end()
    }
}

impl Serialize for OutputTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.rows.len()))?;
        for cells in &self.rows {
            seq.serialize_element(&Record {
                headers: &self.headers,
                cells,
            })?;
        }
        seq.end()
    }
}

// ---------------------------------------------------------------------------
// Building tables
// ---------------------------------------------------------------------------

pub fn results_table(results: &[CurveResult], with_quality: bool) -> OutputTable {
    let mut headers: Vec<String> = RESULT_COLUMNS.iter().map(|s| s.to_string()).collect();
    if with_quality {
        headers.extend(QUALITY_COLUMNS.iter().map(|s| s.to_string()));
    }

    let rows = results
        .iter()
        .map(|r| {
            let mut row = vec![
                Entry::from(&r.key.experiment),
                Entry::Text(r.key.cell_line.clone()),
                Entry::Text(r.key.drug_name.clone()),
                num(r.ic50),
                num(r.ic_interpolated),
                num(r.ic_interpolated_at),
                num(r.auc),
                num(r.aac),
                Entry::Number(r.dss1),
                Entry::Number(r.dss2),
                Entry::Number(r.dss3),
                Entry::Number(r.xepto50),
            ];
            if with_quality {
                match &r.quality {
                    Some(q) => row.extend([
                        num(q.min_concentration),
                        num(q.max_concentration),
                        Entry::Integer(q.n_concentrations as i64),
                        Entry::Text(q.unit.to_string()),
                        num(q.min_experimental_inhibition),
                        num(q.min_fitted_inhibition),
                        num(q.max_experimental_inhibition),
                        num(q.max_fitted_inhibition),
                        num(q.slope),
                        Entry::Number(q.ic50_stderr),
                        num(q.ic50_std_residual),
                        num(q.scores.r2),
                        Entry::Number(q.scores.adjusted_r2),
                        num(q.scores.rmse),
                        Entry::Number(q.scores.normality_p),
                        Entry::Number(q.scores.syx),
                        num(q.scores.explained_variance),
                        num(q.scores.max_error),
                        num(q.scores.root_mean_abs_error),
                        num(q.scores.mape),
                    ]),
                    None => row.extend(QUALITY_COLUMNS.iter().map(|_| Entry::Number(None))),
                }
            }
            row
        })
        .collect();

    OutputTable { headers, rows }
}

/// Row metadata followed by mean inhibition, SEM and outlier count.
pub fn replicates_table(dataset: &Dataset, summaries: &[ReplicateSummary]) -> OutputTable {
    let headers = METADATA_COLUMNS
        .iter()
        .chain(REPLICATE_COLUMNS.iter())
        .map(|s| s.to_string())
        .collect();
    let rows = dataset
        .rows
        .iter()
        .zip(summaries)
        .map(|(m, s)| {
            vec![
                Entry::from(&m.experiment),
                Entry::Text(m.cell_line.clone()),
                Entry::Text(m.drug_name.clone()),
                num(m.concentration),
                num(s.mean),
                Entry::Number(s.sem),
                Entry::Integer(s.outliers_replaced as i64),
            ]
        })
        .collect();
    OutputTable { headers, rows }
}

// ---------------------------------------------------------------------------
// Writers
// ---------------------------------------------------------------------------

/// Write `table` to `path`, choosing the format from the extension.
pub fn write_table(path: &Path, table: &OutputTable) -> Result<()> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    if !matches!(ext.as_str(), "tsv" | "txt" | "tab" | "csv" | "json" | "parquet" | "pq") {
        return Err(DoseError::UnsupportedFormat(format!("output extension '.{ext}'")).into());
    }

    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    match ext.as_str() {
        "csv" => write_delimited(BufWriter::new(file), table, b','),
        "json" => {
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, table).context("Failed to write JSON")?;
            writer.flush()?;
            Ok(())
        }
        "parquet" | "pq" => write_parquet(file, table),
        _ => write_delimited(BufWriter::new(file), table, b'\t'),
    }
    .with_context(|| format!("Failed to write {}", path.display()))?;

    log::info!("Wrote {} rows to {}", table.rows.len(), path.display());
    Ok(())
}

pub fn write_delimited<W: Write>(writer: W, table: &OutputTable, delimiter: u8) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(writer);
    wtr.write_record(&table.headers)?;
    for row in &table.rows {
        wtr.write_record(row.iter().map(Entry::render))?;
    }
    wtr.flush()?;
    Ok(())
}

/// Column type inferred from the entries; mixed columns fall back to text.
fn column_type(table: &OutputTable, col: usize) -> DataType {
    let mut integers = true;
    let mut numbers = true;
    for row in &table.rows {
        match &row[col] {
            Entry::Text(_) => return DataType::Utf8,
            Entry::Integer(_) => numbers = false,
            Entry::Number(_) => integers = false,
        }
    }
    match (integers, numbers) {
        (true, _) if !table.rows.is_empty() => DataType::Int64,
        (false, false) => DataType::Utf8,
        _ => DataType::Float64,
    }
}

fn write_parquet(file: File, table: &OutputTable) -> Result<()> {
    let mut fields = Vec::with_capacity(table.headers.len());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(table.headers.len());

    for (col, name) in table.headers.iter().enumerate() {
        let data_type = column_type(table, col);
        let array: ArrayRef = match data_type {
            DataType::Int64 => {
                let mut b = Int64Builder::new();
                for row in &table.rows {
                    match &row[col] {
                        Entry::Integer(i) => b.append_value(*i),
                        _ => b.append_null(),
                    }
                }
                Arc::new(b.finish())
            }
            DataType::Float64 => {
                let mut b = Float64Builder::new();
                for row in &table.rows {
                    match &row[col] {
                        Entry::Number(Some(v)) if v.is_finite() => b.append_value(*v),
                        _ => b.append_null(),
                    }
                }
                Arc::new(b.finish())
            }
            _ => {
                let mut b = StringBuilder::new();
                for row in &table.rows {
                    b.append_value(row[col].render());
                }
                Arc::new(b.finish())
            }
        };
        fields.push(Field::new(name, data_type, true));
        columns.push(array);
    }

    let schema = Arc::new(Schema::new(fields));
    let batch = RecordBatch::try_new(schema.clone(), columns).context("Failed to build record batch")?;
    let mut writer = ArrowWriter::try_new(file, schema, None).context("Failed to create Parquet writer")?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Terminal summary
// ---------------------------------------------------------------------------

fn fmt_opt(v: Option<f64>) -> String {
    match v {
        Some(v) if v.is_finite() => format!("{v:.2}"),
        _ => "-".to_string(),
    }
}

/// Human-readable table of the main scores plus one line per skipped curve.
pub fn summary_table(report: &BatchReport) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        "Experiment",
        "Cell line",
        "Drug",
        "IC50",
        "IC interp.",
        "AUC",
        "DSS2",
        "Xepto50",
    ]);

    for r in &report.results {
        table.add_row(vec![
            Cell::new(&r.key.experiment),
            Cell::new(&r.key.cell_line),
            Cell::new(&r.key.drug_name),
            Cell::new(format!("{:.3}", r.ic50)).set_alignment(CellAlignment::Right),
            Cell::new(format!("{:.2} @ {:.1}%", r.ic_interpolated, r.ic_interpolated_at))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!("{:.2}", r.auc)).set_alignment(CellAlignment::Right),
            Cell::new(fmt_opt(r.dss2)).set_alignment(CellAlignment::Right),
            Cell::new(fmt_opt(r.xepto50)).set_alignment(CellAlignment::Right),
        ]);
    }
    for s in &report.skipped {
        table.add_row(vec![
            Cell::new(&s.key.experiment),
            Cell::new(&s.key.cell_line),
            Cell::new(&s.key.drug_name),
            Cell::new(format!("skipped: {}", s.error)),
        ]);
    }
    table
}
