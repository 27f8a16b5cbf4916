use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use arrow::array::{
    Array, AsArray, Float32Array, Float64Array, Int32Array, Int64Array, StringArray,
};
use arrow::datatypes::DataType;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::Value as JsonValue;

use super::model::{
    Dataset, Label, Measurement, METADATA_COLUMNS, MIN_COLUMNS, RESPONSE_PREFIX,
};
use crate::error::DoseError;

// ---------------------------------------------------------------------------
// Public entry-point
// ---------------------------------------------------------------------------

/// Load a measurement table from a file.  Dispatch by extension.
///
/// Supported formats:
/// * `.tsv` / `.txt` / `.tab` – tab-separated table (the canonical layout)
/// * `.csv`                   – the same table, comma-separated
/// * `.json`                  – `[{ "Experiment": 1, "Cell_line": "MOLM13", ... }, ...]`
/// * `.parquet`               – four metadata columns followed by numeric replicates
pub fn load_file(path: &Path) -> Result<Dataset> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let dataset = match ext.as_str() {
        "tsv" | "txt" | "tab" => {
            let file = std::fs::File::open(path).context("opening TSV file")?;
            parse_table(file, b'\t')
        }
        "csv" => {
            let file = std::fs::File::open(path).context("opening CSV file")?;
            parse_table(file, b',')
        }
        "parquet" | "pq" => load_parquet(path),
        "json" => load_json(path),
        other => Err(DoseError::UnsupportedFormat(format!(".{other}")).into()),
    }
    .with_context(|| format!("loading {}", path.display()))?;

    log::info!(
        "Loaded {} rows ({} replicate columns) from {}",
        dataset.len(),
        dataset.replicate_count,
        path.display()
    );
    Ok(dataset)
}

// ---------------------------------------------------------------------------
// Delimited text loader
// ---------------------------------------------------------------------------

/// Parse a delimited measurement table.
///
/// Columns are positional: `Experiment`, `Cell_line`, `Drug_Name`,
/// `Drug_Concentration`, then one or more `Response_Rep{n}`.  Header names
/// that differ from these are accepted with a warning.  Any row narrower
/// than five fields is rejected.
pub fn parse_table<R: Read>(reader: R, delimiter: u8) -> Result<Dataset> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut records = reader.records();

    let header_record = match records.next() {
        Some(result) => result.context("reading header row")?,
        None => bail!(DoseError::malformed(1, "empty input, expected a header row")),
    };
    let header: Vec<String> = header_record.iter().map(|h| h.to_string()).collect();
    let header_line = line_of(&header_record);
    check_header(&header, header_line)?;

    let mut rows = Vec::new();
    for result in records {
        let record = result.context("reading table row")?;
        let line = line_of(&record);
        let fields: Vec<&str> = record.iter().collect();
        if fields.iter().all(|f| f.is_empty()) {
            continue;
        }
        rows.push(parse_row(&fields, header.len(), line)?);
    }

    Ok(Dataset::from_rows(header, rows))
}

fn line_of(record: &csv::StringRecord) -> usize {
    record
        .position()
        .map(|p| p.line() as usize)
        .unwrap_or_default()
}

fn check_header(header: &[String], line: usize) -> Result<()> {
    if header.len() < MIN_COLUMNS {
        bail!(DoseError::malformed(
            line,
            format!(
                "header has {} columns, expected {} metadata columns and at least one {RESPONSE_PREFIX}{{n}}",
                header.len(),
                METADATA_COLUMNS.len()
            ),
        ));
    }
    for (found, expected) in header.iter().zip(METADATA_COLUMNS.iter()) {
        if !found.eq_ignore_ascii_case(expected) {
            log::warn!("Header column '{found}' read as '{expected}'");
        }
    }
    for (i, found) in header[METADATA_COLUMNS.len()..].iter().enumerate() {
        let expected = format!("{RESPONSE_PREFIX}{}", i + 1);
        if !found.eq_ignore_ascii_case(&expected) {
            log::warn!("Header column '{found}' read as '{expected}'");
        }
    }
    Ok(())
}

fn parse_row(fields: &[&str], width: usize, line: usize) -> Result<Measurement> {
    if fields.len() < MIN_COLUMNS {
        bail!(DoseError::malformed(
            line,
            format!("expected at least {MIN_COLUMNS} columns, found {}", fields.len()),
        ));
    }
    if fields.len() > width {
        bail!(DoseError::malformed(
            line,
            format!("row has {} columns but the header has {width}", fields.len()),
        ));
    }

    let concentration = parse_concentration(fields[3], line)?;
    let mut responses = Vec::with_capacity(width - METADATA_COLUMNS.len());
    for (j, cell) in fields[METADATA_COLUMNS.len()..].iter().enumerate() {
        responses.push(parse_response(cell).ok_or_else(|| {
            DoseError::malformed(
                line,
                format!("{RESPONSE_PREFIX}{}: '{cell}' is not a number", j + 1),
            )
        })?);
    }
    // Short rows only miss trailing replicates.
    responses.resize(width - METADATA_COLUMNS.len(), f64::NAN);

    Ok(Measurement {
        experiment: Label::parse(fields[0]),
        cell_line: fields[1].to_string(),
        drug_name: fields[2].to_string(),
        concentration,
        responses,
    })
}

fn parse_concentration(cell: &str, line: usize) -> Result<f64> {
    match cell.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => bail!(DoseError::malformed(
            line,
            format!("Drug_Concentration '{cell}' is not a finite number"),
        )),
    }
}

/// `None` for unparseable or infinite values; missing markers become `NaN`.
fn parse_response(cell: &str) -> Option<f64> {
    let s = cell.trim();
    if s.is_empty() || matches!(s.to_ascii_lowercase().as_str(), "na" | "nan" | "null") {
        return Some(f64::NAN);
    }
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}

// ---------------------------------------------------------------------------
// JSON loader
// ---------------------------------------------------------------------------

/// Expected JSON schema (records-oriented, `df.to_json(orient='records')`):
///
/// ```json
/// [
///   {
///     "Experiment": 1,
///     "Cell_line": "MOLM13",
///     "Drug_Name": "Sorafenib",
///     "Drug_Concentration": 10000,
///     "Response_Rep1": 90,
///     "Response_Rep2": 88.5
///   },
///   ...
/// ]
/// ```
fn load_json(path: &Path) -> Result<Dataset> {
    let text = std::fs::read_to_string(path).context("reading JSON file")?;
    parse_json(&text)
}

/// Parse records-oriented JSON.  Replicate keys are ordered by their number,
/// so `Response_Rep10` follows `Response_Rep9`.
pub fn parse_json(text: &str) -> Result<Dataset> {
    let root: JsonValue = serde_json::from_str(text).context("parsing JSON")?;
    let records = root
        .as_array()
        .context("Expected top-level JSON array")?;

    // First pass: replicate width across all records.
    let mut width = 0usize;
    for rec in records {
        if let Some(obj) = rec.as_object() {
            for key in obj.keys() {
                if let Some(n) = replicate_number(key) {
                    width = width.max(n);
                }
            }
        }
    }

    let mut rows = Vec::with_capacity(records.len());
    for (i, rec) in records.iter().enumerate() {
        let line = i + 1;
        let obj = rec
            .as_object()
            .ok_or_else(|| DoseError::malformed(line, "record is not a JSON object"))?;

        let field = |name: &str| {
            obj.get(name)
                .ok_or_else(|| DoseError::malformed(line, format!("missing '{name}'")))
        };

        let experiment = json_to_label(field(METADATA_COLUMNS[0])?);
        let cell_line = json_to_label(field(METADATA_COLUMNS[1])?).to_string();
        let drug_name = json_to_label(field(METADATA_COLUMNS[2])?).to_string();
        let concentration = json_to_f64(field(METADATA_COLUMNS[3])?)
            .filter(|v| v.is_finite())
            .ok_or_else(|| {
                DoseError::malformed(line, "Drug_Concentration is not a finite number")
            })?;

        let mut by_number: BTreeMap<usize, f64> = BTreeMap::new();
        for (key, val) in obj {
            if let Some(n) = replicate_number(key) {
                let v = json_to_f64(val).ok_or_else(|| {
                    DoseError::malformed(line, format!("{key}: not a number"))
                })?;
                by_number.insert(n, v);
            }
        }
        if by_number.is_empty() {
            bail!(DoseError::malformed(
                line,
                format!("no {RESPONSE_PREFIX}{{n}} field"),
            ));
        }
        let responses = (1..=width)
            .map(|n| by_number.get(&n).copied().unwrap_or(f64::NAN))
            .collect();

        rows.push(Measurement {
            experiment,
            cell_line,
            drug_name,
            concentration,
            responses,
        });
    }

    let header = METADATA_COLUMNS
        .iter()
        .map(|s| s.to_string())
        .chain((1..=width).map(|n| format!("{RESPONSE_PREFIX}{n}")))
        .collect();
    Ok(Dataset::from_rows(header, rows))
}

fn replicate_number(key: &str) -> Option<usize> {
    key.strip_prefix(RESPONSE_PREFIX)?
        .parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
}

fn json_to_label(val: &JsonValue) -> Label {
    match val {
        JsonValue::String(s) => Label::parse(s),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Label::Integer(i),
            None => Label::Text(n.to_string()),
        },
        other => Label::Text(other.to_string()),
    }
}

/// Numbers and numeric strings; `null` is a missing value.
fn json_to_f64(val: &JsonValue) -> Option<f64> {
    match val {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::Null => Some(f64::NAN),
        JsonValue::String(s) => parse_response(s),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Parquet loader
// ---------------------------------------------------------------------------

/// Load a Parquet file holding the measurement table.
///
/// Expected schema (positional, like the text layout):
/// - columns 0..2: identifiers (strings or integers)
/// - column 3: concentration (Float64 / Float32 / Int64 / Int32)
/// - columns 4..: replicate responses, nullable numeric
///
/// Works with files written by both **Pandas** (`df.to_parquet()`) and
/// **Polars** (`df.write_parquet()`).
fn load_parquet(path: &Path) -> Result<Dataset> {
    let file = std::fs::File::open(path).context("opening parquet file")?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .context("reading parquet metadata")?;
    let header: Vec<String> = builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    check_header(&header, 1)?;
    let reader = builder.build().context("building parquet reader")?;

    let mut rows = Vec::new();
    let mut offset = 0usize;

    for batch_result in reader {
        let batch = batch_result.context("reading parquet record batch")?;
        for row in 0..batch.num_rows() {
            // Data rows are numbered after the header, as in the text format.
            let line = offset + row + 2;
            let experiment = extract_label(batch.column(0), row);
            let cell_line = extract_label(batch.column(1), row).to_string();
            let drug_name = extract_label(batch.column(2), row).to_string();
            let concentration = extract_f64(batch.column(3), row)
                .with_context(|| format!("Row {row}: failed to read concentration"))?;
            if !concentration.is_finite() {
                bail!(DoseError::malformed(
                    line,
                    "Drug_Concentration is missing or not finite"
                ));
            }

            let responses = (METADATA_COLUMNS.len()..batch.num_columns())
                .map(|c| {
                    let value = extract_f64(batch.column(c), row)
                        .with_context(|| format!("Row {row}: failed to read column {c}"))?;
                    if value.is_infinite() {
                        bail!(DoseError::malformed(
                            line,
                            format!("{RESPONSE_PREFIX}{}: value is not finite", c - METADATA_COLUMNS.len() + 1),
                        ));
                    }
                    Ok(value)
                })
                .collect::<Result<Vec<f64>>>()?;

            rows.push(Measurement {
                experiment,
                cell_line,
                drug_name,
                concentration,
                responses,
            });
        }
        offset += batch.num_rows();
    }

    Ok(Dataset::from_rows(header, rows))
}

// -- Parquet / Arrow helpers --

/// Extract a numeric cell as `f64`; nulls become `NaN`.
fn extract_f64(col: &Arc<dyn Array>, row: usize) -> Result<f64> {
    if col.is_null(row) {
        return Ok(f64::NAN);
    }
    let any = col.as_any();
    let value = match col.data_type() {
        DataType::Float64 => any.downcast_ref::<Float64Array>().map(|a| a.value(row)),
        DataType::Float32 => any
            .downcast_ref::<Float32Array>()
            .map(|a| a.value(row) as f64),
        DataType::Int64 => any.downcast_ref::<Int64Array>().map(|a| a.value(row) as f64),
        DataType::Int32 => any.downcast_ref::<Int32Array>().map(|a| a.value(row) as f64),
        other => bail!("Expected a numeric column, got {other:?}"),
    };
    value.context("column type does not match its declared data type")
}

/// Extract an identifier cell from an Arrow column at a given row.
fn extract_label(col: &Arc<dyn Array>, row: usize) -> Label {
    if col.is_null(row) {
        return Label::Text(String::new());
    }
    let any = col.as_any();
    match col.data_type() {
        DataType::Utf8 => any
            .downcast_ref::<StringArray>()
            .map(|s| Label::parse(s.value(row)))
            .unwrap_or_else(|| Label::Text(String::new())),
        DataType::LargeUtf8 => Label::parse(col.as_string::<i64>().value(row)),
        DataType::Int32 => any
            .downcast_ref::<Int32Array>()
            .map(|a| Label::Integer(a.value(row) as i64))
            .unwrap_or_else(|| Label::Text(String::new())),
        DataType::Int64 => any
            .downcast_ref::<Int64Array>()
            .map(|a| Label::Integer(a.value(row)))
            .unwrap_or_else(|| Label::Text(String::new())),
        _ => match extract_f64(col, row) {
            Ok(v) => Label::Text(v.to_string()),
            Err(_) => Label::Text(format!("{:?}", col.data_type())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = "Experiment\tCell_line\tDrug_Name\tDrug_Concentration\tResponse_Rep1\tResponse_Rep2\n\
        1\tMOLM13\tSorafenib\t10000\t90\t91\n\
        1\tMOLM13\tSorafenib\t1000\t70\t72\n\
        1\tMOLM13\tAC220\t10\t20\t\n";

    fn malformed_line(err: &anyhow::Error) -> Option<usize> {
        err.chain().find_map(|e| match e.downcast_ref::<DoseError>() {
            Some(DoseError::Malformed { line, .. }) => Some(*line),
            _ => None,
        })
    }

    #[test]
    fn parses_rows_and_pads_missing_replicates() {
        let ds = parse_table(EXAMPLE.as_bytes(), b'\t').unwrap();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.replicate_count, 2);
        assert_eq!(ds.rows[0].experiment, Label::Integer(1));
        assert_eq!(ds.rows[0].drug_name, "Sorafenib");
        assert_eq!(ds.rows[0].concentration, 10000.0);
        assert_eq!(ds.rows[0].responses, vec![90.0, 91.0]);
        assert_eq!(ds.rows[2].responses[0], 20.0);
        assert!(ds.rows[2].responses[1].is_nan());
    }

    #[test]
    fn single_replicate_row_from_the_readme() {
        let text = "Experiment\tCell_line\tDrug_Name\tDrug_Concentration\tResponse_Rep1\n\
                    1\tMOLM13\tSorafenib\t10000\t90\n";
        let ds = parse_table(text.as_bytes(), b'\t').unwrap();
        assert_eq!(ds.len(), 1);
        assert_eq!(ds.rows[0].responses, vec![90.0]);
    }

    #[test]
    fn rejects_rows_with_fewer_than_five_columns() {
        let text = "Experiment\tCell_line\tDrug_Name\tDrug_Concentration\tResponse_Rep1\n\
                    1\tMOLM13\tSorafenib\t10000\t90\n\
                    1\tMOLM13\tSorafenib\t1000\n";
        let err = parse_table(text.as_bytes(), b'\t').unwrap_err();
        assert_eq!(malformed_line(&err), Some(3));
    }

    #[test]
    fn rejects_header_without_response_column() {
        let text = "Experiment\tCell_line\tDrug_Name\tDrug_Concentration\n1\tA\tB\t10\n";
        let err = parse_table(text.as_bytes(), b'\t').unwrap_err();
        assert_eq!(malformed_line(&err), Some(1));
    }

    #[test]
    fn rejects_non_numeric_cells() {
        let text = "Experiment,Cell_line,Drug_Name,Drug_Concentration,Response_Rep1\n\
                    1,MOLM13,Sorafenib,ten,90\n";
        let err = parse_table(text.as_bytes(), b',').unwrap_err();
        assert_eq!(malformed_line(&err), Some(2));

        let text = "Experiment,Cell_line,Drug_Name,Drug_Concentration,Response_Rep1\n\
                    1,MOLM13,Sorafenib,10,high\n";
        let err = parse_table(text.as_bytes(), b',').unwrap_err();
        assert_eq!(malformed_line(&err), Some(2));
    }

    #[test]
    fn missing_markers_are_nan() {
        assert!(parse_response("NA").unwrap().is_nan());
        assert!(parse_response("").unwrap().is_nan());
        assert_eq!(parse_response(" 12.5 "), Some(12.5));
        assert_eq!(parse_response("abc"), None);
    }

    #[test]
    fn infinite_responses_are_rejected() {
        assert_eq!(parse_response("inf"), None);
        assert_eq!(parse_response("-Infinity"), None);

        let text = "Experiment\tCell_line\tDrug_Name\tDrug_Concentration\tResponse_Rep1\tResponse_Rep2\n\
                    1\tMOLM13\tSorafenib\t10\t90\t91\n\
                    1\tMOLM13\tSorafenib\t100\t80\tinf\n";
        let err = parse_table(text.as_bytes(), b'\t').unwrap_err();
        assert_eq!(malformed_line(&err), Some(3));
        assert!(format!("{err:#}").contains("Response_Rep2"));
    }

    #[test]
    fn json_orders_replicates_by_number() {
        let text = r#"[
            {"Experiment": 1, "Cell_line": "MOLM13", "Drug_Name": "AC220",
             "Drug_Concentration": 100, "Response_Rep2": 40, "Response_Rep1": 42},
            {"Experiment": "2", "Cell_line": "MOLM13", "Drug_Name": "AC220",
             "Drug_Concentration": 10, "Response_Rep1": null}
        ]"#;
        let ds = parse_json(text).unwrap();
        assert_eq!(ds.replicate_count, 2);
        assert_eq!(ds.rows[0].responses, vec![42.0, 40.0]);
        assert_eq!(ds.rows[1].experiment, Label::Integer(2));
        assert!(ds.rows[1].responses.iter().all(|v| v.is_nan()));
        assert_eq!(ds.header[5], "Response_Rep2");
    }

    #[test]
    fn json_record_without_replicates_is_malformed() {
        let text = r#"[{"Experiment": 1, "Cell_line": "A", "Drug_Name": "B", "Drug_Concentration": 1}]"#;
        let err = parse_json(text).unwrap_err();
        assert_eq!(malformed_line(&err), Some(1));
    }
}
