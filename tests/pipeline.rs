use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;

use rusty_dose::analysis::summarize_dataset;
use rusty_dose::data::model::{ConcentrationUnit, Label};
use rusty_dose::report::{replicates_table, results_table, write_table};
use rusty_dose::{AnalysisConfig, Selection, load_file, run_batch};

fn fixture() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/example.tsv")
}

fn nanomolar() -> AnalysisConfig {
    AnalysisConfig {
        concentration_unit: ConcentrationUnit::Nanomolar,
        ..AnalysisConfig::default()
    }
}

#[test]
fn example_table_round_trips() {
    let text = std::fs::read_to_string(fixture()).unwrap();
    let data_lines = text.lines().skip(1).filter(|l| !l.trim().is_empty()).count();

    let dataset = load_file(&fixture()).unwrap();
    assert_eq!(dataset.len(), data_lines);
    assert_eq!(dataset.replicate_count, 3);

    let first = &dataset.rows[0];
    assert_eq!(first.experiment, Label::Integer(1));
    assert_eq!(first.cell_line, "MOLM13");
    assert_eq!(first.drug_name, "Sorafenib");
    assert_eq!(first.concentration, 10.0);
    assert_eq!(first.responses, vec![98.0, 97.0, 99.0]);

    // Missing marker in the third replicate of experiment 2.
    let with_gap = &dataset.rows[11];
    assert!(with_gap.responses[2].is_nan());
    assert_eq!(with_gap.observed_replicates(), 2);
}

#[test]
fn every_row_with_two_replicates_gets_a_sem() {
    let dataset = load_file(&fixture()).unwrap();
    let config = AnalysisConfig {
        remove_outliers: false,
        ..nanomolar()
    };
    let summaries = summarize_dataset(&dataset, &config);
    assert_eq!(summaries.len(), dataset.len());
    for (row, summary) in dataset.rows.iter().zip(&summaries) {
        assert!(row.observed_replicates() >= 2);
        assert!(summary.sem.is_some());
    }
    // Viability 98 / 97 / 99 becomes inhibition 2 / 3 / 1.
    assert!((summaries[0].mean - 2.0).abs() < 1e-9);
}

#[test]
fn three_replicates_never_lose_a_value_to_the_iqr_fence() {
    let dataset = load_file(&fixture()).unwrap();
    let summaries = summarize_dataset(&dataset, &nanomolar());
    // Experiment 2 / Sorafenib / 5000 nM has viability 22, 19 and 60.
    let odd = &summaries[13];
    assert_eq!(odd.outliers_replaced, 0);
    assert!((odd.mean - (78.0 + 81.0 + 40.0) / 3.0).abs() < 1e-9);
}

#[test]
fn outlier_removal_replaces_the_odd_replicate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("four.tsv");
    std::fs::write(
        &path,
        "Experiment\tCell_line\tDrug_Name\tDrug_Concentration\tResponse_Rep1\tResponse_Rep2\tResponse_Rep3\tResponse_Rep4\n\
         1\tMOLM13\tSorafenib\t5000\t22\t19\t21\t60\n",
    )
    .unwrap();
    let dataset = load_file(&path).unwrap();

    let kept = summarize_dataset(
        &dataset,
        &AnalysisConfig {
            remove_outliers: false,
            ..nanomolar()
        },
    );
    assert_eq!(kept[0].outliers_replaced, 0);
    assert!((kept[0].mean - 69.5).abs() < 1e-9);

    let cleaned = summarize_dataset(&dataset, &nanomolar());
    assert!(cleaned[0].outliers_replaced >= 1);
    assert!(cleaned[0].mean > 77.0 && cleaned[0].mean < 82.0);
    assert!(cleaned[0].sem.unwrap() < kept[0].sem.unwrap());
}

#[test]
fn batch_analysis_of_the_example_table() {
    let dataset = load_file(&fixture()).unwrap();
    let report = run_batch(&dataset, &nanomolar(), &Selection::default());
    assert!(report.skipped.is_empty());

    let keys: Vec<String> = report
        .results
        .iter()
        .map(|r| format!("{}/{}", r.key.experiment, r.key.drug_name))
        .collect();
    assert_eq!(keys, vec!["1/Sorafenib", "1/AC220", "2/Sorafenib"]);

    for r in &report.results {
        assert!(r.ic50 >= 10.0 && r.ic50 <= 10000.0, "{}: {}", r.key, r.ic50);
        assert!(r.ic_interpolated >= 10.0 && r.ic_interpolated <= 10000.0);
        let dss2 = r.dss2.unwrap();
        assert!((0.0..=50.0).contains(&dss2));
    }
    // AC220 is the more potent of the two drugs in experiment 1.
    assert!(report.results[1].ic50 < report.results[0].ic50);
}

#[test]
fn results_are_written_in_every_format() {
    let dataset = load_file(&fixture()).unwrap();
    let config = AnalysisConfig {
        report_quality_scores: true,
        ..nanomolar()
    };
    let report = run_batch(&dataset, &config, &Selection::default());
    let table = results_table(&report.results, true);
    assert_eq!(table.headers.len(), 32);

    let dir = tempfile::tempdir().unwrap();
    for name in ["results.tsv", "results.csv", "results.json", "results.parquet"] {
        let path = dir.path().join(name);
        write_table(&path, &table).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0, "{name}");
    }

    let tsv = std::fs::read_to_string(dir.path().join("results.tsv")).unwrap();
    assert_eq!(tsv.lines().count(), 1 + report.results.len());
    assert!(tsv.starts_with("Experiment\tCell line\tDrug name\tIC50\t"));

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("results.json")).unwrap())
            .unwrap();
    assert_eq!(json.as_array().unwrap().len(), 3);
    assert_eq!(json[0]["Drug name"], "Sorafenib");
    assert_eq!(json[0]["Concentration unit"], "Nanomolar");
}

#[test]
fn replicate_summary_can_be_reloaded_as_a_table() {
    let dataset = load_file(&fixture()).unwrap();
    let table = replicates_table(&dataset, &summarize_dataset(&dataset, &nanomolar()));
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("replicates.tsv");
    write_table(&path, &table).unwrap();

    let reloaded = load_file(&path).unwrap();
    assert_eq!(reloaded.len(), dataset.len());
    assert_eq!(reloaded.replicate_count, 3);
}

#[test]
fn parquet_input_is_read_positionally() {
    let schema = Arc::new(Schema::new(vec![
        Field::new("Experiment", DataType::Int64, false),
        Field::new("Cell_line", DataType::Utf8, false),
        Field::new("Drug_Name", DataType::Utf8, false),
        Field::new("Drug_Concentration", DataType::Float64, false),
        Field::new("Response_Rep1", DataType::Float64, true),
        Field::new("Response_Rep2", DataType::Float64, true),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from(vec![1, 1])),
            Arc::new(StringArray::from(vec!["MOLM13", "MOLM13"])),
            Arc::new(StringArray::from(vec!["Sorafenib", "Sorafenib"])),
            Arc::new(Float64Array::from(vec![10.0, 10000.0])),
            Arc::new(Float64Array::from(vec![Some(98.0), Some(90.0)])),
            Arc::new(Float64Array::from(vec![Some(97.0), None])),
        ],
    )
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("input.parquet");
    let file = std::fs::File::create(&path).unwrap();
    let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();

    let dataset = load_file(&path).unwrap();
    assert_eq!(dataset.len(), 2);
    assert_eq!(dataset.rows[1].concentration, 10000.0);
    assert_eq!(dataset.rows[1].responses[0], 90.0);
    assert!(dataset.rows[1].responses[1].is_nan());
}
