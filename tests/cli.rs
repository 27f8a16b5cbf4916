use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn fixture() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/example.tsv")
}

fn rusty_dose(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_rusty-dose"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("binary runs")
}

#[test]
fn validate_prints_a_summary() {
    let out = rusty_dose(&["validate", fixture().to_str().unwrap()]);
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("rows:        15"));
    assert!(stdout.contains("curves:      3"));
}

#[test]
fn analyze_writes_results_and_plots() {
    let dir = tempfile::tempdir().unwrap();
    let results = dir.path().join("results.json");
    let plots = dir.path().join("plots");
    let out = rusty_dose(&[
        "analyze",
        fixture().to_str().unwrap(),
        "--unit",
        "nM",
        "--quality-scores",
        "-o",
        results.to_str().unwrap(),
        "--plots",
        plots.to_str().unwrap(),
    ]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Sorafenib"));
    assert!(stdout.contains("AC220"));

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&results).unwrap()).unwrap();
    assert_eq!(json.as_array().unwrap().len(), 3);
    assert!(json[0].get("R2").is_some());
    assert_eq!(std::fs::read_dir(&plots).unwrap().count(), 3);
}

#[test]
fn drug_selection_limits_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let results = dir.path().join("results.tsv");
    let out = rusty_dose(&[
        "analyze",
        fixture().to_str().unwrap(),
        "--drug",
        "AC220",
        "-o",
        results.to_str().unwrap(),
    ]);
    assert!(out.status.success());
    let tsv = std::fs::read_to_string(&results).unwrap();
    assert_eq!(tsv.lines().count(), 2);
    assert!(tsv.lines().nth(1).unwrap().starts_with("1\tMOLM13\tAC220\t"));
}

#[test]
fn replicates_streams_tsv_to_stdout() {
    let out = rusty_dose(&["replicates", fixture().to_str().unwrap(), "--keep-outliers"]);
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    let mut lines = stdout.lines();
    assert_eq!(
        lines.next().unwrap(),
        "Experiment\tCell_line\tDrug_Name\tDrug_Concentration\tInhibition_Mean\tInhibition_SEM\tOutliers_Replaced"
    );
    assert_eq!(lines.count(), 15);
}

#[test]
fn malformed_input_exits_with_code_3() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("short.tsv");
    std::fs::write(
        &path,
        "Experiment\tCell_line\tDrug_Name\tDrug_Concentration\tResponse_Rep1\n\
         1\tMOLM13\tSorafenib\t10000\t90\n\
         1\tMOLM13\tSorafenib\t1000\n",
    )
    .unwrap();
    let out = rusty_dose(&["validate", path.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&out.stderr).contains("line 3"));
}

#[test]
fn invalid_configuration_exits_with_code_2() {
    let out = rusty_dose(&["analyze", fixture().to_str().unwrap(), "--baseline", "40"]);
    assert_eq!(out.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&out.stderr).contains("baseline"));
}

#[test]
fn unsupported_extension_exits_with_code_3() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.xlsx");
    std::fs::write(&path, "not a table").unwrap();
    let out = rusty_dose(&["validate", path.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(3));
}

#[test]
fn generated_sample_validates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sample.tsv");
    let generator = Command::new(env!("CARGO_BIN_EXE_generate_sample"))
        .arg(&path)
        .output()
        .expect("generator runs");
    assert!(generator.status.success());

    let out = rusty_dose(&["validate", path.to_str().unwrap()]);
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    // 2 experiments x 2 cell lines x 3 drugs x 7 doses
    assert!(stdout.contains("rows:        84"));
    assert!(stdout.contains("curves:      12"));
}
