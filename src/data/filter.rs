use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::Serialize;

use super::model::{Dataset, Label};

// ---------------------------------------------------------------------------
// Selection predicate: which identifiers take part in the analysis
// ---------------------------------------------------------------------------

/// Per-identifier selection.  An empty set means "no filter" for that level.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub experiments: BTreeSet<Label>,
    pub cell_lines: BTreeSet<String>,
    pub drugs: BTreeSet<String>,
}

impl Selection {
    /// Build a selection from raw command line values.
    pub fn from_raw(experiments: &[String], cell_lines: &[String], drugs: &[String]) -> Self {
        Selection {
            experiments: experiments.iter().map(|e| Label::parse(e)).collect(),
            cell_lines: cell_lines.iter().cloned().collect(),
            drugs: drugs.iter().cloned().collect(),
        }
    }

    /// True when no level is constrained.
    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty() && self.cell_lines.is_empty() && self.drugs.is_empty()
    }
}

/// Return indices of rows that pass every active constraint, in file order.
///
/// A row passes a level when the level's set is empty or contains the
/// row's identifier.
pub fn filtered_indices(dataset: &Dataset, selection: &Selection) -> Vec<usize> {
    dataset
        .rows
        .iter()
        .enumerate()
        .filter(|(_, row)| {
            (selection.experiments.is_empty() || selection.experiments.contains(&row.experiment))
                && (selection.cell_lines.is_empty()
                    || selection.cell_lines.contains(&row.cell_line))
                && (selection.drugs.is_empty() || selection.drugs.contains(&row.drug_name))
        })
        .map(|(i, _)| i)
        .collect()
}

// ---------------------------------------------------------------------------
// Grouping into curves
// ---------------------------------------------------------------------------

/// Identity of one dose-response curve.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CurveKey {
    pub experiment: Label,
    pub cell_line: String,
    pub drug_name: String,
}

impl fmt::Display for CurveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "experiment {} / {} / {}",
            self.experiment, self.cell_line, self.drug_name
        )
    }
}

/// Row indices belonging to one curve.
#[derive(Debug, Clone, PartialEq)]
pub struct CurveGroup {
    pub key: CurveKey,
    pub rows: Vec<usize>,
}

/// Group rows by experiment, then cell line, then drug.
///
/// Each level keeps the order in which its values first appear among
/// `indices`, so output follows the layout of the input file.  One pass
/// over the rows; groups are then ordered by the first appearance of their
/// experiment and of their cell line within it.
pub fn group_curves(dataset: &Dataset, indices: &[usize]) -> Vec<CurveGroup> {
    let mut experiment_rank: HashMap<&Label, usize> = HashMap::new();
    let mut line_rank: HashMap<(&Label, &str), usize> = HashMap::new();
    let mut slots: HashMap<(&Label, &str, &str), usize> = HashMap::new();
    let mut groups: Vec<((usize, usize), CurveGroup)> = Vec::new();

    for &i in indices {
        let row = &dataset.rows[i];
        let next = experiment_rank.len();
        let exp = *experiment_rank.entry(&row.experiment).or_insert(next);
        let next = line_rank.len();
        let line = *line_rank
            .entry((&row.experiment, row.cell_line.as_str()))
            .or_insert(next);
        let slot = *slots
            .entry((&row.experiment, row.cell_line.as_str(), row.drug_name.as_str()))
            .or_insert_with(|| {
                groups.push((
                    (exp, line),
                    CurveGroup {
                        key: CurveKey {
                            experiment: row.experiment.clone(),
                            cell_line: row.cell_line.clone(),
                            drug_name: row.drug_name.clone(),
                        },
                        rows: Vec::new(),
                    },
                ));
                groups.len() - 1
            });
        groups[slot].1.rows.push(i);
    }

    // Stable: drugs stay in first-appearance order within a cell line.
    groups.sort_by_key(|(rank, _)| *rank);
    groups.into_iter().map(|(_, group)| group).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::Measurement;

    fn dataset() -> Dataset {
        let row = |exp: &str, line: &str, drug: &str| Measurement {
            experiment: Label::parse(exp),
            cell_line: line.into(),
            drug_name: drug.into(),
            concentration: 1.0,
            responses: vec![50.0],
        };
        Dataset::from_rows(
            vec!["E".into(), "C".into(), "D".into(), "X".into(), "R".into()],
            vec![
                row("2", "MOLM13", "Sorafenib"),
                row("2", "MOLM13", "AC220"),
                row("1", "MV4-11", "AC220"),
                row("2", "MOLM13", "Sorafenib"),
                row("1", "MOLM13", "AC220"),
            ],
        )
    }

    #[test]
    fn empty_selection_keeps_everything() {
        let ds = dataset();
        assert_eq!(filtered_indices(&ds, &Selection::default()), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn selection_intersects_levels() {
        let ds = dataset();
        let sel = Selection::from_raw(&["2".into()], &[], &["Sorafenib".into()]);
        assert_eq!(filtered_indices(&ds, &sel), vec![0, 3]);
    }

    #[test]
    fn groups_follow_first_appearance() {
        let ds = dataset();
        let all: Vec<usize> = (0..ds.len()).collect();
        let groups = group_curves(&ds, &all);
        let keys: Vec<String> = groups
            .iter()
            .map(|g| format!("{}|{}|{}", g.key.experiment, g.key.cell_line, g.key.drug_name))
            .collect();
        assert_eq!(
            keys,
            vec![
                "2|MOLM13|Sorafenib",
                "2|MOLM13|AC220",
                "1|MV4-11|AC220",
                "1|MOLM13|AC220",
            ]
        );
        assert_eq!(groups[0].rows, vec![0, 3]);
    }

    #[test]
    fn interleaved_rows_are_collected_per_curve() {
        let ds = dataset();
        // A drug first seen after another cell line still sorts under its own.
        let groups = group_curves(&ds, &[2, 4, 1, 0, 3]);
        let keys: Vec<String> = groups
            .iter()
            .map(|g| format!("{}|{}|{}", g.key.experiment, g.key.cell_line, g.key.drug_name))
            .collect();
        assert_eq!(
            keys,
            vec![
                "1|MV4-11|AC220",
                "1|MOLM13|AC220",
                "2|MOLM13|AC220",
                "2|MOLM13|Sorafenib",
            ]
        );
        assert_eq!(groups[3].rows, vec![0, 3]);
        assert!(group_curves(&ds, &[]).is_empty());
    }
}
