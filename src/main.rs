use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};

use rusty_dose::analysis::{run_batch, summarize_dataset};
use rusty_dose::data::filter::{filtered_indices, group_curves};
use rusty_dose::data::model::{ConcentrationUnit, ResponseKind, ResponseScale};
use rusty_dose::report::{replicates_table, results_table, summary_table, write_delimited, write_table};
use rusty_dose::{AnalysisConfig, DoseError, Selection, load_file, plot};

#[derive(Parser)]
#[command(name = "rusty-dose", version)]
#[command(about = "Dose-response curve fitting: IC50, AUC, DSS and Xepto50 scores")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit every curve and report scores.
    Analyze {
        #[arg(value_name = "INPUT")]
        input: PathBuf,
        #[command(flatten)]
        response: ResponseArgs,
        /// Inhibition baseline for AUC and DSS, 0-25.
        #[arg(long, value_name = "N")]
        baseline: Option<f64>,
        /// Xepto50 integration window in log10 units, 0.1-2.
        #[arg(long, value_name = "L")]
        integration_limit: Option<f64>,
        #[arg(long)]
        quality_scores: bool,
        #[arg(long, value_name = "ID")]
        experiment: Vec<String>,
        #[arg(long, value_name = "NAME")]
        cell_line: Vec<String>,
        #[arg(long, value_name = "NAME")]
        drug: Vec<String>,
        /// Results file (.tsv, .csv, .json or .parquet).
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
        /// Directory for one SVG plot per curve.
        #[arg(long, value_name = "DIR")]
        plots: Option<PathBuf>,
    },
    /// Parse an input file and print what it contains.
    Validate {
        #[arg(value_name = "INPUT")]
        input: PathBuf,
    },
    /// Per-row mean inhibition and SEM across replicates.
    Replicates {
        #[arg(value_name = "INPUT")]
        input: PathBuf,
        #[command(flatten)]
        response: ResponseArgs,
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

/// Settings shared by every command that reads responses.
#[derive(Args)]
struct ResponseArgs {
    /// JSON analysis config; flags below override it.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// viability or inhibition
    #[arg(long, value_name = "KIND")]
    response: Option<ResponseKind>,
    /// percentage or ratio
    #[arg(long, value_name = "SCALE")]
    scale: Option<ResponseScale>,
    /// Concentration unit: M, mM, uM, nM, pM or the full name.
    #[arg(long, value_name = "UNIT")]
    unit: Option<ConcentrationUnit>,
    /// Keep replicate outliers instead of replacing them.
    #[arg(long)]
    keep_outliers: bool,
}

impl ResponseArgs {
    fn load_config(&self) -> Result<AnalysisConfig> {
        let mut config = AnalysisConfig::load(self.config.as_deref())?;
        if let Some(kind) = self.response {
            config.response = kind;
        }
        if let Some(scale) = self.scale {
            config.response_scale = scale;
        }
        if let Some(unit) = self.unit {
            config.concentration_unit = unit;
        }
        if self.keep_outliers {
            config.remove_outliers = false;
        }
        Ok(config)
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|e| e.downcast_ref::<DoseError>())
        .map(DoseError::exit_code)
        .unwrap_or(1)
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(err) = run(cli.command) {
        eprintln!("error: {err:#}");
        process::exit(exit_code(&err));
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Analyze {
            input,
            response,
            baseline,
            integration_limit,
            quality_scores,
            experiment,
            cell_line,
            drug,
            output,
            plots,
        } => {
            let mut config = response.load_config()?;
            if let Some(b) = baseline {
                config.baseline = b;
            }
            if let Some(l) = integration_limit {
                config.integration_limit = l;
            }
            if quality_scores {
                config.report_quality_scores = true;
            }
            config.validate()?;

            let dataset = load_file(&input)?;
            let selection = Selection::from_raw(&experiment, &cell_line, &drug);
            let report = run_batch(&dataset, &config, &selection);
            if report.results.is_empty() && report.skipped.is_empty() {
                log::warn!("No rows match the selection");
            }

            println!("{}", summary_table(&report));
            if let Some(path) = output {
                write_table(&path, &results_table(&report.results, config.report_quality_scores))?;
            }
            if let Some(dir) = plots {
                plot::write_plots(&dir, &report.results)?;
            }
        }
        Commands::Validate { input } => {
            let dataset = load_file(&input)?;
            let all = filtered_indices(&dataset, &Selection::default());
            let groups = group_curves(&dataset, &all);
            println!("{}", input.display());
            println!("  rows:        {}", dataset.len());
            println!("  replicates:  {}", dataset.replicate_count);
            println!("  experiments: {}", dataset.experiments.len());
            println!("  cell lines:  {}", dataset.cell_lines.len());
            println!("  drugs:       {}", dataset.drugs.len());
            println!("  curves:      {}", groups.len());
        }
        Commands::Replicates {
            input,
            response,
            output,
        } => {
            let config = response.load_config()?;
            config.validate()?;
            let dataset = load_file(&input)?;
            let table = replicates_table(&dataset, &summarize_dataset(&dataset, &config));
            match output {
                Some(path) => write_table(&path, &table)?,
                None => write_delimited(std::io::stdout().lock(), &table, b'\t')
                    .context("Failed to write to stdout")?,
            }
        }
    }
    Ok(())
}
