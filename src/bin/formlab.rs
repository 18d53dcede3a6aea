//! Formlab CLI - Command-line interface for Formlab
//!
//! Commands:
//! - train: Run the training pipeline over a directory of session files
//! - score: Score every rep of a session file against trained artifacts
//! - inspect: Check which artifacts exist, parse, and share a run id

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use formlab::artifacts::inspect_directory;
use formlab::ingest::Ingestor;
use formlab::types::{ArtifactStatus, RunReport, StageOutcome};
use formlab::{run_pipeline, PipelineConfig, PipelineError, RepScore, RepScorer};
use formlab::{FORMLAB_VERSION, PRODUCER_NAME};

/// Formlab - Benchmark and form-validity training for exercise repetitions
#[derive(Parser)]
#[command(name = "formlab")]
#[command(version = FORMLAB_VERSION)]
#[command(about = "Train and apply exercise form models", long_about = None)]
struct Cli {
    /// Log at debug level (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train benchmark and validity models from session files
    Train {
        /// Directory of session JSON files
        #[arg(short, long)]
        input: PathBuf,

        /// Directory for the produced artifacts
        #[arg(short, long)]
        output: PathBuf,

        /// JSON configuration file; flags override its values
        #[arg(long)]
        config: Option<PathBuf>,

        /// Smallest candidate cluster count
        #[arg(long)]
        k_min: Option<usize>,

        /// Largest candidate cluster count
        #[arg(long)]
        k_max: Option<usize>,

        /// Seed for k-means initialisation
        #[arg(long)]
        seed: Option<u64>,

        /// Prefix of the tabular artifact file names
        #[arg(long)]
        dataset_name: Option<String>,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Score the reps of one session file
    Score {
        /// Directory holding trained artifacts
        #[arg(short, long)]
        artifacts: PathBuf,

        /// Session JSON file to score
        #[arg(short, long)]
        input: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Report on the artifacts in a directory
    Inspect {
        /// Directory holding trained artifacts
        #[arg(short, long)]
        artifacts: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so stdout stays machine-readable
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn run(cli: Cli) -> Result<(), FormlabCliError> {
    match cli.command {
        Commands::Train {
            input,
            output,
            config,
            k_min,
            k_max,
            seed,
            dataset_name,
            json,
        } => {
            let mut pipeline_config = match config {
                Some(path) => PipelineConfig::from_json_file(&path)?,
                None => PipelineConfig::default(),
            };
            if let Some(k) = k_min {
                pipeline_config.k_min = k;
            }
            if let Some(k) = k_max {
                pipeline_config.k_max = k;
            }
            if let Some(seed) = seed {
                pipeline_config.seed = seed;
            }
            if let Some(name) = dataset_name {
                pipeline_config.dataset_name = name;
            }

            cmd_train(&input, &output, &pipeline_config, json)
        }

        Commands::Score {
            artifacts,
            input,
            json,
        } => cmd_score(&artifacts, &input, json),

        Commands::Inspect { artifacts, json } => cmd_inspect(&artifacts, json),
    }
}

fn cmd_train(
    input: &Path,
    output: &Path,
    config: &PipelineConfig,
    json: bool,
) -> Result<(), FormlabCliError> {
    let report = run_pipeline(input, output, config)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_run_report(&report);
    }

    let failed = report
        .artifacts
        .iter()
        .filter(|a| matches!(a.status, ArtifactStatus::Failed { .. }))
        .count();
    if failed > 0 {
        Err(FormlabCliError::ArtifactsFailed(failed))
    } else {
        Ok(())
    }
}

fn print_run_report(report: &RunReport) {
    println!("Formlab Training Run");
    println!("====================");
    println!("Run id:     {}", report.run_id);
    println!(
        "Files:      {} scanned, {} skipped",
        report.files_scanned, report.files_skipped
    );
    println!("Reps:       {}", report.reps_ingested);
    println!("Features:   {}", report.feature_columns.join(", "));
    println!("Clustering: {}", describe_stage(&report.clustering));
    println!("Classifier: {}", describe_stage(&report.classifier));

    if !report.warnings.is_empty() {
        println!("\nWarnings:");
        for warning in &report.warnings {
            println!("  {}: {}", warning.file, warning.reason);
        }
    }

    println!("\nArtifacts:");
    for artifact in &report.artifacts {
        match &artifact.status {
            ArtifactStatus::Written => println!("  [OK]   {}", artifact.path.display()),
            ArtifactStatus::Skipped { reason } => {
                println!("  [SKIP] {}: {}", artifact.name, reason)
            }
            ArtifactStatus::Failed { error } => println!("  [ERR]  {}: {}", artifact.name, error),
        }
    }
}

fn describe_stage(stage: &StageOutcome) -> String {
    match stage {
        StageOutcome::Completed { summary } => format!("completed ({})", summary),
        StageOutcome::Unavailable { reason } => format!("unavailable ({})", reason),
    }
}

fn cmd_score(artifacts: &Path, input: &Path, json: bool) -> Result<(), FormlabCliError> {
    let scorer = RepScorer::load(artifacts)?;
    let session = Ingestor::read_session(input)?;
    for warning in &session.warnings {
        tracing::warn!("{}: {}", warning.file, warning.reason);
    }

    let scores = session
        .records
        .iter()
        .map(|record| scorer.score(record))
        .collect::<Result<Vec<RepScore>, _>>()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&scores)?);
        return Ok(());
    }

    println!("Scored {} reps against run {}", scores.len(), scorer.run_id());
    for score in &scores {
        let rep = score
            .rep_number
            .map(|n| n.to_string())
            .unwrap_or_else(|| "?".to_string());
        let cluster = match (score.nearest_cluster, score.distance) {
            (Some(c), Some(d)) => format!("cluster {} (distance {:.2})", c, d),
            _ => "no benchmark".to_string(),
        };
        let validity = match (score.predicted_valid, score.valid_probability) {
            (Some(valid), Some(p)) => format!(
                "{} (p={:.2})",
                if valid { "valid" } else { "invalid" },
                p
            ),
            _ => "no classifier".to_string(),
        };
        println!("  rep {:>3}: {}, {}", rep, cluster, validity);

        for deviation in &score.deviations {
            println!(
                "           {:<28} {:>9.2} vs {:>9.2} ({:+.2})",
                deviation.feature, deviation.value, deviation.benchmark, deviation.deviation
            );
        }
    }

    Ok(())
}

fn cmd_inspect(artifacts: &Path, json: bool) -> Result<(), FormlabCliError> {
    let inventory = inspect_directory(artifacts)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&inventory)?);
    } else {
        println!("Formlab Artifact Report");
        println!("=======================");
        println!("Producer:  {} {}", PRODUCER_NAME, FORMLAB_VERSION);
        println!("Directory: {}", inventory.dir.display());
        println!("Run ids:   {}", inventory.run_ids.join(", "));
        println!("\nArtifacts:");

        for artifact in &inventory.artifacts {
            let (icon, detail) = match (&artifact.error, artifact.present) {
                (Some(e), _) => ("[ERR] ", e.clone()),
                (None, true) => ("[OK]  ", artifact.run_id.clone().unwrap_or_default()),
                (None, false) => ("[MISS]", "not present".to_string()),
            };
            println!("  {} {}: {}", icon, artifact.name, detail);
        }
    }

    if inventory.is_consistent() {
        Ok(())
    } else {
        Err(FormlabCliError::InconsistentArtifacts(inventory.run_ids.len()))
    }
}

// Error types

#[derive(Debug)]
enum FormlabCliError {
    Pipeline(PipelineError),
    Json(serde_json::Error),
    ArtifactsFailed(usize),
    InconsistentArtifacts(usize),
}

impl From<PipelineError> for FormlabCliError {
    fn from(e: PipelineError) -> Self {
        FormlabCliError::Pipeline(e)
    }
}

impl From<serde_json::Error> for FormlabCliError {
    fn from(e: serde_json::Error) -> Self {
        FormlabCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<FormlabCliError> for CliError {
    fn from(e: FormlabCliError) -> Self {
        match e {
            FormlabCliError::Pipeline(e) => {
                let (code, hint) = match &e {
                    PipelineError::InputNotFound(_) => {
                        ("INPUT_NOT_FOUND", "Check the input directory path")
                    }
                    PipelineError::EmptyInput(_) => (
                        "EMPTY_INPUT",
                        "Ensure session files contain a non-empty 'reps' array",
                    ),
                    PipelineError::NoUsableFeatures => (
                        "NO_USABLE_FEATURES",
                        "Reps need angle, slope or range-of-motion metrics",
                    ),
                    PipelineError::InvalidConfig(_) => {
                        ("INVALID_CONFIG", "Check k range, tree count and dataset name")
                    }
                    PipelineError::InvalidSession { .. } => {
                        ("INVALID_SESSION", "Session files need a 'reps' array")
                    }
                    PipelineError::ArtifactError(_) => (
                        "ARTIFACT_ERROR",
                        "Run 'formlab inspect' on the artifact directory",
                    ),
                    PipelineError::Io(_) => ("IO_ERROR", "Check file paths and permissions"),
                    PipelineError::JsonError(_) | PipelineError::CsvError(_) => {
                        ("PARSE_ERROR", "Check file syntax")
                    }
                    PipelineError::ModelError(_) | PipelineError::DimensionMismatch { .. } => (
                        "MODEL_ERROR",
                        "Artifacts may come from an incompatible version",
                    ),
                };
                CliError {
                    code: code.to_string(),
                    message: e.to_string(),
                    hint: Some(hint.to_string()),
                }
            }
            FormlabCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            FormlabCliError::ArtifactsFailed(count) => CliError {
                code: "ARTIFACTS_FAILED".to_string(),
                message: format!("{} artifacts could not be written", count),
                hint: Some("Check the output directory permissions".to_string()),
            },
            FormlabCliError::InconsistentArtifacts(runs) => CliError {
                code: "INCONSISTENT_ARTIFACTS".to_string(),
                message: format!(
                    "Artifacts are unreadable or span {} training runs",
                    runs
                ),
                hint: Some("Retrain into an empty output directory".to_string()),
            },
        }
    }
}
