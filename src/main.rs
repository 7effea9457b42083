//! CLI that organises raw DICOM acquisitions into a BIDS dataset.
//!
//! It drives dcm2bids/dcm2niix per subject, splits behavioural event tables into
//! `*_events.tsv` files, writes `participants.tsv` and the dataset-level JSON files,
//! and reports per-subject outcomes in CSV/JSON.
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dicom_bids_cli::batch::{run_batch, write_reports};
use dicom_bids_cli::config::{
    self, load_runtime_config, sanitize_optional_string, EffectiveConfig, RuntimeConfigFile,
    DEFAULT_CONFIG_PATH,
};
use dicom_bids_cli::dataset::{BidsDataset, SubjectOutcome, TaskMetadata, ToolSettings};
use dicom_bids_cli::table::Table;
use dicom_bids_cli::tools::{tool_available, ToolPolicy};
use dicom_bids_cli::{dicom, events, naming};

#[derive(Parser)]
#[command(name = "dicom_bids_cli")]
#[command(about = "DICOM to BIDS dataset organiser", long_about = None)]
/// Entry CLI that dispatches to subcommands.
struct Cli {
    /// Optional runtime config in TOML that supplies defaults for the CLI.
    #[arg(short, long, help = "TOML config file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lay out one subject with dcm2bids and optionally split its events file
    Subject(SubjectArgs),
    /// Process every subject listed in a manifest
    Batch(BatchArgs),
    /// Split a tidy events table into per-run BIDS events files
    Events(EventsArgs),
    /// Write participants.tsv from a demographics table
    Participants(ParticipantsArgs),
    /// Write a task-<name>_bold.json sidecar
    Task(TaskArgs),
    /// Convert a DICOM directory to NIfTI with dcm2niix
    Nifti(NiftiArgs),
    /// List experimental runs found in a raw DICOM directory
    Runs(RunsArgs),
    /// Write dataset_description.json
    Describe(DescribeArgs),
}

#[derive(Args, Clone)]
struct SharedArgs {
    /// BIDS output root directory.
    #[arg(long, value_name = "DIR")]
    bids_root: Option<PathBuf>,

    /// dcm2bids configuration file (JSON).
    #[arg(long, value_name = "FILE")]
    dcm2bids_config: Option<PathBuf>,

    /// dcm2bids executable.
    #[arg(long)]
    dcm2bids: Option<String>,

    /// dcm2niix executable.
    #[arg(long)]
    dcm2niix: Option<String>,

    /// Abort on the first external tool failure instead of logging and continuing.
    #[arg(long)]
    strict: bool,
}

#[derive(Args, Clone)]
struct SubjectArgs {
    #[command(flatten)]
    shared: SharedArgs,

    /// Participant identifier (numeric ids below 10 are zero-padded).
    #[arg(short, long)]
    subject: String,

    /// Directory holding the subject's raw DICOM files.
    #[arg(short, long, value_name = "DIR")]
    dicom_dir: PathBuf,

    #[arg(long)]
    session: Option<String>,

    /// Tidy events table (CSV/TSV) to split into the subject's func directory.
    #[arg(short, long, value_name = "FILE")]
    events: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct BatchArgs {
    #[command(flatten)]
    shared: SharedArgs,

    /// CSV, TSV or JSON manifest with subject, dicom_dir, session, events.
    #[arg(short, long, value_name = "FILE")]
    manifest: PathBuf,

    /// Demographics table used to write participants.tsv after the batch.
    #[arg(long, value_name = "FILE")]
    participants: Option<PathBuf>,

    /// Extra demographics columns to carry into participants.tsv.
    #[arg(long = "column")]
    columns: Vec<String>,

    /// Maximum number of subjects processed concurrently.
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Optional destination for the CSV report.
    #[arg(long)]
    report_csv: Option<PathBuf>,

    /// Optional destination for the JSON report.
    #[arg(long)]
    report_json: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct EventsArgs {
    /// Tidy events table (CSV/TSV) with run, task, onset, duration, trial_type.
    #[arg(short, long, value_name = "FILE")]
    input: PathBuf,

    #[arg(short, long)]
    subject: String,

    /// Directory receiving the *_events.tsv files.
    #[arg(short, long, value_name = "DIR")]
    output: PathBuf,

    #[arg(long)]
    session: Option<String>,
}

#[derive(Args, Clone)]
struct ParticipantsArgs {
    #[command(flatten)]
    shared: SharedArgs,

    /// Demographics table (CSV/TSV) with participant_id, sex, age.
    #[arg(short, long, value_name = "FILE")]
    input: PathBuf,

    /// Extra columns to carry into participants.tsv.
    #[arg(long = "column")]
    columns: Vec<String>,
}

#[derive(Args, Clone)]
struct TaskArgs {
    #[command(flatten)]
    shared: SharedArgs,

    /// Task label as it appears in file names.
    #[arg(short, long)]
    name: String,

    /// Repetition time in seconds.
    #[arg(long)]
    repetition_time: Option<f64>,

    #[arg(long)]
    instructions: Option<String>,
}

#[derive(Args, Clone)]
struct NiftiArgs {
    #[command(flatten)]
    shared: SharedArgs,

    /// Raw DICOM directory.
    #[arg(short, long, value_name = "DIR")]
    source: PathBuf,

    /// Directory receiving the NIfTI files.
    #[arg(short, long, value_name = "DIR")]
    output: PathBuf,

    /// Write uncompressed .nii files.
    #[arg(long)]
    no_compress: bool,
}

#[derive(Args, Clone)]
struct RunsArgs {
    /// Raw DICOM directory to inventory.
    #[arg(short, long, value_name = "DIR")]
    dicom_dir: PathBuf,

    /// Volume counts of the experimental runs (repeatable).
    #[arg(short, long = "volumes", required = true)]
    volumes: Vec<usize>,

    /// Select motion-corrected (MoCoSeries) runs instead of the originals.
    #[arg(long)]
    moco: bool,

    /// Print the selection as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Args, Clone)]
struct DescribeArgs {
    #[command(flatten)]
    shared: SharedArgs,

    /// Dataset name.
    #[arg(short, long)]
    name: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Cli::parse();
    let cfg_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    match args.command {
        Commands::Subject(cmd) => run_subject(cmd, &cfg_path).await,
        Commands::Batch(cmd) => run_batch_command(cmd, &cfg_path).await,
        Commands::Events(cmd) => run_events(cmd),
        Commands::Participants(cmd) => run_participants(cmd, &cfg_path),
        Commands::Task(cmd) => run_task(cmd, &cfg_path),
        Commands::Nifti(cmd) => run_nifti(cmd, &cfg_path).await,
        Commands::Runs(cmd) => run_runs(cmd).await,
        Commands::Describe(cmd) => run_describe(cmd, &cfg_path),
    }
}

/// Merge CLI overrides with a parsed runtime config, falling back to crate defaults.
///
/// CLI flags take precedence, followed by the runtime file, and finally `EffectiveConfig::defaults()`.
fn merge_config(cli: &SharedArgs, file: Option<RuntimeConfigFile>) -> EffectiveConfig {
    let mut cfg = EffectiveConfig::defaults();
    let f = file.unwrap_or_default();

    cfg.bids_root = cli.bids_root.clone().or(f.bids_root).unwrap_or(cfg.bids_root);
    cfg.dcm2bids_config = cli
        .dcm2bids_config
        .clone()
        .or(f.dcm2bids_config)
        .unwrap_or(cfg.dcm2bids_config);
    cfg.dcm2bids = sanitize_optional_string(cli.dcm2bids.clone())
        .or(sanitize_optional_string(f.dcm2bids))
        .unwrap_or(cfg.dcm2bids);
    cfg.dcm2niix = sanitize_optional_string(cli.dcm2niix.clone())
        .or(sanitize_optional_string(f.dcm2niix))
        .unwrap_or(cfg.dcm2niix);
    cfg.strict_tools = cli.strict || f.strict_tools.unwrap_or(cfg.strict_tools);
    cfg.compress = f.compress.unwrap_or(cfg.compress);
    cfg.concurrency = f.concurrency.unwrap_or(cfg.concurrency);
    cfg.report_csv = f.report_csv.unwrap_or(cfg.report_csv);
    cfg.report_json = f.report_json.unwrap_or(cfg.report_json);
    cfg.participant_columns = f.participant_columns.unwrap_or(cfg.participant_columns);

    cfg
}

fn effective_config(shared: &SharedArgs, cfg_path: &Path) -> Result<EffectiveConfig> {
    let runtime_file = load_runtime_config(Some(cfg_path))?;
    Ok(merge_config(shared, runtime_file))
}

fn open_dataset(cfg: &EffectiveConfig) -> BidsDataset {
    let tools = ToolSettings {
        dcm2bids: cfg.dcm2bids.clone(),
        dcm2niix: cfg.dcm2niix.clone(),
    };
    BidsDataset::new(&cfg.bids_root, &cfg.dcm2bids_config, tools)
}

fn warn_if_missing(program: &str) {
    if !tool_available(program) {
        warn!("{} not found or not runnable; conversions will fail", program);
    }
}

async fn run_subject(args: SubjectArgs, cfg_path: &Path) -> Result<()> {
    let effective = effective_config(&args.shared, cfg_path)?;
    let policy = ToolPolicy::from_strict(effective.strict_tools);
    let mut dataset = open_dataset(&effective);
    warn_if_missing(&effective.dcm2bids);

    let session = sanitize_optional_string(args.session);
    let outcome = dataset
        .add_subject(&args.dicom_dir, &args.subject, session.as_deref(), policy)
        .await?;
    match outcome {
        SubjectOutcome::Converted => println!("{} {} laid out", "✓".green(), args.subject),
        SubjectOutcome::Skipped => println!("{} {} already present", "-".yellow(), args.subject),
        SubjectOutcome::ToolFailed(msg) => {
            println!("{} {}: {} (continuing)", "✗".red(), args.subject, msg)
        }
    }

    if let Some(events) = &args.events {
        let table = Table::read_path(events)?;
        let written = dataset.set_events(&args.subject, &table, session.as_deref())?;
        for path in written {
            println!("  {}", path.display());
        }
    }
    Ok(())
}

async fn run_batch_command(args: BatchArgs, cfg_path: &Path) -> Result<()> {
    let effective = effective_config(&args.shared, cfg_path)?;
    let policy = ToolPolicy::from_strict(effective.strict_tools);
    let concurrency = args.concurrency.unwrap_or(effective.concurrency);
    let report_csv = args.report_csv.clone().unwrap_or(effective.report_csv.clone());
    let report_json = args.report_json.clone().unwrap_or(effective.report_json.clone());
    let mut dataset = open_dataset(&effective);
    warn_if_missing(&effective.dcm2bids);

    let entries = config::parse_manifest(&args.manifest).context("Parse manifest failed")?;
    println!("Processing {} subjects into {}...", entries.len(), dataset.root().display());

    let results = run_batch(&mut dataset, entries, policy, concurrency).await;

    if policy == ToolPolicy::Fail {
        if let Some(failed) = results.iter().find(|r| r.status == "Failed") {
            write_reports(&report_csv, &report_json, &results)?;
            anyhow::bail!("Subject {} failed: {}", failed.subject, failed.reason.join("; "));
        }
    }

    if let Some(demographics) = &args.participants {
        let table = Table::read_path(demographics)?;
        let columns = if args.columns.is_empty() {
            effective.participant_columns.clone()
        } else {
            args.columns.clone()
        };
        if let Some(path) = dataset.set_participants(&table, &columns)? {
            println!("Participants written to {}", path.display());
        }
    }

    write_reports(&report_csv, &report_json, &results)?;

    let ok = results
        .iter()
        .filter(|r| r.status == "Success" || r.status == "Skipped")
        .count();
    println!("Summary: {} Success, {} Failed/Partial.", ok, results.len() - ok);
    Ok(())
}

fn run_events(args: EventsArgs) -> Result<()> {
    let session = sanitize_optional_string(args.session);
    let written =
        events::split_events_file(&args.input, &args.subject, &args.output, session.as_deref())?;
    println!("{} wrote {} events files", "✓".green(), written.len());
    for path in written {
        println!("  {}", path.display());
    }
    Ok(())
}

fn run_participants(args: ParticipantsArgs, cfg_path: &Path) -> Result<()> {
    let effective = effective_config(&args.shared, cfg_path)?;
    let dataset = open_dataset(&effective);
    let table = Table::read_path(&args.input)?;
    let columns = if args.columns.is_empty() {
        effective.participant_columns.clone()
    } else {
        args.columns
    };

    match dataset.set_participants(&table, &columns)? {
        Some(path) => println!("{} {}", "✓".green(), path.display()),
        None => println!("{} participants.tsv not written", "✗".red()),
    }
    Ok(())
}

fn run_task(args: TaskArgs, cfg_path: &Path) -> Result<()> {
    let effective = effective_config(&args.shared, cfg_path)?;
    let dataset = open_dataset(&effective);
    let path = dataset.set_task(&TaskMetadata {
        name: args.name,
        repetition_time: args.repetition_time,
        instructions: sanitize_optional_string(args.instructions),
    })?;
    println!("{} {}", "✓".green(), path.display());
    Ok(())
}

async fn run_nifti(args: NiftiArgs, cfg_path: &Path) -> Result<()> {
    let effective = effective_config(&args.shared, cfg_path)?;
    let policy = ToolPolicy::from_strict(effective.strict_tools);
    let dataset = open_dataset(&effective);
    let compress = effective.compress && !args.no_compress;
    warn_if_missing(&effective.dcm2niix);

    match dataset
        .convert_nifti(&args.source, &args.output, compress, policy)
        .await?
    {
        Some(result) => {
            println!(
                "{} {} NIfTI files, {} sidecars in {} ms",
                "✓".green(),
                result.nifti_files.len(),
                result.json_files.len(),
                result.elapsed_ms
            );
            for path in &result.json_files {
                match dicom::sidecar_is_moco(path) {
                    Ok(true) => println!("  {} (MoCo)", path.display()),
                    Ok(false) => println!("  {}", path.display()),
                    Err(e) => warn!("{:#}", e),
                }
            }
        }
        None => println!("{} conversion failed; continuing", "✗".red()),
    }
    Ok(())
}

async fn run_runs(args: RunsArgs) -> Result<()> {
    let series = dicom::scan_series(&args.dicom_dir).await?;
    let runs = dicom::select_runs(&series, &args.volumes, args.moco);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    println!("{} series found, {} runs selected", series.len(), runs.len());
    for (idx, run) in runs.iter().enumerate() {
        println!(
            "  run-{} {} #{} {} ({} volumes)",
            naming::zero_pad(&(idx + 1).to_string()),
            run.acquisition.as_deref().unwrap_or("-"),
            run.series_number.map(|n| n.to_string()).unwrap_or_default(),
            run.description.cyan(),
            run.instance_count
        );
    }
    Ok(())
}

fn run_describe(args: DescribeArgs, cfg_path: &Path) -> Result<()> {
    let effective = effective_config(&args.shared, cfg_path)?;
    let dataset = open_dataset(&effective);
    let path = dataset.write_description(&args.name)?;
    println!("{} {}", "✓".green(), path.display());
    Ok(())
}
