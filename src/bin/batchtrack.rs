//! batchtrack CLI: operator and worker entrypoint for the tracking table.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use batchtrack::config::{Config, PipelineConfig};
use batchtrack::dispatch::{AwsBatchSubmitter, DispatchReport, Dispatcher};
use batchtrack::indexer::BatchIndexer;
use batchtrack::model::{GroupKey, Selection, Stage};
use batchtrack::source;
use batchtrack::store::Tracker;
use batchtrack::telemetry::{TelemetryConfig, init_telemetry};
use batchtrack::worker::{CommandRunner, Worker, WorkerReport};
use clap::{Parser, Subcommand};

const DEFAULT_PIPELINE: &str = "pipeline.toml";

#[derive(Parser)]
#[command(name = "batchtrack", about = "Track and dispatch batched pipeline work")]
struct Cli {
    /// Pipeline settings file. Defaults apply when it is absent.
    #[arg(long, global = true, env = "BATCHTRACK_PIPELINE")]
    pipeline: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the tracking table and wait until it is active
    CreateTable,
    /// Populate the tracking table from an item listing
    Index {
        /// CSV (with header) or newline-delimited listing
        source: PathBuf,
        /// CSV column holding the item key
        #[arg(long, default_value = source::DEFAULT_COLUMN)]
        column: String,
        /// Items per group (overrides tracking.group_size)
        #[arg(long)]
        group_size: Option<usize>,
        /// Print the grouping without writing
        #[arg(long)]
        dry_run: bool,
    },
    /// Submit one job per group that still needs a stage
    Dispatch {
        #[arg(long, default_value = "segmented")]
        stage: Stage,
        /// Every group, regardless of flags
        #[arg(long)]
        all: bool,
        /// Cap on jobs submitted this run (overrides dispatch.max_jobs)
        #[arg(long)]
        max_jobs: Option<usize>,
        /// List eligible groups without submitting
        #[arg(long)]
        dry_run: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Process the items of one group (run inside a submitted job)
    Work {
        #[arg(long, env = "BATCHINDEX")]
        group: GroupKey,
        #[arg(long, default_value = "segmented")]
        stage: Stage,
        /// Every item of the group, regardless of flags
        #[arg(long)]
        all: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show item counts
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Clear in-progress claims left by crashed workers
    Reset {
        /// Only this group
        #[arg(long)]
        group: Option<GroupKey>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::CreateTable => "create-table",
            Command::Index { .. } => "index",
            Command::Dispatch { .. } => "dispatch",
            Command::Work { .. } => "work",
            Command::Status { .. } => "status",
            Command::Reset { .. } => "reset",
        }
    }

    /// Run identity attached to every exported signal.
    fn telemetry(&self, config: &Config) -> TelemetryConfig {
        let telemetry = TelemetryConfig::new("batchtrack", config.log_level.clone())
            .with_endpoint(config.otel_endpoint.clone())
            .with_command(self.name());
        match self {
            Command::Dispatch { stage, .. } => telemetry.with_stage(*stage),
            Command::Work { group, stage, .. } => telemetry.with_stage(*stage).with_group(*group),
            Command::Reset { group: Some(group) } => telemetry.with_group(*group),
            _ => telemetry,
        }
    }
}

fn selection(all: bool) -> Selection {
    if all {
        Selection::All
    } else {
        Selection::Eligible
    }
}

fn load_pipeline(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    match path {
        Some(path) => Ok(PipelineConfig::load(path)?),
        None if Path::new(DEFAULT_PIPELINE).exists() => {
            Ok(PipelineConfig::load(Path::new(DEFAULT_PIPELINE))?)
        }
        None => Ok(PipelineConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env()?;
    let telemetry = init_telemetry(cli.command.telemetry(&config))?;

    let mut pipeline = load_pipeline(cli.pipeline.as_deref())?;
    if let Command::Index {
        group_size: Some(size),
        ..
    } = &cli.command
    {
        pipeline.tracking.group_size = *size;
    }
    let tracker = Tracker::connect(&config, pipeline.tracking).await?;

    let result = match cli.command {
        Command::CreateTable => cmd_create_table(&tracker).await,
        Command::Index {
            source,
            column,
            dry_run,
            ..
        } => cmd_index(&tracker, &source, &column, dry_run).await,
        Command::Dispatch {
            stage,
            all,
            max_jobs,
            dry_run,
            json,
        } => {
            let mut settings = pipeline.dispatch.clone();
            if max_jobs.is_some() {
                settings.max_jobs = max_jobs;
            }
            let submitter = AwsBatchSubmitter::from_env(settings.platform).await;
            let dispatcher = Dispatcher::new(tracker.clone(), Arc::new(submitter), settings);
            cmd_dispatch(&dispatcher, stage, selection(all), dry_run, json).await
        }
        Command::Work {
            group,
            stage,
            all,
            json,
        } => {
            let runner = CommandRunner::from_pipeline(&pipeline);
            if !runner.has_stage(stage) {
                anyhow::bail!("no command configured for stage {stage} in [stages]");
            }
            let worker = Worker::new(tracker.clone(), Arc::new(runner));
            cmd_work(&worker, group, stage, selection(all), json).await
        }
        Command::Status { json } => cmd_status(&tracker, json).await,
        Command::Reset { group } => cmd_reset(&tracker, group).await,
    };

    tracker.close().await;
    if let Err(e) = telemetry.shutdown() {
        eprintln!("telemetry shutdown failed: {e}");
    }
    result
}

async fn cmd_create_table(tracker: &Tracker) -> anyhow::Result<()> {
    tracker.ensure_table().await?;
    println!("Tracking table ready.");
    Ok(())
}

async fn cmd_index(
    tracker: &Tracker,
    listing: &Path,
    column: &str,
    dry_run: bool,
) -> anyhow::Result<()> {
    let keys = source::read_item_keys(listing, column)?;
    let indexer = BatchIndexer::new(tracker.settings().group_size)?;
    let (items, plan) = indexer.index(keys)?;

    println!(
        "{} item(s) in {} group(s) of up to {} ({} duplicate(s) dropped)",
        plan.items,
        plan.group_count(),
        indexer.group_size(),
        plan.duplicates_dropped
    );
    if dry_run {
        for item in &items {
            println!("{:>6}  {}", item.group_key, item.item_key);
        }
        return Ok(());
    }

    let summary = tracker.put(items).await?;
    println!(
        "Wrote {} item(s) in {} batch(es), {} rejection(s) retried, final batch size {}",
        summary.written, summary.batches, summary.rejected, summary.final_batch_size
    );
    Ok(())
}

async fn cmd_dispatch(
    dispatcher: &Dispatcher,
    stage: Stage,
    selection: Selection,
    dry_run: bool,
    json: bool,
) -> anyhow::Result<()> {
    if dry_run {
        let groups = dispatcher.eligible_groups(stage, selection).await?;
        if json {
            let requests: Vec<_> = groups.iter().map(|g| dispatcher.job_request(*g)).collect();
            println!("{}", serde_json::to_string_pretty(&requests)?);
        } else {
            for group in &groups {
                println!("{}", dispatcher.job_request(*group).job_name);
            }
            println!("\n{} eligible group(s) for {stage}", groups.len());
        }
        return Ok(());
    }

    let report = dispatcher.dispatch(stage, selection).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_dispatch_report(&report);
    }
    if !report.failed.is_empty() {
        anyhow::bail!(
            "{} group(s) failed to submit: {:?}",
            report.failed.len(),
            report.failed_groups().iter().map(|g| g.0).collect::<Vec<_>>()
        );
    }
    Ok(())
}

fn print_dispatch_report(report: &DispatchReport) {
    println!("{:<8}  {:<30}  JOB_ID", "GROUP", "JOB_NAME");
    println!("{}", "-".repeat(80));
    for job in &report.submitted {
        println!("{:<8}  {:<30}  {}", job.group, job.job_name, job.job_id);
    }
    for failure in &report.failed {
        println!("{:<8}  {:<30}  FAILED: {}", failure.group, "-", failure.error);
    }
    println!(
        "\n{} submitted, {} failed, {} deferred ({} eligible for {})",
        report.submitted.len(),
        report.failed.len(),
        report.deferred.len(),
        report.eligible,
        report.stage
    );
}

async fn cmd_work(
    worker: &Worker,
    group: GroupKey,
    stage: Stage,
    selection: Selection,
    json: bool,
) -> anyhow::Result<()> {
    let report = worker.run_group(group, stage, selection).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_worker_report(&report);
    }
    if report.failed() > 0 {
        anyhow::bail!("{} item(s) failed in group {group}", report.failed());
    }
    Ok(())
}

fn print_worker_report(report: &WorkerReport) {
    println!("{:<30}  {:<8}  {:>10}  ERROR", "ITEM", "STATE", "MS");
    println!("{}", "-".repeat(80));
    for outcome in &report.items {
        println!(
            "{:<30}  {:<8}  {:>10}  {}",
            outcome.item.item_key,
            outcome.state,
            outcome.duration_ms,
            outcome.error.as_deref().unwrap_or("-")
        );
    }
    for item in &report.skipped {
        println!("{:<30}  {:<8}  {:>10}  not found", item.item_key, "skipped", "-");
    }
    println!(
        "\ngroup {} {}: {} done, {} failed, {} skipped",
        report.group,
        report.stage,
        report.done(),
        report.failed(),
        report.skipped.len()
    );
}

async fn cmd_reset(tracker: &Tracker, group: Option<GroupKey>) -> anyhow::Result<()> {
    let cleared = tracker.reset_claims(group).await?;
    println!("Cleared {cleared} stuck claim(s).");
    Ok(())
}

async fn cmd_status(tracker: &Tracker, json: bool) -> anyhow::Result<()> {
    let status = tracker.status().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    println!("Items:        {}", status.total);
    println!("Groups:       {}", status.groups);
    println!("In progress:  {}", status.in_progress);
    for (stage, done) in &status.completed {
        println!("{:<13} {done}", format!("{stage}:"));
    }
    Ok(())
}
