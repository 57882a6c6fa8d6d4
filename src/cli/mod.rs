//! Command-line surface of the `scm-sync` binary.
//!
//! Every role (scheduler, worker, reaper) and every operator tool shares one
//! binary; roles coordinate only through the database.

mod admin;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};

use crate::config::{AppConfig, ConfigLoader};
use crate::db;
use crate::queue::ClaimFilter;
use crate::reaper::SyncReaper;
use crate::runner::SyncRunner;
use crate::scheduler::SyncScheduler;
use crate::server::{AppState, serve_metrics};
use crate::sources::SourceRegistry;
use crate::status::{StatusService, evaluate_health, render_prometheus, render_text};
use crate::telemetry::{init_tracing, role_span};
use crate::types::{JobMode, JobType};
use crate::worker::SyncWorker;

pub use admin::AdminCommand;

#[derive(Debug, Parser)]
#[command(name = "scm-sync", version, about = "SCM history sync orchestration")]
pub struct Cli {
    /// Serve `/metrics` and `/healthz` on this address (scheduler, worker, reaper).
    #[arg(long, global = true)]
    pub metrics_bind: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Plan and enqueue sync jobs.
    Scheduler(LoopArgs),
    /// Claim and execute sync jobs.
    Worker(WorkerArgs),
    /// Reclaim expired leases and clean up stale state.
    Reaper(LoopArgs),
    /// Summarize queue, lock, breaker and rate-limit state.
    Status(StatusArgs),
    /// Operator remediation.
    Admin {
        #[command(subcommand)]
        command: AdminCommand,
    },
    /// Sync a single repository now.
    Runner(RunnerArgs),
    /// Apply pending database migrations.
    Migrate,
}

impl Command {
    /// Role name recorded on every log line the process emits.
    pub fn role(&self) -> &'static str {
        match self {
            Command::Scheduler(_) => "scheduler",
            Command::Worker(_) => "worker",
            Command::Reaper(_) => "reaper",
            Command::Status(_) => "status",
            Command::Admin { .. } => "admin",
            Command::Runner(_) => "runner",
            Command::Migrate => "migrate",
        }
    }
}

#[derive(Debug, clap::Args)]
pub struct LoopArgs {
    /// Run a single tick and exit.
    #[arg(long, conflicts_with = "run_loop")]
    pub once: bool,
    /// Keep ticking until interrupted (default).
    #[arg(long = "loop")]
    pub run_loop: bool,
    #[arg(long)]
    pub interval_seconds: Option<u64>,
    #[arg(long)]
    pub dry_run: bool,
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, clap::Args)]
pub struct WorkerArgs {
    #[arg(long)]
    pub worker_id: Option<String>,
    /// Claim and process one batch, then exit.
    #[arg(long)]
    pub once: bool,
    /// Comma-separated GitLab instances this worker may claim.
    #[arg(long, value_delimiter = ',')]
    pub instance_allowlist: Vec<String>,
    /// Comma-separated tenants this worker may claim.
    #[arg(long, value_delimiter = ',')]
    pub tenant_allowlist: Vec<String>,
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
    Prometheus,
}

#[derive(Debug, clap::Args)]
pub struct StatusArgs {
    #[arg(long, conflicts_with = "prometheus")]
    pub json: bool,
    #[arg(long)]
    pub prometheus: bool,
    /// Evaluate the health gate and exit 0 (healthy), 1 (warning) or 2 (critical).
    #[arg(long)]
    pub health: bool,
    #[arg(long)]
    pub include_details: bool,
    #[arg(long)]
    pub grace_seconds: Option<u64>,
}

impl StatusArgs {
    fn format(&self) -> OutputFormat {
        if self.json {
            OutputFormat::Json
        } else if self.prometheus {
            OutputFormat::Prometheus
        } else {
            OutputFormat::Text
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RunnerMode {
    Incremental,
    Backfill,
}

impl From<RunnerMode> for JobMode {
    fn from(mode: RunnerMode) -> Self {
        match mode {
            RunnerMode::Incremental => JobMode::Incremental,
            RunnerMode::Backfill => JobMode::Backfill,
        }
    }
}

#[derive(Debug, clap::Args)]
pub struct RunnerArgs {
    #[arg(value_enum)]
    pub mode: RunnerMode,
    /// Repository key or numeric id.
    #[arg(long)]
    pub repo: String,
    #[arg(long = "job")]
    pub job_type: Option<JobType>,
    #[arg(long)]
    pub dry_run: bool,
    #[arg(long)]
    pub json: bool,
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to encode output")?
    );
    Ok(())
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
        trigger.cancel();
    });
    token
}

struct Runtime {
    config: Arc<AppConfig>,
    db: Arc<DatabaseConnection>,
}

async fn connect(metrics_bind: Option<String>) -> Result<Runtime> {
    let mut config = ConfigLoader::new()
        .load()
        .context("failed to load configuration")?;
    if metrics_bind.is_some() {
        config.metrics_bind_addr = metrics_bind;
    }
    config.validate().context("invalid configuration")?;
    init_tracing(&config).context("failed to initialize tracing")?;

    let db = db::init_pool(&config)
        .await
        .context("failed to connect to database")?;
    Ok(Runtime {
        config: Arc::new(config),
        db: Arc::new(db),
    })
}

fn spawn_metrics(ctx: &Runtime, shutdown: &CancellationToken) -> Result<()> {
    let Some(addr) = ctx.config.metrics_addr().context("invalid metrics address")? else {
        return Ok(());
    };
    let state = AppState::new(ctx.config.clone(), ctx.db.clone());
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = serve_metrics(addr, state, shutdown).await {
            error!(error = %err, "Metrics endpoint failed");
        }
    });
    Ok(())
}

/// Runs the parsed command and maps its result to the process exit status.
pub async fn run(cli: Cli) -> Result<ExitCode> {
    let ctx = connect(cli.metrics_bind).await?;
    let span = role_span(cli.command.role());
    dispatch(&ctx, cli.command).instrument(span).await
}

async fn dispatch(ctx: &Runtime, command: Command) -> Result<ExitCode> {
    match command {
        Command::Migrate => {
            let applied = db::migrate(&ctx.db).await?;
            info!(applied, "Migrations applied");
            println!("applied {applied} migration(s)");
            Ok(ExitCode::SUCCESS)
        }
        Command::Scheduler(args) => run_scheduler(ctx, args).await,
        Command::Worker(args) => run_worker(ctx, args).await,
        Command::Reaper(args) => run_reaper(ctx, args).await,
        Command::Status(args) => run_status(ctx, args).await,
        Command::Admin { command } => admin::run(&ctx.config, &ctx.db, command).await,
        Command::Runner(args) => run_runner(ctx, args).await,
    }
}

async fn run_scheduler(ctx: &Runtime, args: LoopArgs) -> Result<ExitCode> {
    let mut config = (*ctx.config).clone();
    if let Some(interval) = args.interval_seconds {
        config.scheduler.tick_interval_seconds = interval.max(1);
    }
    let scheduler = SyncScheduler::new(Arc::new(config), ctx.db.clone());

    if args.once || args.dry_run {
        let report = scheduler.run_once(args.dry_run).await?;
        if args.json {
            print_json(&report)?;
        } else {
            println!(
                "planned {} job(s), enqueued {}, duplicates {}, breakers updated {}{}",
                report.planned.len(),
                report.enqueued.len(),
                report.duplicates,
                report.breakers_updated.len(),
                if report.dry_run { " (dry run)" } else { "" }
            );
            for (reason, count) in &report.skipped {
                println!("  skipped {reason:?}: {count}");
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    let shutdown = shutdown_on_ctrl_c();
    spawn_metrics(ctx, &shutdown)?;
    scheduler.run(shutdown).await?;
    Ok(ExitCode::SUCCESS)
}

async fn run_worker(ctx: &Runtime, args: WorkerArgs) -> Result<ExitCode> {
    let registry = Arc::new(SourceRegistry::for_config(&ctx.config));
    if registry.is_empty() {
        warn!("No sources registered; claimed jobs will be dead-lettered");
    }
    let worker_id = args.worker_id.unwrap_or_else(|| {
        format!(
            "worker-{}-{}",
            std::process::id(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        )
    });
    let filter = ClaimFilter {
        instances: args.instance_allowlist,
        tenants: args.tenant_allowlist,
        ..ClaimFilter::default()
    };
    let worker = SyncWorker::new(ctx.db.clone(), ctx.config.clone(), registry, worker_id)
        .with_filter(filter);

    if args.once {
        let outcomes = worker.run_once().await?;
        if args.json {
            print_json(&outcomes)?;
        } else {
            println!("processed {} job(s)", outcomes.len());
            for outcome in &outcomes {
                println!("  {} {}", outcome.job_id(), outcome.label());
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    let shutdown = shutdown_on_ctrl_c();
    spawn_metrics(ctx, &shutdown)?;
    worker.run(shutdown).await;
    Ok(ExitCode::SUCCESS)
}

async fn run_reaper(ctx: &Runtime, args: LoopArgs) -> Result<ExitCode> {
    let mut config = (*ctx.config).clone();
    if let Some(interval) = args.interval_seconds {
        config.reaper.tick_interval_seconds = interval.max(1);
    }
    let reaper = SyncReaper::new(Arc::new(config), ctx.db.clone());

    if args.once || args.dry_run {
        let report = reaper.tick(args.dry_run).await?;
        if args.json {
            print_json(&report)?;
        } else {
            println!(
                "reclaimed {} job(s), dead-lettered {}, expired locks {}, orphaned locks {}, abandoned runs {}, pruned runs {}, expired pauses {}{}",
                report.reclaimed_jobs.len(),
                report.dead_lettered_jobs.len(),
                report.expired_locks.len(),
                report.orphaned_locks.len(),
                report.abandoned_runs.len(),
                report.pruned_runs,
                report.expired_pauses,
                if report.dry_run { " (dry run)" } else { "" }
            );
        }
        return Ok(ExitCode::SUCCESS);
    }

    let shutdown = shutdown_on_ctrl_c();
    spawn_metrics(ctx, &shutdown)?;
    reaper.run(shutdown).await;
    Ok(ExitCode::SUCCESS)
}

async fn run_status(ctx: &Runtime, args: StatusArgs) -> Result<ExitCode> {
    let service = StatusService::new(ctx.config.clone(), ctx.db.clone());
    let snapshot = service.snapshot(args.grace_seconds).await?;
    let health = args
        .health
        .then(|| evaluate_health(&snapshot, &ctx.config));

    match args.format() {
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct StatusOutput<'a> {
                #[serde(flatten)]
                snapshot: &'a crate::status::StatusSnapshot,
                #[serde(skip_serializing_if = "Option::is_none")]
                health: Option<&'a crate::status::HealthReport>,
            }
            print_json(&StatusOutput {
                snapshot: &snapshot,
                health: health.as_ref(),
            })?;
        }
        OutputFormat::Prometheus => print!("{}", render_prometheus(&snapshot, health.as_ref())),
        OutputFormat::Text => print!(
            "{}",
            render_text(&snapshot, health.as_ref(), args.include_details)
        ),
    }

    Ok(ExitCode::from(
        health.map(|report| report.exit_code).unwrap_or(0),
    ))
}

async fn run_runner(ctx: &Runtime, args: RunnerArgs) -> Result<ExitCode> {
    let registry = Arc::new(SourceRegistry::for_config(&ctx.config));
    let runner = SyncRunner::new(ctx.config.clone(), ctx.db.clone(), registry);
    let report = runner
        .run(&args.repo, args.mode.into(), args.job_type, args.dry_run)
        .await?;
    if args.json {
        print_json(&report)?;
    } else {
        println!(
            "{} {} ({}){}",
            report.mode,
            report.repo_key,
            report.repo_id,
            if report.dry_run { " dry run" } else { "" }
        );
        for result in &report.results {
            let outcomes: Vec<&str> = result.outcomes.iter().map(|o| o.label()).collect();
            println!(
                "  {:<15} {} [{}]",
                result.job_type.as_str(),
                if result.succeeded { "ok" } else { "failed" },
                outcomes.join(", ")
            );
        }
    }
    Ok(ExitCode::from(report.exit_code()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn worker_allowlists_split_on_commas() {
        let cli = Cli::parse_from([
            "scm-sync",
            "worker",
            "--worker-id",
            "w1",
            "--instance-allowlist",
            "gitlab.a.com,gitlab.b.com",
        ]);
        let Command::Worker(args) = cli.command else {
            panic!("expected worker command");
        };
        assert_eq!(args.worker_id.as_deref(), Some("w1"));
        assert_eq!(args.instance_allowlist, vec!["gitlab.a.com", "gitlab.b.com"]);
        assert!(args.tenant_allowlist.is_empty());
    }

    #[test]
    fn runner_parses_mode_and_job_type() {
        let cli = Cli::parse_from([
            "scm-sync",
            "--metrics-bind",
            "127.0.0.1:9100",
            "runner",
            "backfill",
            "--repo",
            "group/project",
            "--job",
            "merge_requests",
        ]);
        assert_eq!(cli.metrics_bind.as_deref(), Some("127.0.0.1:9100"));
        let Command::Runner(args) = cli.command else {
            panic!("expected runner command");
        };
        assert!(matches!(args.mode, RunnerMode::Backfill));
        assert_eq!(args.job_type, Some(JobType::MergeRequests));
    }

    #[test]
    fn commands_name_their_role() {
        let role = |args: &[&str]| Cli::parse_from(args).command.role();
        assert_eq!(role(&["scm-sync", "reaper", "--once"]), "reaper");
        assert_eq!(role(&["scm-sync", "admin", "breakers", "list"]), "admin");
        assert_eq!(role(&["scm-sync", "migrate"]), "migrate");
    }

    #[test]
    fn status_rejects_two_formats() {
        assert!(Cli::try_parse_from(["scm-sync", "status", "--json", "--prometheus"]).is_err());
    }
}
