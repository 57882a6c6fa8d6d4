use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::{DateTime, Duration, Utc};
use clap::Subcommand;
use sea_orm::DatabaseConnection;
use uuid::Uuid;

use super::print_json;
use crate::admin::{AdminChange, AdminService};
use crate::config::AppConfig;
use crate::queue::{JobListFilter, ResetDeadFilter};
use crate::types::{JobStatus, JobType};

#[derive(Debug, Subcommand)]
pub enum AdminCommand {
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },
    Locks {
        #[command(subcommand)]
        command: LocksCommand,
    },
    Pauses {
        #[command(subcommand)]
        command: PausesCommand,
    },
    Cursors {
        #[command(subcommand)]
        command: CursorsCommand,
    },
    RateLimit {
        #[command(subcommand)]
        command: RateLimitCommand,
    },
    Breakers {
        #[command(subcommand)]
        command: BreakersCommand,
    },
}

#[derive(Debug, clap::Args)]
pub struct Common {
    #[arg(long)]
    pub dry_run: bool,
    #[arg(long)]
    pub json: bool,
    /// Recorded in the audit log; defaults to `$USER`.
    #[arg(long)]
    pub actor: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum JobsCommand {
    List {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long)]
        repo_id: Option<i64>,
        #[arg(long = "job")]
        job_type: Option<JobType>,
        #[arg(long, default_value_t = 100)]
        limit: u64,
        #[command(flatten)]
        common: Common,
    },
    ResetDead {
        #[arg(long)]
        job_id: Option<Uuid>,
        #[arg(long)]
        repo_id: Option<i64>,
        #[arg(long = "job")]
        job_type: Option<JobType>,
        #[arg(long)]
        gitlab_instance: Option<String>,
        /// Required to reset every dead job at once.
        #[arg(long)]
        all: bool,
        #[command(flatten)]
        common: Common,
    },
    MarkDead {
        #[arg(long)]
        job_id: Uuid,
        #[arg(long)]
        reason: String,
        #[command(flatten)]
        common: Common,
    },
}

#[derive(Debug, Subcommand)]
pub enum LocksCommand {
    List {
        #[command(flatten)]
        common: Common,
    },
    ListExpired {
        #[arg(long)]
        grace_seconds: Option<u64>,
        #[command(flatten)]
        common: Common,
    },
    ForceRelease {
        #[arg(long)]
        lock_id: Uuid,
        #[command(flatten)]
        common: Common,
    },
}

#[derive(Debug, Subcommand)]
pub enum PausesCommand {
    List {
        #[command(flatten)]
        common: Common,
    },
    Set {
        #[arg(long)]
        repo: String,
        #[arg(long = "job")]
        job_type: JobType,
        #[arg(long)]
        reason: String,
        /// RFC 3339 end of the pause; open-ended when omitted.
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        #[command(flatten)]
        common: Common,
    },
    Unset {
        #[arg(long)]
        repo: String,
        #[arg(long = "job")]
        job_type: JobType,
        #[command(flatten)]
        common: Common,
    },
}

#[derive(Debug, Subcommand)]
pub enum CursorsCommand {
    List {
        #[arg(long)]
        repo: Option<String>,
        #[command(flatten)]
        common: Common,
    },
    Get {
        #[arg(long)]
        repo: String,
        #[arg(long = "job")]
        job_type: JobType,
        #[command(flatten)]
        common: Common,
    },
    Set {
        #[arg(long)]
        repo: String,
        #[arg(long = "job")]
        job_type: JobType,
        /// RFC 3339 timestamp, or `r<N>` / `<N>` for revisions.
        #[arg(long)]
        watermark: String,
        #[command(flatten)]
        common: Common,
    },
    Delete {
        #[arg(long)]
        repo: String,
        #[arg(long = "job")]
        job_type: JobType,
        #[command(flatten)]
        common: Common,
    },
}

#[derive(Debug, Subcommand)]
pub enum RateLimitCommand {
    Buckets {
        #[command(subcommand)]
        command: BucketsCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum BucketsCommand {
    List {
        #[command(flatten)]
        common: Common,
    },
    Pause {
        #[arg(long)]
        instance: String,
        #[arg(long, conflicts_with = "until")]
        seconds: Option<i64>,
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        #[arg(long, default_value = "operator")]
        reason: String,
        #[command(flatten)]
        common: Common,
    },
    Unpause {
        #[arg(long)]
        instance: String,
        #[command(flatten)]
        common: Common,
    },
}

#[derive(Debug, Subcommand)]
pub enum BreakersCommand {
    List {
        #[command(flatten)]
        common: Common,
    },
    Reset {
        /// `global` or `instance:<host>`.
        #[arg(long)]
        key: String,
        #[command(flatten)]
        common: Common,
    },
}

fn service(config: &Arc<AppConfig>, db: &Arc<DatabaseConnection>, common: &Common) -> AdminService {
    let actor = common
        .actor
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "operator".to_string());
    AdminService::new(config.clone(), db.clone(), actor)
}

fn print_change(change: &AdminChange, json: bool) -> Result<ExitCode> {
    if json {
        print_json(change)?;
    } else {
        println!(
            "{}{}: {} {}",
            change.action,
            if change.dry_run { " (dry run)" } else { "" },
            if change.applied { "applied" } else { "no change" },
            change.target
        );
    }
    Ok(ExitCode::SUCCESS)
}

pub(super) async fn run(
    config: &Arc<AppConfig>,
    db: &Arc<DatabaseConnection>,
    command: AdminCommand,
) -> Result<ExitCode> {
    match command {
        AdminCommand::Jobs { command } => run_jobs(config, db, command).await,
        AdminCommand::Locks { command } => run_locks(config, db, command).await,
        AdminCommand::Pauses { command } => run_pauses(config, db, command).await,
        AdminCommand::Cursors { command } => run_cursors(config, db, command).await,
        AdminCommand::RateLimit {
            command: RateLimitCommand::Buckets { command },
        } => run_buckets(config, db, command).await,
        AdminCommand::Breakers { command } => run_breakers(config, db, command).await,
    }
}

async fn run_jobs(
    config: &Arc<AppConfig>,
    db: &Arc<DatabaseConnection>,
    command: JobsCommand,
) -> Result<ExitCode> {
    match command {
        JobsCommand::List {
            status,
            repo_id,
            job_type,
            limit,
            common,
        } => {
            let jobs = service(config, db, &common)
                .list_jobs(&JobListFilter {
                    status,
                    repo_id,
                    job_type,
                    limit: Some(limit),
                })
                .await?;
            if common.json {
                print_json(&jobs)?;
            } else {
                for job in &jobs {
                    println!(
                        "{} repo={} type={} mode={} status={} attempts={} owner={}",
                        job.job_id,
                        job.repo_id,
                        job.job_type,
                        job.mode,
                        job.status,
                        job.attempts,
                        job.locked_by.as_deref().unwrap_or("-")
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        JobsCommand::ResetDead {
            job_id,
            repo_id,
            job_type,
            gitlab_instance,
            all,
            common,
        } => {
            let filter = ResetDeadFilter {
                job_id,
                repo_id,
                job_type,
                gitlab_instance,
            };
            let unfiltered = filter.job_id.is_none()
                && filter.repo_id.is_none()
                && filter.job_type.is_none()
                && filter.gitlab_instance.is_none();
            if unfiltered && !all {
                bail!("refusing to reset every dead job without --all");
            }
            let report = service(config, db, &common)
                .reset_dead(&filter, common.dry_run)
                .await?;
            if common.json {
                print_json(&report)?;
            } else {
                println!(
                    "reset {} dead job(s), skipped {}{}",
                    report.reset.len(),
                    report.skipped.len(),
                    if common.dry_run { " (dry run)" } else { "" }
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        JobsCommand::MarkDead {
            job_id,
            reason,
            common,
        } => {
            let change = service(config, db, &common)
                .mark_dead(job_id, &reason, common.dry_run)
                .await?;
            print_change(&change, common.json)
        }
    }
}

async fn run_locks(
    config: &Arc<AppConfig>,
    db: &Arc<DatabaseConnection>,
    command: LocksCommand,
) -> Result<ExitCode> {
    let (locks, json) = match command {
        LocksCommand::List { common } => (service(config, db, &common).list_locks().await?, common.json),
        LocksCommand::ListExpired {
            grace_seconds,
            common,
        } => (
            service(config, db, &common)
                .list_expired_locks(grace_seconds)
                .await?,
            common.json,
        ),
        LocksCommand::ForceRelease { lock_id, common } => {
            let change = service(config, db, &common)
                .force_release(lock_id, common.dry_run)
                .await?;
            return print_change(&change, common.json);
        }
    };
    if json {
        print_json(&locks)?;
    } else {
        for lock in &locks {
            println!(
                "{} repo={} type={} holder={} expires={}",
                lock.lock_id,
                lock.repo_id,
                lock.job_type,
                lock.locked_by,
                lock.expires_at.to_rfc3339()
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_pauses(
    config: &Arc<AppConfig>,
    db: &Arc<DatabaseConnection>,
    command: PausesCommand,
) -> Result<ExitCode> {
    match command {
        PausesCommand::List { common } => {
            let pauses = service(config, db, &common).list_pauses().await?;
            if common.json {
                print_json(&pauses)?;
            } else {
                for pause in &pauses {
                    println!(
                        "repo={} type={} reason={} until={} by={}",
                        pause.repo_id,
                        pause.job_type,
                        pause.reason,
                        pause
                            .paused_until
                            .map(|until| until.to_rfc3339())
                            .unwrap_or_else(|| "-".to_string()),
                        pause.created_by
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        PausesCommand::Set {
            repo,
            job_type,
            reason,
            until,
            common,
        } => {
            let change = service(config, db, &common)
                .set_pause(&repo, job_type, &reason, until, common.dry_run)
                .await?;
            print_change(&change, common.json)
        }
        PausesCommand::Unset {
            repo,
            job_type,
            common,
        } => {
            let change = service(config, db, &common)
                .unset_pause(&repo, job_type, common.dry_run)
                .await?;
            print_change(&change, common.json)
        }
    }
}

async fn run_cursors(
    config: &Arc<AppConfig>,
    db: &Arc<DatabaseConnection>,
    command: CursorsCommand,
) -> Result<ExitCode> {
    match command {
        CursorsCommand::List { repo, common } => {
            let cursors = service(config, db, &common)
                .list_cursors(repo.as_deref())
                .await?;
            if common.json {
                print_json(&cursors)?;
            } else {
                for cursor in &cursors {
                    println!(
                        "repo={} type={} watermark={} updated={}",
                        cursor.repo_id,
                        cursor.job_type,
                        cursor
                            .watermark
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_else(|| "corrupt".to_string()),
                        cursor.updated_at.to_rfc3339()
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        CursorsCommand::Get {
            repo,
            job_type,
            common,
        } => {
            let cursor = service(config, db, &common)
                .get_cursor(&repo, job_type)
                .await?;
            if common.json {
                print_json(&cursor)?;
            } else {
                match &cursor {
                    Some(cursor) => println!(
                        "{}",
                        cursor
                            .watermark
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_else(|| "corrupt".to_string())
                    ),
                    None => println!("no cursor"),
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        CursorsCommand::Set {
            repo,
            job_type,
            watermark,
            common,
        } => {
            let change = service(config, db, &common)
                .set_cursor(&repo, job_type, &watermark, common.dry_run)
                .await?;
            print_change(&change, common.json)
        }
        CursorsCommand::Delete {
            repo,
            job_type,
            common,
        } => {
            let change = service(config, db, &common)
                .delete_cursor(&repo, job_type, common.dry_run)
                .await?;
            print_change(&change, common.json)
        }
    }
}

async fn run_buckets(
    config: &Arc<AppConfig>,
    db: &Arc<DatabaseConnection>,
    command: BucketsCommand,
) -> Result<ExitCode> {
    match command {
        BucketsCommand::List { common } => {
            let buckets = service(config, db, &common).list_buckets().await?;
            if common.json {
                print_json(&buckets)?;
            } else {
                for bucket in &buckets {
                    println!(
                        "{} paused_until={} reason={}",
                        bucket.bucket_key,
                        bucket
                            .paused_until
                            .map(|until| until.to_rfc3339())
                            .unwrap_or_else(|| "-".to_string()),
                        bucket.reason.as_deref().unwrap_or("-")
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        BucketsCommand::Pause {
            instance,
            seconds,
            until,
            reason,
            common,
        } => {
            let until = match (until, seconds) {
                (Some(until), _) => until,
                (None, Some(seconds)) => Utc::now() + Duration::seconds(seconds),
                (None, None) => bail!("either --until or --seconds is required"),
            };
            let change = service(config, db, &common)
                .pause_bucket(&instance, until, &reason, common.dry_run)
                .await?;
            print_change(&change, common.json)
        }
        BucketsCommand::Unpause { instance, common } => {
            let change = service(config, db, &common)
                .unpause_bucket(&instance, common.dry_run)
                .await?;
            print_change(&change, common.json)
        }
    }
}

async fn run_breakers(
    config: &Arc<AppConfig>,
    db: &Arc<DatabaseConnection>,
    command: BreakersCommand,
) -> Result<ExitCode> {
    match command {
        BreakersCommand::List { common } => {
            let breakers = service(config, db, &common).list_breakers().await?;
            if common.json {
                print_json(&breakers)?;
            } else {
                for breaker in &breakers {
                    println!(
                        "{} state={} failure={:.2} rate_limit={:.2} timeout={:.2} reason={}",
                        breaker.key,
                        breaker.state,
                        breaker.rates.failure_rate,
                        breaker.rates.rate_limit_rate,
                        breaker.rates.timeout_rate,
                        breaker.last_failure_reason.as_deref().unwrap_or("-")
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        BreakersCommand::Reset { key, common } => {
            let change = service(config, db, &common)
                .reset_breaker(&key, common.dry_run)
                .await?;
            print_change(&change, common.json)
        }
    }
}
