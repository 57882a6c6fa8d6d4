//! # Reaper
//!
//! Periodic cleanup of state left behind by crashed or stalled workers:
//! expired job leases, expired and orphaned key locks, runs that will never
//! be finalized, old run history and lapsed operator pauses. Every action is
//! conditioned on the stored expiry or owner, so concurrent reapers and late
//! workers are harmless.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tokio::time::{Duration as TokioDuration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::EngineResult;
use crate::lock::LockManager;
use crate::queue::JobQueue;
use crate::repositories::{PauseRepository, RunRepository};
use crate::run_finish::RunFinish;
use crate::types::JobStatus;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReaperReport {
    pub dry_run: bool,
    pub reclaimed_jobs: Vec<Uuid>,
    pub dead_lettered_jobs: Vec<Uuid>,
    pub expired_locks: Vec<Uuid>,
    pub orphaned_locks: Vec<Uuid>,
    pub abandoned_runs: Vec<Uuid>,
    pub pruned_runs: u64,
    pub expired_pauses: u64,
}

impl ReaperReport {
    pub fn is_empty(&self) -> bool {
        self.reclaimed_jobs.is_empty()
            && self.dead_lettered_jobs.is_empty()
            && self.expired_locks.is_empty()
            && self.orphaned_locks.is_empty()
            && self.abandoned_runs.is_empty()
            && self.pruned_runs == 0
            && self.expired_pauses == 0
    }
}

#[derive(Debug, Clone)]
pub struct SyncReaper {
    config: Arc<AppConfig>,
    queue: JobQueue,
    locks: LockManager,
    runs: RunRepository,
    pauses: PauseRepository,
}

impl SyncReaper {
    pub fn new(config: Arc<AppConfig>, db: Arc<DatabaseConnection>) -> Self {
        Self {
            queue: JobQueue::new(db.clone(), config.queue.clone(), config.retry.clone()),
            locks: LockManager::new(db.clone()),
            runs: RunRepository::new(db.clone()),
            pauses: PauseRepository::new(db),
            config,
        }
    }

    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            grace_seconds = self.config.reaper.grace_seconds,
            "Starting reaper"
        );
        let mut ticker = tokio::time::interval(TokioDuration::from_secs(
            self.config.reaper.tick_interval_seconds,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let started = Instant::now();
                    if let Err(err) = self.tick(false).await {
                        error!(error = %err, "Reaper tick failed");
                    }
                    histogram!("scm_sync_reaper_tick_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                }
            }
        }
        info!("Reaper stopped");
    }

    pub async fn tick(&self, dry_run: bool) -> EngineResult<ReaperReport> {
        self.tick_at(Utc::now(), dry_run).await
    }

    #[instrument(skip(self, now))]
    pub async fn tick_at(&self, now: DateTime<Utc>, dry_run: bool) -> EngineResult<ReaperReport> {
        let grace = self.config.reaper.grace_seconds;
        let mut report = ReaperReport {
            dry_run,
            ..ReaperReport::default()
        };

        let reclaimed = self.queue.reclaim_expired_at(grace, dry_run, now).await?;
        report.reclaimed_jobs = reclaimed.reclaimed;
        report.dead_lettered_jobs = reclaimed.dead_lettered;

        self.reap_locks(grace, dry_run, now, &mut report).await?;
        self.reap_abandoned_runs(grace, dry_run, now, &mut report).await?;

        let retention_cutoff =
            now - Duration::days(i64::from(self.config.reaper.run_retention_days));
        report.pruned_runs = if dry_run {
            self.runs.count_finished_before(retention_cutoff).await?
        } else {
            self.runs.prune_finished_before(retention_cutoff).await?
        };

        report.expired_pauses = if dry_run {
            self.pauses.list_expired(now).await?.len() as u64
        } else {
            self.pauses.delete_expired(now).await?
        };

        if !dry_run {
            counter!("scm_sync_reaper_reclaimed_total")
                .increment(report.reclaimed_jobs.len() as u64);
            counter!("scm_sync_reaper_locks_deleted_total")
                .increment((report.expired_locks.len() + report.orphaned_locks.len()) as u64);
            counter!("scm_sync_reaper_runs_pruned_total").increment(report.pruned_runs);
        }
        if !report.is_empty() {
            info!(
                dry_run,
                reclaimed = report.reclaimed_jobs.len(),
                dead_lettered = report.dead_lettered_jobs.len(),
                expired_locks = report.expired_locks.len(),
                orphaned_locks = report.orphaned_locks.len(),
                abandoned_runs = report.abandoned_runs.len(),
                pruned_runs = report.pruned_runs,
                expired_pauses = report.expired_pauses,
                "Reaper tick completed"
            );
        }
        Ok(report)
    }

    async fn reap_locks(
        &self,
        grace_seconds: u64,
        dry_run: bool,
        now: DateTime<Utc>,
        report: &mut ReaperReport,
    ) -> EngineResult<()> {
        let cutoff = now - Duration::seconds(grace_seconds as i64);
        let mut handled = HashSet::new();

        for lock in self.locks.list_expired_at(grace_seconds, now).await? {
            handled.insert(lock.lock_id);
            if dry_run || self.locks.delete_if_expired(lock.lock_id, cutoff).await? {
                warn!(
                    lock_id = %lock.lock_id,
                    repo_id = lock.repo_id,
                    job_type = %lock.job_type,
                    holder = %lock.locked_by,
                    dry_run,
                    "Expired lock reaped"
                );
                report.expired_locks.push(lock.lock_id);
            }
        }

        for lock in self.locks.list_orphaned().await? {
            if handled.contains(&lock.lock_id) {
                continue;
            }
            if dry_run || self.locks.delete_if_held_by(lock.lock_id, &lock.locked_by).await? {
                warn!(
                    lock_id = %lock.lock_id,
                    repo_id = lock.repo_id,
                    job_type = %lock.job_type,
                    holder = %lock.locked_by,
                    dry_run,
                    "Orphaned lock reaped"
                );
                report.orphaned_locks.push(lock.lock_id);
            }
        }
        Ok(())
    }

    /// Open runs whose execution can no longer finish them: the job left
    /// `running`, or was claimed again after the run started. Runs younger
    /// than the grace period are left to their worker.
    async fn reap_abandoned_runs(
        &self,
        grace_seconds: u64,
        dry_run: bool,
        now: DateTime<Utc>,
        report: &mut ReaperReport,
    ) -> EngineResult<()> {
        let started_cutoff = now - Duration::seconds(grace_seconds as i64);
        for run in self.runs.list_open().await? {
            if run.started_at.with_timezone(&Utc) > started_cutoff {
                continue;
            }
            let job = self.queue.find(run.job_id).await?;
            let abandoned = match &job {
                None => true,
                Some(job) => {
                    job.status().ok() != Some(JobStatus::Running)
                        || job
                            .locked_at
                            .is_some_and(|locked_at| locked_at > run.started_at)
                }
            };
            if !abandoned {
                continue;
            }
            let finalized = dry_run
                || self
                    .runs
                    .finalize_at(
                        run.run_id,
                        &RunFinish::lease_lost("run abandoned by its worker"),
                        now,
                    )
                    .await?;
            if finalized {
                report.abandoned_runs.push(run.run_id);
            }
        }
        Ok(())
    }
}
