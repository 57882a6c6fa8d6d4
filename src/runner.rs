//! # Runner
//!
//! One-shot synchronization of a single repository: enqueue an incremental or
//! backfill job per job type, then drive it (and any follow-up pages) through
//! the regular worker path in-process.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::AppConfig;
use crate::error::EngineResult;
use crate::models::sync_repository;
use crate::queue::{ClaimFilter, EnqueueOutcome, EnqueueRequest};
use crate::repositories::{CursorRepository, RepositoryCatalog};
use crate::scheduler::planned_job_types;
use crate::sources::SourceRegistry;
use crate::types::{JobMode, JobPayload, JobType, SourceKind, Watermark};
use crate::worker::{JobOutcome, SyncWorker};

/// Upper bound on follow-up pages driven for one job type.
const MAX_PASSES: usize = 500;

#[derive(Debug, Clone, Serialize)]
pub struct JobTypeResult {
    pub job_type: JobType,
    pub payload: JobPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enqueue: Option<EnqueueOutcome>,
    pub outcomes: Vec<JobOutcome>,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunnerReport {
    pub repo_id: i64,
    pub repo_key: String,
    pub mode: JobMode,
    pub dry_run: bool,
    pub results: Vec<JobTypeResult>,
}

impl RunnerReport {
    /// 0 when every job type succeeded, 1 when some did, 2 when none did.
    pub fn exit_code(&self) -> u8 {
        if self.dry_run {
            return 0;
        }
        let succeeded = self.results.iter().filter(|r| r.succeeded).count();
        if succeeded == self.results.len() {
            0
        } else if succeeded > 0 {
            1
        } else {
            2
        }
    }
}

/// Payload for an operator-requested job. Backfills of timestamp sources
/// replay the last `backfill_days`; SVN backfills replay from the first
/// revision up to the stored cursor, or to head when there is none.
pub fn runner_payload(
    repo: &sync_repository::Model,
    kind: SourceKind,
    mode: JobMode,
    cursor: Option<&Watermark>,
    backfill_days: u32,
    now: DateTime<Utc>,
) -> JobPayload {
    let mut payload = JobPayload {
        gitlab_instance: repo.gitlab_instance.clone(),
        tenant_id: repo.tenant_id.clone(),
        is_backfill_only: mode == JobMode::Backfill,
        ..JobPayload::default()
    };
    if mode != JobMode::Backfill {
        return payload;
    }
    if kind.uses_revisions() {
        payload.start_rev = Some(0);
        payload.end_rev = match cursor {
            Some(Watermark::Revision(rev)) => Some(*rev),
            _ => None,
        };
    } else {
        payload.since = Some(now - Duration::days(i64::from(backfill_days)));
        payload.until = Some(now);
    }
    payload
}

pub struct SyncRunner {
    config: Arc<AppConfig>,
    catalog: RepositoryCatalog,
    cursors: CursorRepository,
    worker: SyncWorker,
}

impl SyncRunner {
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<DatabaseConnection>,
        registry: Arc<SourceRegistry>,
    ) -> Self {
        let worker_id = format!("runner-{}", std::process::id());
        Self {
            catalog: RepositoryCatalog::new(db.clone()),
            cursors: CursorRepository::new(db.clone()),
            worker: SyncWorker::new(db, config.clone(), registry, worker_id),
            config,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(
        &self,
        repo: &str,
        mode: JobMode,
        job_type: Option<JobType>,
        dry_run: bool,
    ) -> EngineResult<RunnerReport> {
        let repository = self.catalog.resolve(repo).await?;
        let kind = repository.source_kind()?;
        let job_types = match job_type {
            Some(job_type) => vec![job_type],
            None => planned_job_types(kind, &self.config.scheduler.job_types),
        };
        let now = Utc::now();

        let mut results = Vec::with_capacity(job_types.len());
        for job_type in job_types {
            let cursor = self
                .cursors
                .get(repository.repo_id, job_type)
                .await?
                .and_then(|stored| stored.watermark());
            let payload = runner_payload(
                &repository,
                kind,
                mode,
                cursor.as_ref(),
                self.config.scheduler.initial_backfill_days,
                now,
            );
            if dry_run {
                results.push(JobTypeResult {
                    job_type,
                    payload,
                    enqueue: None,
                    outcomes: Vec::new(),
                    succeeded: true,
                });
                continue;
            }
            results.push(
                self.run_job_type(repository.repo_id, job_type, mode, payload)
                    .await?,
            );
        }

        let report = RunnerReport {
            repo_id: repository.repo_id,
            repo_key: repository.repo_key,
            mode,
            dry_run,
            results,
        };
        info!(
            repo_id = report.repo_id,
            exit_code = report.exit_code(),
            "Runner finished"
        );
        Ok(report)
    }

    async fn run_job_type(
        &self,
        repo_id: i64,
        job_type: JobType,
        mode: JobMode,
        payload: JobPayload,
    ) -> EngineResult<JobTypeResult> {
        let request = EnqueueRequest::new(repo_id, job_type, mode).with_payload(payload.clone());
        let enqueue = self.worker.queue().enqueue(request).await?;
        if !enqueue.is_enqueued() {
            warn!(
                repo_id,
                job_type = %job_type,
                existing_job_id = %enqueue.job_id(),
                "Active job already exists; driving it instead"
            );
        }

        let filter = ClaimFilter {
            repo_id: Some(repo_id),
            job_types: vec![job_type],
            ..ClaimFilter::default()
        };
        let mut outcomes = Vec::new();
        let mut succeeded = false;
        for _ in 0..MAX_PASSES {
            let Some(job) = self
                .worker
                .queue()
                .claim(self.worker.worker_id(), &filter, 1)
                .await?
                .into_iter()
                .next()
            else {
                break;
            };
            let outcome = self.worker.process_job(job).await?;
            let follow_up = match &outcome {
                JobOutcome::Completed {
                    follow_up_job_id, ..
                } => {
                    succeeded = true;
                    follow_up_job_id.is_some()
                }
                _ => {
                    succeeded = false;
                    false
                }
            };
            outcomes.push(outcome);
            if !follow_up {
                break;
            }
        }

        Ok(JobTypeResult {
            job_type,
            payload,
            enqueue: Some(enqueue),
            outcomes,
            succeeded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunCounts;
    use uuid::Uuid;

    fn result(succeeded: bool) -> JobTypeResult {
        JobTypeResult {
            job_type: JobType::Commits,
            payload: JobPayload::default(),
            enqueue: None,
            outcomes: vec![JobOutcome::Completed {
                job_id: Uuid::new_v4(),
                run_id: Uuid::new_v4(),
                status: crate::types::RunStatus::Completed,
                counts: RunCounts::default(),
                follow_up_job_id: None,
            }],
            succeeded,
        }
    }

    fn report(results: Vec<JobTypeResult>) -> RunnerReport {
        RunnerReport {
            repo_id: 1,
            repo_key: "group/project".to_string(),
            mode: JobMode::Incremental,
            dry_run: false,
            results,
        }
    }

    #[test]
    fn exit_code_reflects_partial_success() {
        assert_eq!(report(vec![result(true), result(true)]).exit_code(), 0);
        assert_eq!(report(vec![result(true), result(false)]).exit_code(), 1);
        assert_eq!(report(vec![result(false)]).exit_code(), 2);
    }
}
