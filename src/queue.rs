//! # Job Queue
//!
//! Durable job queue over `sync_jobs`. Claiming is lease based: a claimed
//! job belongs to one worker until the worker resolves it or its lease
//! expires. Every worker-facing resolution is conditioned on
//! `locked_by = worker_id AND status = 'running'`, so a stale worker's late
//! call is a no-op.
//!
//! Public methods use the current time; the `*_at` variants take `now`
//! explicitly so callers and tests control the clock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use sea_orm::prelude::Expr;
use sea_orm::sea_query::{LockBehavior, LockType};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{QueueConfig, RetryPolicyConfig};
use crate::db::to_db_time;
use crate::error::{EngineError, EngineResult, db_err, is_unique_violation};
use crate::lock::LockManager;
use crate::models::sync_job::{ActiveModel, Column, Entity as SyncJob, Model};
use crate::policy::retry_backoff;
use crate::repositories::{CursorRepository, RunRepository};
use crate::run_finish::RunFinish;
use crate::types::{ErrorCategory, ErrorSummary, JobMode, JobPayload, JobStatus, JobType};

/// A job to enqueue. Instance and tenant dimensions come from the payload.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub repo_id: i64,
    pub job_type: JobType,
    pub mode: JobMode,
    pub priority: i32,
    pub not_before: Option<DateTime<Utc>>,
    pub payload: JobPayload,
    pub max_attempts: Option<u32>,
}

impl EnqueueRequest {
    pub fn new(repo_id: i64, job_type: JobType, mode: JobMode) -> Self {
        Self {
            repo_id,
            job_type,
            mode,
            priority: 0,
            not_before: None,
            payload: JobPayload::default(),
            max_attempts: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: JobPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_not_before(mut self, not_before: DateTime<Utc>) -> Self {
        self.not_before = Some(not_before);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Enqueued { job_id: Uuid },
    Duplicate { existing_job_id: Uuid },
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueOutcome::Enqueued { job_id } => *job_id,
            EnqueueOutcome::Duplicate { existing_job_id } => *existing_job_id,
        }
    }

    pub fn is_enqueued(&self) -> bool {
        matches!(self, EnqueueOutcome::Enqueued { .. })
    }
}

/// Restricts which jobs a claim may return. Empty lists mean no restriction.
#[derive(Debug, Clone, Default)]
pub struct ClaimFilter {
    pub instances: Vec<String>,
    pub tenants: Vec<String>,
    pub repo_id: Option<i64>,
    pub job_types: Vec<JobType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum FailDisposition {
    Retrying {
        not_before: DateTime<Utc>,
        backoff_seconds: f64,
    },
    DeadLettered,
    /// The caller no longer owns the job.
    Rejected,
}

impl FailDisposition {
    pub fn applied(&self) -> bool {
        !matches!(self, FailDisposition::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum RequeueOutcome {
    /// Attempt refunded; contention counted.
    Requeued { not_before: DateTime<Utc> },
    /// Contention cap reached; the attempt was kept.
    Penalized { not_before: DateTime<Utc> },
    DeadLettered,
    Rejected,
}

impl RequeueOutcome {
    pub fn applied(&self) -> bool {
        !matches!(self, RequeueOutcome::Rejected)
    }
}

/// Successful result handed to [`JobQueue::ack_with_progress`].
#[derive(Debug, Clone)]
pub struct JobProgress {
    pub run_id: Uuid,
    pub finish: RunFinish,
}

#[derive(Debug, Clone, Default)]
pub struct JobListFilter {
    pub status: Option<JobStatus>,
    pub repo_id: Option<i64>,
    pub job_type: Option<JobType>,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct ResetDeadFilter {
    pub job_id: Option<Uuid>,
    pub repo_id: Option<i64>,
    pub job_type: Option<JobType>,
    pub gitlab_instance: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResetDeadReport {
    pub reset: Vec<Uuid>,
    /// Dead jobs left alone because their key already has an active job.
    pub skipped: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReclaimReport {
    pub reclaimed: Vec<Uuid>,
    pub dead_lettered: Vec<Uuid>,
}

#[derive(Debug, Clone)]
pub struct JobQueue {
    db: Arc<DatabaseConnection>,
    config: QueueConfig,
    retry: RetryPolicyConfig,
}

fn active_statuses() -> Vec<&'static str> {
    JobStatus::ACTIVE.iter().map(JobStatus::as_str).collect()
}

fn claimable(now: DateTime<Utc>) -> Condition {
    let now = to_db_time(now);
    Condition::any()
        .add(
            Condition::all()
                .add(Column::Status.eq(JobStatus::Pending.as_str()))
                .add(Column::NotBefore.lte(now)),
        )
        .add(
            Condition::all()
                .add(Column::Status.eq(JobStatus::Running.as_str()))
                .add(Column::LeaseExpiresAt.lt(now)),
        )
        .add(
            Condition::all()
                .add(Column::Status.eq(JobStatus::Failed.as_str()))
                .add(Column::NotBefore.lte(now))
                .add(Expr::col(Column::Attempts).lte(Expr::col(Column::MaxAttempts))),
        )
}

fn owned_running(job_id: Uuid, worker_id: &str) -> Condition {
    Condition::all()
        .add(Column::JobId.eq(job_id))
        .add(Column::LockedBy.eq(worker_id))
        .add(Column::Status.eq(JobStatus::Running.as_str()))
}

fn seconds(value: f64) -> Duration {
    Duration::milliseconds((value.max(0.0) * 1_000.0).round() as i64)
}

impl JobQueue {
    pub fn new(db: Arc<DatabaseConnection>, config: QueueConfig, retry: RetryPolicyConfig) -> Self {
        Self { db, config, retry }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub async fn enqueue(&self, request: EnqueueRequest) -> EngineResult<EnqueueOutcome> {
        self.enqueue_at(request, Utc::now()).await
    }

    /// Inserts a job unless its key already has an active one.
    pub async fn enqueue_at(
        &self,
        request: EnqueueRequest,
        now: DateTime<Utc>,
    ) -> EngineResult<EnqueueOutcome> {
        if let Some(existing) = self
            .find_active(request.repo_id, request.job_type)
            .await?
        {
            debug!(
                repo_id = request.repo_id,
                job_type = %request.job_type,
                existing_job_id = %existing.job_id,
                "Active job already exists; skipping enqueue"
            );
            return Ok(EnqueueOutcome::Duplicate {
                existing_job_id: existing.job_id,
            });
        }

        let job_id = Uuid::new_v4();
        let max_attempts = request.max_attempts.unwrap_or(self.config.max_attempts);
        let model = ActiveModel {
            job_id: Set(job_id),
            repo_id: Set(request.repo_id),
            job_type: Set(request.job_type.as_str().to_string()),
            mode: Set(request.mode.as_str().to_string()),
            status: Set(JobStatus::Pending.as_str().to_string()),
            attempts: Set(0),
            max_attempts: Set(max_attempts as i32),
            contention_count: Set(0),
            priority: Set(request.priority),
            not_before: Set(to_db_time(request.not_before.unwrap_or(now))),
            locked_by: Set(None),
            locked_at: Set(None),
            lease_seconds: Set(self.config.lease_seconds as i32),
            lease_expires_at: Set(None),
            payload: Set(request.payload.to_json()),
            gitlab_instance: Set(request.payload.gitlab_instance.clone()),
            tenant_id: Set(request.payload.tenant_id.clone()),
            last_error: Set(None),
            dead_reason: Set(None),
            created_at: Set(to_db_time(now)),
            updated_at: Set(to_db_time(now)),
        };

        match model.insert(self.db.as_ref()).await {
            Ok(job) => {
                info!(
                    job_id = %job.job_id,
                    repo_id = job.repo_id,
                    job_type = %job.job_type,
                    mode = %job.mode,
                    priority = job.priority,
                    "Sync job enqueued"
                );
                counter!(
                    "scm_sync_jobs_enqueued_total",
                    "job_type" => request.job_type.as_str(),
                    "mode" => request.mode.as_str()
                )
                .increment(1);
                Ok(EnqueueOutcome::Enqueued { job_id })
            }
            Err(err) if is_unique_violation(&err) => {
                let existing = self
                    .find_active(request.repo_id, request.job_type)
                    .await?
                    .ok_or_else(|| EngineError::Database {
                        context: "active job vanished after unique violation",
                        source: err,
                    })?;
                debug!(
                    repo_id = request.repo_id,
                    job_type = %request.job_type,
                    "Concurrent enqueue lost the active-key race"
                );
                Ok(EnqueueOutcome::Duplicate {
                    existing_job_id: existing.job_id,
                })
            }
            Err(err) => Err(db_err("failed to insert sync job")(err)),
        }
    }

    pub async fn claim(
        &self,
        worker_id: &str,
        filter: &ClaimFilter,
        limit: u64,
    ) -> EngineResult<Vec<Model>> {
        self.claim_at(worker_id, filter, limit, Utc::now()).await
    }

    /// Atomically claims up to `limit` eligible jobs for `worker_id`.
    ///
    /// Candidate rows are selected with `FOR UPDATE SKIP LOCKED` and the
    /// update re-checks eligibility, so concurrent claimers always receive
    /// disjoint sets.
    #[instrument(skip_all, fields(worker_id = %worker_id, limit = limit))]
    pub async fn claim_at(
        &self,
        worker_id: &str,
        filter: &ClaimFilter,
        limit: u64,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<Model>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let txn = self
            .db
            .begin()
            .await
            .map_err(db_err("failed to start claim transaction"))?;

        let mut query = SyncJob::find()
            .select_only()
            .column(Column::JobId)
            .filter(claimable(now));
        if !filter.instances.is_empty() {
            query = query.filter(Column::GitlabInstance.is_in(filter.instances.clone()));
        }
        if !filter.tenants.is_empty() {
            query = query.filter(Column::TenantId.is_in(filter.tenants.clone()));
        }
        if let Some(repo_id) = filter.repo_id {
            query = query.filter(Column::RepoId.eq(repo_id));
        }
        if !filter.job_types.is_empty() {
            query = query.filter(
                Column::JobType.is_in(filter.job_types.iter().map(JobType::as_str)),
            );
        }

        let candidate_ids = query
            .order_by_desc(Column::Priority)
            .order_by_asc(Column::NotBefore)
            .order_by_asc(Column::CreatedAt)
            .limit(limit)
            .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
            .into_tuple::<Uuid>()
            .all(&txn)
            .await
            .map_err(db_err("failed to select claimable jobs"))?;

        if candidate_ids.is_empty() {
            txn.commit()
                .await
                .map_err(db_err("failed to commit empty claim"))?;
            return Ok(Vec::new());
        }

        let locked_at = to_db_time(now);
        let lease_expires_at = to_db_time(now + Duration::seconds(self.config.lease_seconds as i64));

        SyncJob::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Running.as_str()))
            .col_expr(Column::LockedBy, Expr::value(worker_id))
            .col_expr(Column::LockedAt, Expr::value(locked_at))
            .col_expr(
                Column::LeaseSeconds,
                Expr::value(self.config.lease_seconds as i32),
            )
            .col_expr(Column::LeaseExpiresAt, Expr::value(lease_expires_at))
            .col_expr(Column::Attempts, Expr::col(Column::Attempts).add(1))
            .col_expr(Column::UpdatedAt, Expr::value(locked_at))
            .filter(Column::JobId.is_in(candidate_ids.clone()))
            .filter(claimable(now))
            .exec(&txn)
            .await
            .map_err(db_err("failed to mark jobs running"))?;

        let claimed = SyncJob::find()
            .filter(Column::JobId.is_in(candidate_ids))
            .filter(Column::LockedBy.eq(worker_id))
            .filter(Column::LockedAt.eq(locked_at))
            .filter(Column::Status.eq(JobStatus::Running.as_str()))
            .order_by_desc(Column::Priority)
            .order_by_asc(Column::NotBefore)
            .order_by_asc(Column::CreatedAt)
            .all(&txn)
            .await
            .map_err(db_err("failed to load claimed jobs"))?;

        txn.commit()
            .await
            .map_err(db_err("failed to commit claim"))?;

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "Claimed sync jobs");
            counter!("scm_sync_jobs_claimed_total").increment(claimed.len() as u64);
        }

        Ok(claimed)
    }

    pub async fn ack(&self, job_id: Uuid, worker_id: &str) -> EngineResult<bool> {
        self.ack_at(job_id, worker_id, Utc::now()).await
    }

    /// Completes a job without touching cursor, run or lock.
    pub async fn ack_at(
        &self,
        job_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let result = SyncJob::update_many()
            .set(completed(now))
            .filter(owned_running(job_id, worker_id))
            .exec(self.db.as_ref())
            .await
            .map_err(db_err("failed to ack job"))?;
        Ok(result.rows_affected == 1)
    }

    pub async fn ack_with_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        progress: &JobProgress,
    ) -> EngineResult<bool> {
        self.ack_with_progress_at(job_id, worker_id, progress, Utc::now())
            .await
    }

    /// Completes the job, advances its cursor, finalizes the run and releases
    /// the key lock in one transaction. Returns false, changing nothing, when
    /// the caller no longer owns the job.
    #[instrument(skip_all, fields(job_id = %job_id, worker_id = %worker_id))]
    pub async fn ack_with_progress_at(
        &self,
        job_id: Uuid,
        worker_id: &str,
        progress: &JobProgress,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        if !progress.finish.is_success() {
            return Err(EngineError::invalid(
                "ack_with_progress requires a successful run finish",
            ));
        }

        let txn = self
            .db
            .begin()
            .await
            .map_err(db_err("failed to start ack transaction"))?;

        let Some(job) = SyncJob::find()
            .filter(owned_running(job_id, worker_id))
            .one(&txn)
            .await
            .map_err(db_err("failed to load job for ack"))?
        else {
            txn.rollback()
                .await
                .map_err(db_err("failed to rollback ack transaction"))?;
            debug!("Ack rejected; job no longer owned by worker");
            return Ok(false);
        };
        let job_type = job.job_type()?;

        let completed_rows = SyncJob::update_many()
            .set(completed(now))
            .filter(owned_running(job_id, worker_id))
            .exec(&txn)
            .await
            .map_err(db_err("failed to complete job"))?
            .rows_affected;
        if completed_rows != 1 {
            txn.rollback()
                .await
                .map_err(db_err("failed to rollback ack transaction"))?;
            return Ok(false);
        }

        if let Some(watermark) = progress.finish.cursor_after() {
            CursorRepository::advance_in(
                &txn,
                job.repo_id,
                job_type,
                watermark,
                Some(progress.run_id),
                now,
            )
            .await?;
        }

        RunRepository::finalize_in(&txn, progress.run_id, &progress.finish, now).await?;
        LockManager::release_in(&txn, job.repo_id, job_type, worker_id).await?;

        txn.commit()
            .await
            .map_err(db_err("failed to commit ack transaction"))?;

        counter!("scm_sync_jobs_completed_total", "job_type" => job_type.as_str()).increment(1);
        Ok(true)
    }

    pub async fn fail_retry(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &ErrorSummary,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> EngineResult<FailDisposition> {
        self.fail_retry_at(job_id, worker_id, error, next_attempt_at, Utc::now())
            .await
    }

    /// Records a failed execution. The job is scheduled for retry at
    /// `next_attempt_at` or after a computed backoff, or dead-lettered when
    /// this was its last allowed attempt.
    #[instrument(skip_all, fields(job_id = %job_id, worker_id = %worker_id, category = %error.category))]
    pub async fn fail_retry_at(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &ErrorSummary,
        next_attempt_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> EngineResult<FailDisposition> {
        let Some(job) = self.find_owned(job_id, worker_id).await? else {
            return Ok(FailDisposition::Rejected);
        };

        if job.attempts_exhausted() {
            let dead = self
                .dead_letter(
                    job_id,
                    Some(worker_id),
                    error,
                    &format!("max attempts exceeded ({})", job.max_attempts),
                    now,
                )
                .await?;
            return Ok(if dead {
                FailDisposition::DeadLettered
            } else {
                FailDisposition::Rejected
            });
        }

        let prior_failures = (job.attempts - 1).max(0) as u32;
        let backoff_seconds = match next_attempt_at {
            Some(at) => (at - now).num_milliseconds().max(0) as f64 / 1_000.0,
            None => retry_backoff(
                error.category,
                prior_failures,
                error.suggested_backoff_seconds,
                &self.retry,
                job.gitlab_instance.as_deref(),
            ),
        };
        let not_before = next_attempt_at.unwrap_or_else(|| now + seconds(backoff_seconds));
        let recorded = error.clone().with_backoff(backoff_seconds);

        let result = SyncJob::update_many()
            .set(ActiveModel {
                status: Set(JobStatus::Failed.as_str().to_string()),
                not_before: Set(to_db_time(not_before)),
                locked_by: Set(None),
                locked_at: Set(None),
                lease_expires_at: Set(None),
                last_error: Set(Some(serde_json::to_value(&recorded)?)),
                updated_at: Set(to_db_time(now)),
                ..Default::default()
            })
            .filter(owned_running(job_id, worker_id))
            .exec(self.db.as_ref())
            .await
            .map_err(db_err("failed to record job failure"))?;

        if result.rows_affected != 1 {
            return Ok(FailDisposition::Rejected);
        }

        warn!(
            attempts = job.attempts,
            max_attempts = job.max_attempts,
            backoff_seconds,
            retry_at = %not_before,
            message = %error.message,
            "Sync job failed; retry scheduled"
        );
        counter!("scm_sync_jobs_retried_total", "category" => error.category.as_str())
            .increment(1);
        histogram!("scm_sync_retry_backoff_seconds", "category" => error.category.as_str())
            .record(backoff_seconds);

        Ok(FailDisposition::Retrying {
            not_before,
            backoff_seconds,
        })
    }

    pub async fn mark_dead(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &ErrorSummary,
    ) -> EngineResult<bool> {
        self.mark_dead_at(job_id, worker_id, error, Utc::now()).await
    }

    pub async fn mark_dead_at(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &ErrorSummary,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        self.dead_letter(job_id, Some(worker_id), error, &error.message, now)
            .await
    }

    pub async fn requeue_without_penalty(
        &self,
        job_id: Uuid,
        worker_id: &str,
    ) -> EngineResult<RequeueOutcome> {
        self.requeue_without_penalty_at(job_id, worker_id, Utc::now())
            .await
    }

    /// Hands a claimed job back after lock contention, refunding the claim's
    /// attempt. Once `contention_cap` consecutive requeues pile up the attempt
    /// is kept instead, so a key that never frees up still reaches the dead
    /// letter queue.
    pub async fn requeue_without_penalty_at(
        &self,
        job_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<RequeueOutcome> {
        let Some(job) = self.find_owned(job_id, worker_id).await? else {
            return Ok(RequeueOutcome::Rejected);
        };

        let not_before = now + Duration::seconds(self.config.contention_requeue_delay_seconds as i64);
        let contention = job.contention_count + 1;
        let penalized = contention as u32 >= self.config.contention_cap;

        if penalized && job.attempts_exhausted() {
            let summary = ErrorSummary::new(
                ErrorCategory::Contention,
                format!("lock contention persisted for {contention} requeues"),
            );
            let dead = self
                .dead_letter(job_id, Some(worker_id), &summary, &summary.message, now)
                .await?;
            return Ok(if dead {
                RequeueOutcome::DeadLettered
            } else {
                RequeueOutcome::Rejected
            });
        }

        let (attempts, contention_count) = if penalized {
            (job.attempts, 0)
        } else {
            ((job.attempts - 1).max(0), contention)
        };

        let result = SyncJob::update_many()
            .set(ActiveModel {
                status: Set(JobStatus::Pending.as_str().to_string()),
                attempts: Set(attempts),
                contention_count: Set(contention_count),
                not_before: Set(to_db_time(not_before)),
                locked_by: Set(None),
                locked_at: Set(None),
                lease_expires_at: Set(None),
                updated_at: Set(to_db_time(now)),
                ..Default::default()
            })
            .filter(owned_running(job_id, worker_id))
            .exec(self.db.as_ref())
            .await
            .map_err(db_err("failed to requeue job"))?;

        if result.rows_affected != 1 {
            return Ok(RequeueOutcome::Rejected);
        }

        counter!("scm_sync_jobs_contention_requeued_total", "penalized" => penalized.to_string())
            .increment(1);

        if penalized {
            warn!(
                job_id = %job_id,
                contention,
                attempts,
                "Contention cap reached; requeue keeps the attempt"
            );
            Ok(RequeueOutcome::Penalized { not_before })
        } else {
            debug!(job_id = %job_id, contention, "Job requeued after lock contention");
            Ok(RequeueOutcome::Requeued { not_before })
        }
    }

    pub async fn renew_lease(&self, job_id: Uuid, worker_id: &str) -> EngineResult<bool> {
        self.renew_lease_at(job_id, worker_id, Utc::now()).await
    }

    /// Pushes the lease forward by `lease_seconds` from `now`.
    pub async fn renew_lease_at(
        &self,
        job_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let expires_at = now + Duration::seconds(self.config.lease_seconds as i64);
        let result = SyncJob::update_many()
            .set(ActiveModel {
                lease_expires_at: Set(Some(to_db_time(expires_at))),
                updated_at: Set(to_db_time(now)),
                ..Default::default()
            })
            .filter(owned_running(job_id, worker_id))
            .exec(self.db.as_ref())
            .await
            .map_err(db_err("failed to renew job lease"))?;
        Ok(result.rows_affected == 1)
    }

    pub async fn find(&self, job_id: Uuid) -> EngineResult<Option<Model>> {
        SyncJob::find_by_id(job_id)
            .one(self.db.as_ref())
            .await
            .map_err(db_err("failed to load job"))
    }

    pub async fn list(&self, filter: &JobListFilter) -> EngineResult<Vec<Model>> {
        let mut query = SyncJob::find()
            .order_by_desc(Column::UpdatedAt)
            .order_by_asc(Column::JobId);
        if let Some(status) = filter.status {
            query = query.filter(Column::Status.eq(status.as_str()));
        }
        if let Some(repo_id) = filter.repo_id {
            query = query.filter(Column::RepoId.eq(repo_id));
        }
        if let Some(job_type) = filter.job_type {
            query = query.filter(Column::JobType.eq(job_type.as_str()));
        }
        if let Some(limit) = filter.limit {
            query = query.limit(limit);
        }
        query
            .all(self.db.as_ref())
            .await
            .map_err(db_err("failed to list jobs"))
    }

    /// Jobs occupying their key's active slot.
    pub async fn list_active(&self) -> EngineResult<Vec<Model>> {
        SyncJob::find()
            .filter(Column::Status.is_in(active_statuses()))
            .all(self.db.as_ref())
            .await
            .map_err(db_err("failed to list active jobs"))
    }

    /// Running jobs whose lease expired more than `grace_seconds` before `now`.
    pub async fn list_expired_running(
        &self,
        grace_seconds: u64,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<Model>> {
        let cutoff = now - Duration::seconds(grace_seconds as i64);
        SyncJob::find()
            .filter(Column::Status.eq(JobStatus::Running.as_str()))
            .filter(Column::LeaseExpiresAt.lt(to_db_time(cutoff)))
            .order_by_asc(Column::LeaseExpiresAt)
            .all(self.db.as_ref())
            .await
            .map_err(db_err("failed to list expired running jobs"))
    }

    pub async fn counts_by_status(&self) -> EngineResult<BTreeMap<JobStatus, u64>> {
        let rows = SyncJob::find()
            .select_only()
            .column(Column::Status)
            .column_as(Column::JobId.count(), "count")
            .group_by(Column::Status)
            .into_tuple::<(String, i64)>()
            .all(self.db.as_ref())
            .await
            .map_err(db_err("failed to count jobs by status"))?;

        let mut counts: BTreeMap<JobStatus, u64> =
            JobStatus::ALL.iter().map(|status| (*status, 0)).collect();
        for (status, count) in rows {
            match status.parse::<JobStatus>() {
                Ok(status) => {
                    counts.insert(status, count.max(0) as u64);
                }
                Err(err) => warn!(error = %err, "Ignoring jobs with unknown status"),
            }
        }
        Ok(counts)
    }

    pub async fn reset_dead(&self, filter: &ResetDeadFilter) -> EngineResult<ResetDeadReport> {
        self.reset_dead_at(filter, Utc::now()).await
    }

    /// Keys whose most recent dead job has not been followed by a completed
    /// job. They stay out of scheduling until an operator resets them.
    pub async fn dead_keys(&self) -> EngineResult<HashSet<(i64, JobType)>> {
        let mut latest: HashMap<(i64, JobType), DateTime<Utc>> = HashMap::new();
        for job in self.list_dead(&ResetDeadFilter::default()).await? {
            let Ok(job_type) = job.job_type() else {
                continue;
            };
            let died_at = job.updated_at.with_timezone(&Utc);
            latest
                .entry((job.repo_id, job_type))
                .and_modify(|seen| *seen = (*seen).max(died_at))
                .or_insert(died_at);
        }

        let mut keys = HashSet::new();
        for ((repo_id, job_type), died_at) in latest {
            let superseded = SyncJob::find()
                .filter(Column::RepoId.eq(repo_id))
                .filter(Column::JobType.eq(job_type.as_str()))
                .filter(Column::Status.eq(JobStatus::Completed.as_str()))
                .filter(Column::UpdatedAt.gt(to_db_time(died_at)))
                .one(self.db.as_ref())
                .await
                .map_err(db_err("failed to check dead key"))?
                .is_some();
            if !superseded {
                keys.insert((repo_id, job_type));
            }
        }
        Ok(keys)
    }

    /// Dead jobs matching `filter`, as `reset_dead` would select them.
    pub async fn list_dead(&self, filter: &ResetDeadFilter) -> EngineResult<Vec<Model>> {
        let mut query = SyncJob::find()
            .filter(Column::Status.eq(JobStatus::Dead.as_str()))
            .order_by_asc(Column::UpdatedAt);
        if let Some(job_id) = filter.job_id {
            query = query.filter(Column::JobId.eq(job_id));
        }
        if let Some(repo_id) = filter.repo_id {
            query = query.filter(Column::RepoId.eq(repo_id));
        }
        if let Some(job_type) = filter.job_type {
            query = query.filter(Column::JobType.eq(job_type.as_str()));
        }
        if let Some(instance) = &filter.gitlab_instance {
            query = query.filter(Column::GitlabInstance.eq(instance.as_str()));
        }
        query
            .all(self.db.as_ref())
            .await
            .map_err(db_err("failed to list dead jobs"))
    }

    /// Returns dead jobs to `pending` with a fresh attempt budget. Keys that
    /// already have an active job are skipped.
    pub async fn reset_dead_at(
        &self,
        filter: &ResetDeadFilter,
        now: DateTime<Utc>,
    ) -> EngineResult<ResetDeadReport> {
        let mut report = ResetDeadReport::default();
        let mut revived: HashSet<(i64, String)> = HashSet::new();

        for job in self.list_dead(filter).await? {
            let key = (job.repo_id, job.job_type.clone());
            let job_type = job.job_type()?;
            if revived.contains(&key) || self.find_active(job.repo_id, job_type).await?.is_some() {
                report.skipped.push(job.job_id);
                continue;
            }

            let outcome = SyncJob::update_many()
                .set(ActiveModel {
                    status: Set(JobStatus::Pending.as_str().to_string()),
                    attempts: Set(0),
                    contention_count: Set(0),
                    not_before: Set(to_db_time(now)),
                    locked_by: Set(None),
                    locked_at: Set(None),
                    lease_expires_at: Set(None),
                    last_error: Set(None),
                    dead_reason: Set(None),
                    updated_at: Set(to_db_time(now)),
                    ..Default::default()
                })
                .filter(Column::JobId.eq(job.job_id))
                .filter(Column::Status.eq(JobStatus::Dead.as_str()))
                .exec(self.db.as_ref())
                .await;

            match outcome {
                Ok(result) if result.rows_affected == 1 => {
                    revived.insert(key);
                    report.reset.push(job.job_id);
                }
                Ok(_) => report.skipped.push(job.job_id),
                Err(err) if is_unique_violation(&err) => report.skipped.push(job.job_id),
                Err(err) => return Err(db_err("failed to reset dead job")(err)),
            }
        }

        if !report.reset.is_empty() {
            info!(
                reset = report.reset.len(),
                skipped = report.skipped.len(),
                "Dead jobs reset to pending"
            );
        }
        Ok(report)
    }

    /// Operator dead-letter of any active job, regardless of owner.
    pub async fn force_mark_dead(&self, job_id: Uuid, reason: &str) -> EngineResult<bool> {
        let summary = ErrorSummary::new(ErrorCategory::Configuration, reason);
        self.dead_letter(job_id, None, &summary, reason, Utc::now())
            .await
    }

    pub async fn reclaim_expired(
        &self,
        grace_seconds: u64,
        dry_run: bool,
    ) -> EngineResult<ReclaimReport> {
        self.reclaim_expired_at(grace_seconds, dry_run, Utc::now())
            .await
    }

    /// Returns running jobs whose lease expired more than `grace_seconds` ago
    /// to `pending`, keeping their attempt count. Jobs whose lost execution
    /// was their last allowed attempt are dead-lettered instead.
    pub async fn reclaim_expired_at(
        &self,
        grace_seconds: u64,
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> EngineResult<ReclaimReport> {
        let cutoff = to_db_time(now - Duration::seconds(grace_seconds as i64));
        let mut report = ReclaimReport::default();

        for job in self.list_expired_running(grace_seconds, now).await? {
            let exhausted = job.attempts_exhausted();
            if dry_run {
                if exhausted {
                    report.dead_lettered.push(job.job_id);
                } else {
                    report.reclaimed.push(job.job_id);
                }
                continue;
            }

            let mut update = ActiveModel {
                locked_by: Set(None),
                locked_at: Set(None),
                lease_expires_at: Set(None),
                updated_at: Set(to_db_time(now)),
                ..Default::default()
            };
            if exhausted {
                let summary = ErrorSummary::new(
                    ErrorCategory::LeaseLost,
                    "lease expired on the final allowed attempt",
                );
                update.status = Set(JobStatus::Dead.as_str().to_string());
                update.dead_reason = Set(Some(summary.message.clone()));
                update.last_error = Set(Some(serde_json::to_value(&summary)?));
            } else {
                update.status = Set(JobStatus::Pending.as_str().to_string());
                update.not_before = Set(to_db_time(now));
            }

            let result = SyncJob::update_many()
                .set(update)
                .filter(Column::JobId.eq(job.job_id))
                .filter(Column::Status.eq(JobStatus::Running.as_str()))
                .filter(Column::LeaseExpiresAt.lt(cutoff))
                .exec(self.db.as_ref())
                .await
                .map_err(db_err("failed to reclaim expired job"))?;

            if result.rows_affected != 1 {
                continue;
            }

            warn!(
                job_id = %job.job_id,
                repo_id = job.repo_id,
                job_type = %job.job_type,
                previous_owner = job.locked_by.as_deref().unwrap_or_default(),
                dead_lettered = exhausted,
                "Reclaimed job with expired lease"
            );
            if exhausted {
                report.dead_lettered.push(job.job_id);
            } else {
                report.reclaimed.push(job.job_id);
            }
        }

        Ok(report)
    }

    async fn find_active(&self, repo_id: i64, job_type: JobType) -> EngineResult<Option<Model>> {
        SyncJob::find()
            .filter(Column::RepoId.eq(repo_id))
            .filter(Column::JobType.eq(job_type.as_str()))
            .filter(Column::Status.is_in(active_statuses()))
            .one(self.db.as_ref())
            .await
            .map_err(db_err("failed to check active jobs"))
    }

    async fn find_owned(&self, job_id: Uuid, worker_id: &str) -> EngineResult<Option<Model>> {
        SyncJob::find()
            .filter(owned_running(job_id, worker_id))
            .one(self.db.as_ref())
            .await
            .map_err(db_err("failed to load owned job"))
    }

    /// Moves an active job to `dead`. With a worker id the move is
    /// conditioned on ownership; without one any active job qualifies.
    async fn dead_letter(
        &self,
        job_id: Uuid,
        worker_id: Option<&str>,
        error: &ErrorSummary,
        reason: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let condition = match worker_id {
            Some(worker_id) => owned_running(job_id, worker_id),
            None => Condition::all()
                .add(Column::JobId.eq(job_id))
                .add(Column::Status.is_in(active_statuses())),
        };

        let result = SyncJob::update_many()
            .set(ActiveModel {
                status: Set(JobStatus::Dead.as_str().to_string()),
                dead_reason: Set(Some(reason.to_string())),
                last_error: Set(Some(serde_json::to_value(error)?)),
                locked_by: Set(None),
                locked_at: Set(None),
                lease_expires_at: Set(None),
                updated_at: Set(to_db_time(now)),
                ..Default::default()
            })
            .filter(condition)
            .exec(self.db.as_ref())
            .await
            .map_err(db_err("failed to dead-letter job"))?;

        let dead = result.rows_affected == 1;
        if dead {
            warn!(
                job_id = %job_id,
                category = %error.category,
                reason,
                "Sync job dead-lettered"
            );
            counter!("scm_sync_jobs_dead_total", "category" => error.category.as_str())
                .increment(1);
        }
        Ok(dead)
    }
}

fn completed(now: DateTime<Utc>) -> ActiveModel {
    ActiveModel {
        status: Set(JobStatus::Completed.as_str().to_string()),
        locked_by: Set(None),
        lease_expires_at: Set(None),
        last_error: Set(None),
        updated_at: Set(to_db_time(now)),
        ..Default::default()
    }
}
