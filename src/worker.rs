//! # Sync Worker
//!
//! Claims jobs from the queue and executes them against the registered
//! [`SyncSource`] for their job type. Each job is resolved exactly once:
//! acknowledged with progress, scheduled for retry, dead-lettered, or
//! abandoned after losing its lease. A worker never kills another worker's
//! execution; it only refuses late resolutions through owner checks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, gauge, histogram};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::{MissedTickBehavior, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::EngineResult;
use crate::lock::LockManager;
use crate::models::sync_job;
use crate::policy::{
    BreakerEvent, GLOBAL_BREAKER_KEY, breaker_key, evaluate, retry_backoff, sample_window_start,
    transition,
};
use crate::queue::{
    ClaimFilter, EnqueueRequest, FailDisposition, JobProgress, JobQueue, RequeueOutcome,
};
use crate::repositories::{
    CircuitBreakerRepository, CursorRepository, RateLimitRepository, RepositoryCatalog,
    RunRepository, bucket_key,
};
use crate::run_finish::RunFinish;
use crate::sources::{FetchOutcome, FetchRequest, SourceError, SourceRegistry, SyncSource};
use crate::types::{
    DiffMode, ErrorCategory, ErrorSummary, JobMode, JobPayload, JobType, RunCounts, RunStatus,
    Watermark,
};

/// How a single claimed job ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed {
        job_id: Uuid,
        run_id: Uuid,
        status: RunStatus,
        counts: RunCounts,
        follow_up_job_id: Option<Uuid>,
    },
    Retrying {
        job_id: Uuid,
        run_id: Uuid,
        category: ErrorCategory,
        backoff_seconds: f64,
    },
    DeadLettered {
        job_id: Uuid,
        run_id: Option<Uuid>,
        category: ErrorCategory,
    },
    /// The key lock was held elsewhere; the job went back to the queue.
    Contended {
        job_id: Uuid,
        requeue: RequeueOutcome,
    },
    LeaseLost {
        job_id: Uuid,
        run_id: Uuid,
    },
}

impl JobOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobOutcome::Completed { job_id, .. }
            | JobOutcome::Retrying { job_id, .. }
            | JobOutcome::DeadLettered { job_id, .. }
            | JobOutcome::Contended { job_id, .. }
            | JobOutcome::LeaseLost { job_id, .. } => *job_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Completed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Completed { .. } => "completed",
            JobOutcome::Retrying { .. } => "retrying",
            JobOutcome::DeadLettered { .. } => "dead",
            JobOutcome::Contended { .. } => "contended",
            JobOutcome::LeaseLost { .. } => "lease_lost",
        }
    }
}

enum Execution {
    Fetched(Result<FetchOutcome, SourceError>),
    TimedOut,
    LeaseLost,
}

#[derive(Clone)]
pub struct SyncWorker {
    config: Arc<AppConfig>,
    registry: Arc<SourceRegistry>,
    worker_id: String,
    filter: ClaimFilter,
    queue: JobQueue,
    locks: LockManager,
    runs: RunRepository,
    cursors: CursorRepository,
    breakers: CircuitBreakerRepository,
    buckets: RateLimitRepository,
    catalog: RepositoryCatalog,
}

impl SyncWorker {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        registry: Arc<SourceRegistry>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            queue: JobQueue::new(db.clone(), config.queue.clone(), config.retry.clone()),
            locks: LockManager::new(db.clone()),
            runs: RunRepository::new(db.clone()),
            cursors: CursorRepository::new(db.clone()),
            breakers: CircuitBreakerRepository::new(db.clone()),
            buckets: RateLimitRepository::new(db.clone()),
            catalog: RepositoryCatalog::new(db),
            config,
            registry,
            worker_id: worker_id.into(),
            filter: ClaimFilter::default(),
        }
    }

    /// Restricts claims to the given instance/tenant allowlists, repo or job types.
    pub fn with_filter(mut self, filter: ClaimFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Polls until `shutdown` fires. Store errors are logged and retried on
    /// the next poll.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            worker_id = %self.worker_id,
            concurrency = self.config.worker.concurrency,
            "Starting sync worker"
        );
        let poll = Duration::from_millis(self.config.worker.poll_interval_ms);

        while !shutdown.is_cancelled() {
            let busy = match self.run_once().await {
                Ok(outcomes) => {
                    if !outcomes.is_empty() {
                        debug!(count = outcomes.len(), "Processed claimed jobs");
                    }
                    !outcomes.is_empty()
                }
                Err(err) => {
                    error!(error = %err, "Worker poll failed");
                    false
                }
            };
            if busy {
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(poll) => {}
            }
        }

        info!(worker_id = %self.worker_id, "Sync worker stopped");
    }

    /// Claims one round of jobs and processes them concurrently.
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn run_once(&self) -> EngineResult<Vec<JobOutcome>> {
        let concurrency = self.config.worker.concurrency.max(1);
        let limit = self.config.queue.claim_batch.min(concurrency as u64);
        let jobs = self.queue.claim(&self.worker_id, &self.filter, limit).await?;
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let worker = self.clone();
            let job_id = job.job_id;
            handles.push((
                job_id,
                tokio::spawn(async move {
                    let _permit = permit;
                    worker.process_job(job).await
                }),
            ));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (job_id, handle) in handles {
            match handle.await {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(err)) => error!(%job_id, error = %err, "Job processing failed"),
                Err(err) => error!(%job_id, error = %err, "Job task panicked"),
            }
        }
        Ok(outcomes)
    }

    /// Executes one claimed job end to end.
    ///
    /// Store errors are returned as-is: the job stays `running` under this
    /// worker until its lease expires and the reaper hands it back.
    #[instrument(
        skip_all,
        fields(job_id = %job.job_id, repo_id = job.repo_id, job_type = %job.job_type, worker_id = %self.worker_id)
    )]
    pub async fn process_job(&self, job: sync_job::Model) -> EngineResult<JobOutcome> {
        let started = Instant::now();
        let outcome = self.execute(&job).await?;
        histogram!("scm_sync_worker_job_duration_seconds", "outcome" => outcome.label())
            .record(started.elapsed().as_secs_f64());
        counter!("scm_sync_worker_jobs_total", "outcome" => outcome.label()).increment(1);
        Ok(outcome)
    }

    async fn execute(&self, job: &sync_job::Model) -> EngineResult<JobOutcome> {
        let (job_type, mode) = match (job.job_type(), job.mode()) {
            (Ok(job_type), Ok(mode)) => (job_type, mode),
            (Err(err), _) | (_, Err(err)) => {
                let summary = ErrorSummary::new(ErrorCategory::Configuration, err.to_string());
                self.queue
                    .mark_dead(job.job_id, &self.worker_id, &summary)
                    .await?;
                return Ok(JobOutcome::DeadLettered {
                    job_id: job.job_id,
                    run_id: None,
                    category: ErrorCategory::Configuration,
                });
            }
        };

        let acquired = self
            .locks
            .acquire(
                job.repo_id,
                job_type,
                &self.worker_id,
                self.config.queue.lease_seconds,
                Some(job.job_id),
            )
            .await?;
        if !acquired {
            let requeue = self
                .queue
                .requeue_without_penalty(job.job_id, &self.worker_id)
                .await?;
            info!(?requeue, "Key lock held by another worker; job handed back");
            return Ok(JobOutcome::Contended {
                job_id: job.job_id,
                requeue,
            });
        }

        let result = self.execute_locked(job, job_type, mode).await;
        if result.is_err() {
            if let Err(err) = self
                .locks
                .release(job.repo_id, job_type, &self.worker_id)
                .await
            {
                warn!(error = %err, "Failed to release key lock after store error");
            }
        }
        result
    }

    async fn execute_locked(
        &self,
        job: &sync_job::Model,
        job_type: JobType,
        mode: JobMode,
    ) -> EngineResult<JobOutcome> {
        let payload = job.payload();
        let cursor = self
            .cursors
            .get(job.repo_id, job_type)
            .await?
            .and_then(|stored| stored.watermark());
        let run = self
            .runs
            .start(job, payload.is_probe, cursor.as_ref(), Utc::now())
            .await?;

        let Some(source) = self.registry.get(job_type) else {
            let summary = ErrorSummary::new(
                ErrorCategory::Configuration,
                format!("no source registered for job type {job_type}"),
            );
            return self.dead_letter(job, job_type, run.run_id, summary).await;
        };
        let Some(repo) = self.catalog.find_by_id(job.repo_id).await? else {
            let summary = ErrorSummary::new(
                ErrorCategory::NotFound,
                format!("repository {} is not in the catalog", job.repo_id),
            );
            return self.dead_letter(job, job_type, run.run_id, summary).await;
        };
        let source_kind = match repo.source_kind() {
            Ok(kind) => kind,
            Err(err) => {
                let summary = ErrorSummary::new(ErrorCategory::Configuration, err.to_string());
                return self.dead_letter(job, job_type, run.run_id, summary).await;
            }
        };

        let request = FetchRequest {
            job_id: job.job_id,
            run_id: run.run_id,
            repo_id: job.repo_id,
            repo_key: repo.repo_key.clone(),
            source_kind,
            job_type,
            mode,
            cursor,
            batch_size: payload.effective_batch_size(self.config.scheduler.default_batch_size),
            diff_mode: payload.suggested_diff_mode.unwrap_or(DiffMode::Full),
            payload: payload.clone(),
        };

        debug!(source = source.name(), batch_size = request.batch_size, "Fetching");
        match self.fetch_with_renewal(job, job_type, source, request).await {
            Execution::Fetched(Ok(outcome)) => {
                self.resolve_success(job, job_type, &payload, run.run_id, outcome)
                    .await
            }
            Execution::Fetched(Err(err)) => {
                self.resolve_failure(job, job_type, run.run_id, err).await
            }
            Execution::TimedOut => {
                let err = SourceError::timeout(format!(
                    "fetch exceeded {}s",
                    self.config.worker.max_run_seconds
                ));
                self.resolve_failure(job, job_type, run.run_id, err).await
            }
            Execution::LeaseLost => {
                self.resolve_lease_lost(job, job_type, run.run_id, "lease renewal rejected")
                    .await
            }
        }
    }

    /// Runs the fetch under `max_run_seconds`, renewing the job lease and key
    /// lock every `renew_interval_seconds`. A failed renewal drops the fetch.
    async fn fetch_with_renewal(
        &self,
        job: &sync_job::Model,
        job_type: JobType,
        source: Arc<dyn SyncSource>,
        request: FetchRequest,
    ) -> Execution {
        let max_run = Duration::from_secs(self.config.worker.max_run_seconds);
        let fetch = tokio::time::timeout(max_run, source.fetch(request));
        tokio::pin!(fetch);

        let period = Duration::from_secs(self.config.worker.renew_interval_seconds.max(1));
        let mut renewal = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut fetch => {
                    return match result {
                        Ok(fetched) => Execution::Fetched(fetched),
                        Err(_) => Execution::TimedOut,
                    };
                }
                _ = renewal.tick() => {
                    if !self.renew(job, job_type).await {
                        return Execution::LeaseLost;
                    }
                }
            }
        }
    }

    async fn renew(&self, job: &sync_job::Model, job_type: JobType) -> bool {
        let job_renewed = match self.queue.renew_lease(job.job_id, &self.worker_id).await {
            Ok(renewed) => renewed,
            Err(err) => {
                warn!(error = %err, "Job lease renewal failed");
                false
            }
        };
        if !job_renewed {
            return false;
        }
        match self
            .locks
            .renew(job.repo_id, job_type, &self.worker_id)
            .await
        {
            Ok(renewed) => renewed,
            Err(err) => {
                warn!(error = %err, "Key lock renewal failed");
                false
            }
        }
    }

    async fn resolve_success(
        &self,
        job: &sync_job::Model,
        job_type: JobType,
        payload: &JobPayload,
        run_id: Uuid,
        outcome: FetchOutcome,
    ) -> EngineResult<JobOutcome> {
        let finish = if outcome.stats.fetched == 0 {
            RunFinish::no_data(outcome.watermark_end.clone())
        } else {
            RunFinish::success(outcome.stats, outcome.watermark_end.clone())
        };
        let status = finish.status();
        let progress = JobProgress { run_id, finish };

        let acked = self
            .queue
            .ack_with_progress(job.job_id, &self.worker_id, &progress)
            .await?;
        if !acked {
            return self
                .resolve_lease_lost(job, job_type, run_id, "job no longer owned at completion")
                .await;
        }
        self.record_breaker_outcome(job, true, None).await?;

        let follow_up_job_id = if outcome.has_more {
            self.enqueue_follow_up(job, job_type, payload, outcome.watermark_end.as_ref())
                .await?
        } else {
            None
        };

        info!(
            fetched = outcome.stats.fetched,
            watermark_end = ?outcome.watermark_end,
            has_more = outcome.has_more,
            "Sync job completed"
        );
        Ok(JobOutcome::Completed {
            job_id: job.job_id,
            run_id,
            status,
            counts: outcome.stats,
            follow_up_job_id,
        })
    }

    async fn enqueue_follow_up(
        &self,
        job: &sync_job::Model,
        job_type: JobType,
        payload: &JobPayload,
        reached: Option<&Watermark>,
    ) -> EngineResult<Option<Uuid>> {
        let mode = job.mode().unwrap_or(JobMode::Incremental);
        let follow_up = follow_up_payload(mode, payload, reached);
        let request = EnqueueRequest::new(job.repo_id, job_type, mode)
            .with_priority(job.priority)
            .with_payload(follow_up);
        let outcome = self.queue.enqueue(request).await?;
        if outcome.is_enqueued() {
            debug!(follow_up_job_id = %outcome.job_id(), "More history available; follow-up enqueued");
            Ok(Some(outcome.job_id()))
        } else {
            Ok(None)
        }
    }

    async fn resolve_failure(
        &self,
        job: &sync_job::Model,
        job_type: JobType,
        run_id: Uuid,
        err: SourceError,
    ) -> EngineResult<JobOutcome> {
        let category = err.category();
        let summary = err.to_summary();
        if category == ErrorCategory::RateLimited {
            self.pause_bucket(job, &err).await?;
        }

        let outcome = if err.is_retryable() {
            match self
                .queue
                .fail_retry(job.job_id, &self.worker_id, &summary, None)
                .await?
            {
                FailDisposition::Retrying {
                    backoff_seconds, ..
                } => {
                    self.runs
                        .finalize(run_id, &RunFinish::exception(summary, None))
                        .await?;
                    self.locks
                        .release(job.repo_id, job_type, &self.worker_id)
                        .await?;
                    JobOutcome::Retrying {
                        job_id: job.job_id,
                        run_id,
                        category,
                        backoff_seconds,
                    }
                }
                FailDisposition::DeadLettered => {
                    self.runs
                        .finalize(run_id, &RunFinish::mark_dead(summary))
                        .await?;
                    self.locks
                        .release(job.repo_id, job_type, &self.worker_id)
                        .await?;
                    JobOutcome::DeadLettered {
                        job_id: job.job_id,
                        run_id: Some(run_id),
                        category,
                    }
                }
                FailDisposition::Rejected => {
                    self.resolve_lease_lost(job, job_type, run_id, "job no longer owned at failure")
                        .await?
                }
            }
        } else {
            self.dead_letter(job, job_type, run_id, summary).await?
        };

        if !matches!(outcome, JobOutcome::LeaseLost { .. }) {
            self.record_breaker_outcome(job, false, Some(category))
                .await?;
        }
        Ok(outcome)
    }

    async fn dead_letter(
        &self,
        job: &sync_job::Model,
        job_type: JobType,
        run_id: Uuid,
        summary: ErrorSummary,
    ) -> EngineResult<JobOutcome> {
        let category = summary.category;
        if !self
            .queue
            .mark_dead(job.job_id, &self.worker_id, &summary)
            .await?
        {
            return self
                .resolve_lease_lost(job, job_type, run_id, "job no longer owned at dead-letter")
                .await;
        }
        self.runs
            .finalize(run_id, &RunFinish::mark_dead(summary))
            .await?;
        self.locks
            .release(job.repo_id, job_type, &self.worker_id)
            .await?;
        Ok(JobOutcome::DeadLettered {
            job_id: job.job_id,
            run_id: Some(run_id),
            category,
        })
    }

    async fn resolve_lease_lost(
        &self,
        job: &sync_job::Model,
        job_type: JobType,
        run_id: Uuid,
        reason: &str,
    ) -> EngineResult<JobOutcome> {
        warn!(%run_id, reason, "Lease lost; abandoning run without touching the cursor");
        self.runs
            .finalize(run_id, &RunFinish::lease_lost(reason))
            .await?;
        self.locks
            .release(job.repo_id, job_type, &self.worker_id)
            .await?;
        counter!("scm_sync_worker_lease_lost_total").increment(1);
        Ok(JobOutcome::LeaseLost {
            job_id: job.job_id,
            run_id,
        })
    }

    /// Pauses the job's instance bucket after a 429.
    async fn pause_bucket(&self, job: &sync_job::Model, err: &SourceError) -> EngineResult<()> {
        let Some(instance) = job.gitlab_instance.as_deref() else {
            debug!("Rate limited job has no instance; no bucket to pause");
            return Ok(());
        };
        let seconds = match err.retry_after_seconds() {
            Some(seconds) => seconds as f64,
            None => retry_backoff(
                ErrorCategory::RateLimited,
                (job.attempts - 1).max(0) as u32,
                None,
                &self.config.retry,
                Some(instance),
            ),
        };
        let now = Utc::now();
        let until = now + chrono::Duration::milliseconds((seconds * 1_000.0).round() as i64);
        let key = bucket_key(instance);
        self.buckets
            .pause(&key, until, err.message(), true, now)
            .await?;
        gauge!("scm_sync_rate_limit_paused", "bucket_key" => key).set(1.0);
        Ok(())
    }

    /// Feeds one fetch outcome into the breaker guarding the job's upstream.
    async fn record_breaker_outcome(
        &self,
        job: &sync_job::Model,
        success: bool,
        category: Option<ErrorCategory>,
    ) -> EngineResult<()> {
        let config = &self.config.breaker;
        let key = breaker_key(config.scope, job.gitlab_instance.as_deref());
        let now = Utc::now();
        let current = self.breakers.get_or_closed(&key).await?;

        let counted = category.is_none_or(|category| category.counts_toward_breaker());
        let mut next = transition(
            &current,
            &BreakerEvent::Outcome { success, counted },
            config,
            now,
        );

        if next.is_closed() {
            let instance = if key == GLOBAL_BREAKER_KEY {
                None
            } else {
                job.gitlab_instance.as_deref()
            };
            let since = sample_window_start(&next, config, now);
            let samples = self
                .runs
                .recent_outcomes(instance, since, config.window_runs.saturating_mul(2).max(1))
                .await?;
            let evaluation = evaluate(&samples, config, Some(current.rates), now);
            next = transition(&next, &BreakerEvent::Evaluated(evaluation), config, now);
        }

        if next == current {
            return Ok(());
        }
        self.breakers.save(&next, now).await?;
        if next.state != current.state {
            warn!(
                breaker_key = %key,
                from = %current.state,
                to = %next.state,
                reason = ?next.last_failure_reason,
                "Circuit breaker changed state"
            );
            gauge!("scm_sync_breaker_state", "breaker_key" => key).set(next.state.gauge_value());
        }
        Ok(())
    }
}

impl std::fmt::Debug for SyncWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncWorker")
            .field("worker_id", &self.worker_id)
            .field("filter", &self.filter)
            .field("registry", &self.registry)
            .finish()
    }
}

/// Payload for the job that picks up where a paged fetch stopped. Backfills
/// keep their upper bound and move the window start to `reached`; incremental
/// follow-ups resume from the cursor.
fn follow_up_payload(
    mode: JobMode,
    payload: &JobPayload,
    reached: Option<&Watermark>,
) -> JobPayload {
    let mut next = JobPayload {
        is_probe: false,
        ..payload.clone()
    };
    match mode {
        JobMode::Backfill => match reached {
            Some(Watermark::Revision(rev)) => next.start_rev = Some(*rev),
            Some(Watermark::Timestamp(ts)) => next.since = Some(*ts),
            None => {}
        },
        JobMode::Incremental => {
            next.since = None;
            next.until = None;
            next.start_rev = None;
            next.end_rev = None;
            next.is_backfill_only = false;
        }
    }
    next
}
