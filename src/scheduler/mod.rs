//! # Sync Scheduler
//!
//! Singleton control loop that decides which repository/job type keys need
//! work. Each tick loads a [`PlanningSnapshot`] from the store, hands it to
//! the pure [`plan_tick`], persists breaker bookkeeping and enqueues the
//! planned jobs. Only one scheduler runs at a time; the `scheduler` named
//! lease is the guard.

pub mod plan;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge, histogram};
use rand::Rng;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tokio::time::{Duration as TokioDuration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{EngineError, EngineResult};
use crate::lock::NamedLease;
use crate::policy::{BreakerEvent, BreakerSnapshot, take_probes, transition};
use crate::queue::{EnqueueOutcome, EnqueueRequest, JobQueue};
use crate::repositories::{
    CircuitBreakerRepository, CursorRepository, PauseRepository, RateLimitRepository,
    RepositoryCatalog, RunRepository,
};
use crate::types::JobType;

pub use plan::{
    CursorState, InFlight, PlannedJob, PlanningSnapshot, RepoCandidate, SkipReason,
    SkippedCandidate, TickPlan, plan_tick, planned_job_types, priority,
};

/// Named lease guarding the scheduler singleton.
pub const SCHEDULER_LEASE: &str = "scheduler";

/// What one tick did (or, in dry-run mode, would have done).
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub dry_run: bool,
    pub repositories: usize,
    pub planned: Vec<PlannedJob>,
    pub enqueued: Vec<Uuid>,
    pub duplicates: usize,
    pub skipped: BTreeMap<SkipReason, usize>,
    /// Breakers whose stored state changed this tick.
    pub breakers_updated: Vec<String>,
}

pub struct SyncScheduler {
    config: Arc<AppConfig>,
    holder: String,
    lease: NamedLease,
    queue: JobQueue,
    catalog: RepositoryCatalog,
    cursors: CursorRepository,
    breakers: CircuitBreakerRepository,
    buckets: RateLimitRepository,
    pauses: PauseRepository,
    runs: RunRepository,
}

impl SyncScheduler {
    pub fn new(config: Arc<AppConfig>, db: Arc<DatabaseConnection>) -> Self {
        let holder = format!(
            "scheduler-{}-{}",
            std::process::id(),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        Self {
            holder,
            lease: NamedLease::new(db.clone()),
            queue: JobQueue::new(db.clone(), config.queue.clone(), config.retry.clone()),
            catalog: RepositoryCatalog::new(db.clone()),
            cursors: CursorRepository::new(db.clone()),
            breakers: CircuitBreakerRepository::new(db.clone()),
            buckets: RateLimitRepository::new(db.clone()),
            pauses: PauseRepository::new(db.clone()),
            runs: RunRepository::new(db),
            config,
        }
    }

    /// Override the lease holder identity (primarily for tests).
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Takes the scheduler lease or fails with [`EngineError::SingletonHeld`].
    pub async fn acquire_leadership(&self) -> EngineResult<()> {
        let now = Utc::now();
        let ttl = self.config.scheduler.leader_lease_seconds;
        if self
            .lease
            .try_acquire(SCHEDULER_LEASE, &self.holder, ttl, now)
            .await?
        {
            info!(holder = %self.holder, "Scheduler lease acquired");
            return Ok(());
        }

        let current = self.lease.current(SCHEDULER_LEASE).await?;
        Err(EngineError::SingletonHeld {
            name: SCHEDULER_LEASE.to_string(),
            holder: current
                .as_ref()
                .map(|lease| lease.holder.clone())
                .unwrap_or_else(|| "unknown".to_string()),
            expires_at: current
                .map(|lease| lease.expires_at.with_timezone(&Utc).to_rfc3339())
                .unwrap_or_default(),
        })
    }

    pub async fn release_leadership(&self) -> EngineResult<bool> {
        self.lease.release(SCHEDULER_LEASE, &self.holder).await
    }

    /// Keeps the lease alive; re-takes it if it lapsed and nobody else did.
    async fn keep_leadership(&self) -> EngineResult<()> {
        let renewed = self
            .lease
            .renew(
                SCHEDULER_LEASE,
                &self.holder,
                self.config.scheduler.leader_lease_seconds,
                Utc::now(),
            )
            .await?;
        if renewed {
            return Ok(());
        }
        warn!(holder = %self.holder, "Scheduler lease lapsed; re-acquiring");
        self.acquire_leadership().await
    }

    /// Run the scheduler loop until the provided shutdown token fires.
    #[instrument(skip_all, fields(holder = %self.holder))]
    pub async fn run(self, shutdown: CancellationToken) -> EngineResult<()> {
        self.acquire_leadership().await?;
        info!("Starting sync scheduler");

        let mut ticker = tokio::time::interval(TokioDuration::from_secs(
            self.config.scheduler.tick_interval_seconds,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Sync scheduler shutdown requested");
                    break Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.keep_leadership().await {
                        break Err(err);
                    }
                    let tick_started = Instant::now();
                    if let Err(err) = self.tick(false).await {
                        error!(error = %err, "Scheduler tick failed");
                    }
                    histogram!("scm_sync_scheduler_tick_duration_seconds")
                        .record(tick_started.elapsed().as_secs_f64());
                }
            }
        };

        if let Err(err) = self.release_leadership().await {
            warn!(error = %err, "Failed to release scheduler lease");
        }
        info!("Sync scheduler stopped");
        result
    }

    /// One guarded tick: takes the lease, ticks, releases. Dry runs skip the
    /// lease since they change nothing.
    pub async fn run_once(&self, dry_run: bool) -> EngineResult<TickReport> {
        if dry_run {
            return self.tick(true).await;
        }
        self.acquire_leadership().await?;
        let report = self.tick(false).await;
        if let Err(err) = self.release_leadership().await {
            warn!(error = %err, "Failed to release scheduler lease");
        }
        report
    }

    pub async fn tick(&self, dry_run: bool) -> EngineResult<TickReport> {
        self.tick_at(Utc::now(), dry_run).await
    }

    #[instrument(skip(self, now))]
    pub async fn tick_at(&self, now: DateTime<Utc>, dry_run: bool) -> EngineResult<TickReport> {
        let (snapshot, stored_breakers) = self.load_snapshot(now).await?;
        let plan = plan_tick(&snapshot, &self.config.scheduler, &self.config.breaker);
        self.apply_plan(&snapshot, &stored_breakers, plan, dry_run)
            .await
    }

    /// Enqueues a plan and persists breaker bookkeeping. Probe budget is
    /// charged only for probes that were actually enqueued; dry runs report
    /// the accounting the plan projected.
    pub async fn apply_plan(
        &self,
        snapshot: &PlanningSnapshot,
        stored_breakers: &HashMap<String, BreakerSnapshot>,
        plan: TickPlan,
        dry_run: bool,
    ) -> EngineResult<TickReport> {
        let now = snapshot.now;
        let mut report = TickReport {
            dry_run,
            repositories: snapshot.repositories.len(),
            skipped: plan.skip_counts(),
            ..TickReport::default()
        };

        let mut final_breakers = snapshot.breakers.clone();
        if dry_run {
            for breaker in &plan.breakers {
                final_breakers.insert(breaker.key.clone(), breaker.clone());
            }
        } else {
            for job in &plan.jobs {
                let jitter = compute_jitter_seconds(
                    self.config.scheduler.enqueue_jitter_seconds,
                    &mut rand::thread_rng(),
                );
                let request = EnqueueRequest::new(job.repo_id, job.job_type, job.mode)
                    .with_priority(job.priority)
                    .with_payload(job.payload.clone())
                    .with_not_before(now + Duration::seconds(jitter as i64));
                match self.queue.enqueue_at(request, now).await? {
                    EnqueueOutcome::Enqueued { job_id } => {
                        report.enqueued.push(job_id);
                        if job.payload.is_probe {
                            if let Some(current) = final_breakers.get(&job.breaker_key) {
                                let (next, _) =
                                    take_probes(current, 1, &self.config.breaker, now);
                                final_breakers.insert(job.breaker_key.clone(), next);
                            }
                        }
                        counter!(
                            "scm_sync_scheduler_jobs_scheduled_total",
                            "mode" => job.mode.as_str(),
                            "probe" => if job.payload.is_probe { "true" } else { "false" }
                        )
                        .increment(1);
                    }
                    EnqueueOutcome::Duplicate { .. } => report.duplicates += 1,
                }
            }
        }

        let mut changed: Vec<&BreakerSnapshot> = final_breakers
            .values()
            .filter(|state| stored_breakers.get(&state.key) != Some(*state))
            .collect();
        changed.sort_by(|a, b| a.key.cmp(&b.key));
        report.breakers_updated = changed.iter().map(|state| state.key.clone()).collect();

        if !dry_run {
            for state in changed {
                self.breakers.save(state, now).await?;
                gauge!("scm_sync_breaker_state", "breaker_key" => state.key.clone())
                    .set(state.state.gauge_value());
            }
        }
        report.planned = plan.jobs;

        gauge!("scm_sync_scheduler_planned_jobs").set(report.planned.len() as f64);
        info!(
            repositories = report.repositories,
            planned = report.planned.len(),
            enqueued = report.enqueued.len(),
            duplicates = report.duplicates,
            skipped = ?report.skipped,
            "Scheduler tick completed"
        );
        Ok(report)
    }

    /// Loads the planning inputs. Breakers come back with time-based
    /// transitions applied, alongside their stored form.
    pub async fn load_snapshot(
        &self,
        now: DateTime<Utc>,
    ) -> EngineResult<(PlanningSnapshot, HashMap<String, BreakerSnapshot>)> {
        let mut snapshot = PlanningSnapshot {
            now,
            ..PlanningSnapshot::default()
        };

        for repo in self.catalog.list_enabled().await? {
            match repo.source_kind() {
                Ok(source_kind) => snapshot.repositories.push(RepoCandidate {
                    repo_id: repo.repo_id,
                    repo_key: repo.repo_key,
                    source_kind,
                    gitlab_instance: repo.gitlab_instance,
                    tenant_id: repo.tenant_id,
                    created_at: repo.created_at.with_timezone(&Utc),
                }),
                Err(err) => warn!(repo_id = repo.repo_id, error = %err, "Skipping repository"),
            }
        }

        for cursor in self.cursors.list(None).await? {
            let Ok(job_type) = cursor.job_type.parse::<JobType>() else {
                continue;
            };
            snapshot.cursors.insert(
                (cursor.repo_id, job_type),
                CursorState {
                    watermark: cursor.watermark(),
                    updated_at: cursor.updated_at.with_timezone(&Utc),
                },
            );
        }

        for job in self.queue.list_active().await? {
            match job.job_type() {
                Ok(job_type) => {
                    snapshot.active_keys.insert((job.repo_id, job_type));
                }
                Err(err) => debug!(job_id = %job.job_id, error = %err, "Active job has unknown type"),
            }
            snapshot
                .in_flight
                .add(job.gitlab_instance.as_deref(), job.tenant_id.as_deref());
        }

        snapshot.dead_keys = self.queue.dead_keys().await?;

        for pause in self.pauses.list_active(now).await? {
            if let Ok(job_type) = pause.job_type.parse::<JobType>() {
                snapshot.paused_keys.insert((pause.repo_id, job_type));
            }
        }
        snapshot.paused_buckets = self
            .buckets
            .list_paused(now)
            .await?
            .into_iter()
            .map(|bucket| bucket.bucket_key)
            .collect();

        let mut stored = HashMap::new();
        for state in self.breakers.list().await? {
            let ticked = transition(&state, &BreakerEvent::Tick, &self.config.breaker, now);
            if ticked.state != state.state {
                info!(
                    breaker_key = %state.key,
                    from = %state.state,
                    to = %ticked.state,
                    "Circuit breaker cool-down elapsed"
                );
            }
            snapshot.breakers.insert(ticked.key.clone(), ticked);
            stored.insert(state.key.clone(), state);
        }

        let window_start = now - Duration::minutes(self.config.breaker.window_minutes as i64);
        snapshot.failure_rates = self.runs.repo_failure_rates(window_start).await?;
        let recent_start =
            now - Duration::seconds(self.config.scheduler.min_cursor_age_seconds as i64);
        snapshot.recently_synced = self.runs.keys_finished_since(recent_start).await?;

        Ok((snapshot, stored))
    }
}

/// Random delay in `0..=max_seconds` added to a scheduled job's `not_before`.
pub fn compute_jitter_seconds<R: Rng + ?Sized>(max_seconds: u64, rng: &mut R) -> u64 {
    if max_seconds == 0 {
        return 0;
    }
    rng.gen_range(0..=max_seconds)
}
