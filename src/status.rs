//! # Status
//!
//! Read-only aggregation over the queue, lock, run, breaker and rate-limit
//! tables, plus the health gate that turns the aggregate into severity-ranked
//! violations and an exit status for automation.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::EngineResult;
use crate::lock::LockManager;
use crate::models::{sync_job, sync_lock};
use crate::policy::{BreakerSnapshot, GLOBAL_BREAKER_KEY, sample_window_start, window_stats};
use crate::queue::{JobListFilter, JobQueue};
use crate::repositories::{
    CircuitBreakerRepository, PauseRepository, RateLimitRepository, RepositoryCatalog,
    RunRepository,
};
use crate::types::{BreakerState, JobStatus, SourceKind};

/// Violation severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub severity: Severity,
    pub code: &'static str,
    pub subject: String,
    pub message: String,
    pub remediation: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub repo_id: i64,
    pub job_type: String,
    pub mode: String,
    pub status: String,
    pub attempts: i32,
    pub locked_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub gitlab_instance: Option<String>,
    pub dead_reason: Option<String>,
}

impl From<&sync_job::Model> for JobSummary {
    fn from(job: &sync_job::Model) -> Self {
        Self {
            job_id: job.job_id,
            repo_id: job.repo_id,
            job_type: job.job_type.clone(),
            mode: job.mode.clone(),
            status: job.status.clone(),
            attempts: job.attempts,
            locked_by: job.locked_by.clone(),
            lease_expires_at: job.lease_expires_at.map(|at| at.with_timezone(&Utc)),
            gitlab_instance: job.gitlab_instance.clone(),
            dead_reason: job.dead_reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LockSummary {
    pub lock_id: Uuid,
    pub repo_id: i64,
    pub job_type: String,
    pub locked_by: String,
    pub job_id: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
}

impl From<&sync_lock::Model> for LockSummary {
    fn from(lock: &sync_lock::Model) -> Self {
        Self {
            lock_id: lock.lock_id,
            repo_id: lock.repo_id,
            job_type: lock.job_type.clone(),
            locked_by: lock.locked_by.clone(),
            job_id: lock.job_id,
            expires_at: lock.expires_at.with_timezone(&Utc),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketStatus {
    pub bucket_key: String,
    pub paused: bool,
    pub paused_until: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    #[serde(flatten)]
    pub snapshot: BreakerSnapshot,
    /// Counted samples in the current evaluation window.
    pub window_samples: usize,
    /// Whether the current window breaches a threshold.
    pub window_breach: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryBackoff {
    pub job_id: Uuid,
    pub job_type: String,
    pub backoff_seconds: f64,
}

/// Point-in-time view of the engine's persisted state.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub generated_at: DateTime<Utc>,
    pub grace_seconds: u64,
    pub job_counts: BTreeMap<JobStatus, u64>,
    pub expired_running_jobs: Vec<JobSummary>,
    pub expired_locks: Vec<LockSummary>,
    pub orphaned_locks: Vec<LockSummary>,
    pub breakers: Vec<BreakerStatus>,
    pub rate_limit_buckets: Vec<BucketStatus>,
    pub pauses_by_reason: BTreeMap<String, u64>,
    pub stale_pauses: u64,
    pub dead_jobs: Vec<JobSummary>,
    pub jobs_missing_dimensions: Vec<JobSummary>,
    pub retry_backoffs: Vec<RetryBackoff>,
}

/// Health gate result. The exit status is 0 when no warning or critical
/// violation exists, 1 for warnings and 2 for anything critical.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub exit_code: u8,
    pub violations: Vec<Violation>,
}

impl HealthReport {
    pub fn from_violations(mut violations: Vec<Violation>) -> Self {
        violations.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.code.cmp(b.code)));
        let worst = violations.iter().map(|v| v.severity).max();
        let (status, exit_code) = match worst {
            Some(Severity::Critical) => ("critical", 2),
            Some(Severity::Warning) => ("warning", 1),
            _ => ("healthy", 0),
        };
        Self {
            status,
            exit_code,
            violations,
        }
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.violations
            .iter()
            .filter(|violation| violation.severity == severity)
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct StatusService {
    config: Arc<AppConfig>,
    queue: JobQueue,
    locks: LockManager,
    runs: RunRepository,
    breakers: CircuitBreakerRepository,
    buckets: RateLimitRepository,
    pauses: PauseRepository,
    catalog: RepositoryCatalog,
}

impl StatusService {
    pub fn new(config: Arc<AppConfig>, db: Arc<DatabaseConnection>) -> Self {
        Self {
            queue: JobQueue::new(db.clone(), config.queue.clone(), config.retry.clone()),
            locks: LockManager::new(db.clone()),
            runs: RunRepository::new(db.clone()),
            breakers: CircuitBreakerRepository::new(db.clone()),
            buckets: RateLimitRepository::new(db.clone()),
            pauses: PauseRepository::new(db.clone()),
            catalog: RepositoryCatalog::new(db),
            config,
        }
    }

    pub async fn snapshot(&self, grace_seconds: Option<u64>) -> EngineResult<StatusSnapshot> {
        self.snapshot_at(Utc::now(), grace_seconds).await
    }

    pub async fn snapshot_at(
        &self,
        now: DateTime<Utc>,
        grace_seconds: Option<u64>,
    ) -> EngineResult<StatusSnapshot> {
        let grace_seconds = grace_seconds.unwrap_or(self.config.reaper.grace_seconds);

        let job_counts = self.queue.counts_by_status().await?;
        let expired_running_jobs = self
            .queue
            .list_expired_running(grace_seconds, now)
            .await?
            .iter()
            .map(JobSummary::from)
            .collect();
        let expired: Vec<sync_lock::Model> =
            self.locks.list_expired_at(grace_seconds, now).await?;
        let orphaned_locks = self
            .locks
            .list_orphaned()
            .await?
            .iter()
            .filter(|lock| !expired.iter().any(|e| e.lock_id == lock.lock_id))
            .map(LockSummary::from)
            .collect();
        let expired_locks = expired.iter().map(LockSummary::from).collect();

        let breakers = self.breaker_statuses(now).await?;

        let rate_limit_buckets = self
            .buckets
            .list()
            .await?
            .into_iter()
            .map(|bucket| {
                let paused_until = bucket.paused_until.map(|at| at.with_timezone(&Utc));
                BucketStatus {
                    paused: paused_until.is_some_and(|until| until > now),
                    bucket_key: bucket.bucket_key,
                    paused_until,
                    reason: bucket.reason,
                }
            })
            .collect();

        let mut pauses_by_reason = BTreeMap::new();
        for pause in self.pauses.list_active(now).await? {
            *pauses_by_reason.entry(pause.reason).or_insert(0u64) += 1;
        }
        let stale_pauses = self.pauses.list_expired(now).await?.len() as u64;

        let dead_jobs = self
            .queue
            .list(&JobListFilter {
                status: Some(JobStatus::Dead),
                ..JobListFilter::default()
            })
            .await?
            .iter()
            .map(JobSummary::from)
            .collect();

        let active = self.queue.list_active().await?;
        let jobs_missing_dimensions = self.missing_dimensions(&active).await?;
        let retry_backoffs = active
            .iter()
            .filter(|job| job.status().ok() == Some(JobStatus::Failed))
            .map(|job| RetryBackoff {
                job_id: job.job_id,
                job_type: job.job_type.clone(),
                backoff_seconds: (job.not_before - job.updated_at).num_milliseconds().max(0)
                    as f64
                    / 1000.0,
            })
            .collect();

        Ok(StatusSnapshot {
            generated_at: now,
            grace_seconds,
            job_counts,
            expired_running_jobs,
            expired_locks,
            orphaned_locks,
            breakers,
            rate_limit_buckets,
            pauses_by_reason,
            stale_pauses,
            dead_jobs,
            jobs_missing_dimensions,
            retry_backoffs,
        })
    }

    async fn breaker_statuses(&self, now: DateTime<Utc>) -> EngineResult<Vec<BreakerStatus>> {
        let config = &self.config.breaker;
        let mut statuses = Vec::new();
        for snapshot in self.breakers.list().await? {
            let instance = if snapshot.key == GLOBAL_BREAKER_KEY {
                None
            } else {
                snapshot.key.strip_prefix("instance:").map(str::to_string)
            };
            let since = sample_window_start(&snapshot, config, now);
            let samples = self
                .runs
                .recent_outcomes(
                    instance.as_deref(),
                    since,
                    config.window_runs.saturating_mul(2).max(1),
                )
                .await?;
            let stats = window_stats(&samples, config, now);
            let window_breach = if stats.samples >= config.min_samples {
                stats.rates().breach(config)
            } else {
                None
            };
            statuses.push(BreakerStatus {
                snapshot,
                window_samples: stats.samples,
                window_breach,
            });
        }
        Ok(statuses)
    }

    /// Active GitLab jobs without the instance dimension the scheduler and
    /// breaker partition on.
    async fn missing_dimensions(
        &self,
        active: &[sync_job::Model],
    ) -> EngineResult<Vec<JobSummary>> {
        let mut kinds: HashMap<i64, Option<SourceKind>> = HashMap::new();
        let mut missing = Vec::new();
        for job in active.iter().filter(|job| job.gitlab_instance.is_none()) {
            let kind = match kinds.get(&job.repo_id) {
                Some(kind) => *kind,
                None => {
                    let kind = self
                        .catalog
                        .find_by_id(job.repo_id)
                        .await?
                        .and_then(|repo| repo.source_kind().ok());
                    kinds.insert(job.repo_id, kind);
                    kind
                }
            };
            if matches!(kind, Some(SourceKind::GitLab) | None) {
                missing.push(JobSummary::from(job));
            }
        }
        Ok(missing)
    }
}

/// Classifies a snapshot into violations.
pub fn evaluate_health(snapshot: &StatusSnapshot, config: &AppConfig) -> HealthReport {
    let mut violations = Vec::new();

    for job in &snapshot.expired_running_jobs {
        violations.push(Violation {
            severity: Severity::Critical,
            code: "expired_running_job",
            subject: job.job_id.to_string(),
            message: format!(
                "job {} ({} repo {}) is running under {} with a lease expired beyond {}s",
                job.job_id,
                job.job_type,
                job.repo_id,
                job.locked_by.as_deref().unwrap_or("nobody"),
                snapshot.grace_seconds
            ),
            remediation: "run `scm-sync reaper --once` and check that worker processes are alive",
        });
    }

    for lock in &snapshot.orphaned_locks {
        violations.push(Violation {
            severity: Severity::Critical,
            code: "orphaned_lock",
            subject: lock.lock_id.to_string(),
            message: format!(
                "lock {} on repo {} {} held by {} has no running job",
                lock.lock_id, lock.repo_id, lock.job_type, lock.locked_by
            ),
            remediation: "run `scm-sync reaper --once` or `scm-sync admin locks force-release`",
        });
    }

    for breaker in &snapshot.breakers {
        let snapshot_ref = &breaker.snapshot;
        match snapshot_ref.state {
            BreakerState::Open if snapshot_ref.opened_at.is_none() => {
                violations.push(Violation {
                    severity: Severity::Critical,
                    code: "breaker_inconsistent",
                    subject: snapshot_ref.key.clone(),
                    message: format!("breaker {} is open without an opened_at", snapshot_ref.key),
                    remediation: "run `scm-sync admin breakers reset` for the key",
                });
            }
            BreakerState::HalfOpen
                if snapshot_ref.consecutive_successes >= config.breaker.recovery_success_count =>
            {
                violations.push(Violation {
                    severity: Severity::Critical,
                    code: "breaker_inconsistent",
                    subject: snapshot_ref.key.clone(),
                    message: format!(
                        "breaker {} is half-open with {} consecutive successes (recovery needs {})",
                        snapshot_ref.key,
                        snapshot_ref.consecutive_successes,
                        config.breaker.recovery_success_count
                    ),
                    remediation: "run `scm-sync admin breakers reset` for the key",
                });
            }
            _ => {}
        }

        if snapshot_ref.state == BreakerState::Closed {
            if let Some(reason) = &breaker.window_breach {
                violations.push(Violation {
                    severity: Severity::Warning,
                    code: "error_budget_inconsistent",
                    subject: snapshot_ref.key.clone(),
                    message: format!(
                        "breaker {} is closed while its window breaches: {reason} ({} samples)",
                        snapshot_ref.key, breaker.window_samples
                    ),
                    remediation: "check the upstream instance and the breaker thresholds",
                });
            }
        } else {
            violations.push(Violation {
                severity: Severity::Info,
                code: "breaker_not_closed",
                subject: snapshot_ref.key.clone(),
                message: format!(
                    "breaker {} is {}{}",
                    snapshot_ref.key,
                    snapshot_ref.state,
                    snapshot_ref
                        .last_failure_reason
                        .as_deref()
                        .map(|reason| format!(": {reason}"))
                        .unwrap_or_default()
                ),
                remediation: "wait for recovery probes or investigate the upstream instance",
            });
        }
    }

    for job in &snapshot.jobs_missing_dimensions {
        violations.push(Violation {
            severity: Severity::Warning,
            code: "missing_dimension",
            subject: job.job_id.to_string(),
            message: format!(
                "job {} for repo {} has no gitlab_instance",
                job.job_id, job.repo_id
            ),
            remediation: "set gitlab_instance on the repository and re-enqueue",
        });
    }

    if snapshot.stale_pauses > 0 {
        violations.push(Violation {
            severity: Severity::Warning,
            code: "stale_pause",
            subject: "sync_pause".to_string(),
            message: format!("{} pause records are past their expiry", snapshot.stale_pauses),
            remediation: "run `scm-sync reaper --once` or `scm-sync admin pauses unset`",
        });
    }

    if !snapshot.dead_jobs.is_empty() {
        violations.push(Violation {
            severity: Severity::Warning,
            code: "dead_jobs",
            subject: "sync_job".to_string(),
            message: format!("{} jobs are dead-lettered", snapshot.dead_jobs.len()),
            remediation: "fix the root cause, then `scm-sync admin jobs reset-dead`",
        });
    }

    for bucket in snapshot.rate_limit_buckets.iter().filter(|b| b.paused) {
        violations.push(Violation {
            severity: Severity::Info,
            code: "rate_limit_paused",
            subject: bucket.bucket_key.clone(),
            message: format!(
                "rate-limit bucket {} is paused until {}",
                bucket.bucket_key,
                bucket
                    .paused_until
                    .map(|until| until.to_rfc3339())
                    .unwrap_or_default()
            ),
            remediation: "wait for the pause to lapse or `scm-sync admin rate-limit buckets unpause`",
        });
    }

    HealthReport::from_violations(violations)
}

/// Human-readable status summary.
pub fn render_text(snapshot: &StatusSnapshot, health: Option<&HealthReport>, details: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "scm-sync status at {}", snapshot.generated_at.to_rfc3339());
    let _ = writeln!(out, "jobs:");
    for (status, count) in &snapshot.job_counts {
        let _ = writeln!(out, "  {:<10} {count}", status.as_str());
    }
    let _ = writeln!(
        out,
        "expired running jobs: {}",
        snapshot.expired_running_jobs.len()
    );
    let _ = writeln!(
        out,
        "locks: {} expired, {} orphaned",
        snapshot.expired_locks.len(),
        snapshot.orphaned_locks.len()
    );
    let _ = writeln!(out, "breakers:");
    for breaker in &snapshot.breakers {
        let _ = writeln!(
            out,
            "  {:<32} {:<9} failure={:.2} rate_limit={:.2} timeout={:.2} samples={}",
            breaker.snapshot.key,
            breaker.snapshot.state.as_str(),
            breaker.snapshot.rates.failure_rate,
            breaker.snapshot.rates.rate_limit_rate,
            breaker.snapshot.rates.timeout_rate,
            breaker.window_samples
        );
    }
    let _ = writeln!(out, "rate-limit buckets:");
    for bucket in &snapshot.rate_limit_buckets {
        let state = match (bucket.paused, bucket.paused_until) {
            (true, Some(until)) => format!("paused until {}", until.to_rfc3339()),
            _ => "open".to_string(),
        };
        let _ = writeln!(out, "  {:<32} {state}", bucket.bucket_key);
    }
    let _ = writeln!(out, "pauses:");
    for (reason, count) in &snapshot.pauses_by_reason {
        let _ = writeln!(out, "  {reason:<20} {count}");
    }
    let _ = writeln!(out, "dead jobs: {}", snapshot.dead_jobs.len());

    if details {
        for job in &snapshot.expired_running_jobs {
            let _ = writeln!(
                out,
                "  expired {} repo={} type={} owner={}",
                job.job_id,
                job.repo_id,
                job.job_type,
                job.locked_by.as_deref().unwrap_or("-")
            );
        }
        for lock in snapshot.expired_locks.iter().chain(&snapshot.orphaned_locks) {
            let _ = writeln!(
                out,
                "  lock {} repo={} type={} holder={} expires={}",
                lock.lock_id,
                lock.repo_id,
                lock.job_type,
                lock.locked_by,
                lock.expires_at.to_rfc3339()
            );
        }
        for job in &snapshot.dead_jobs {
            let _ = writeln!(
                out,
                "  dead {} repo={} type={} reason={}",
                job.job_id,
                job.repo_id,
                job.job_type,
                job.dead_reason.as_deref().unwrap_or("-")
            );
        }
    }

    if let Some(health) = health {
        let _ = writeln!(out, "health: {}", health.status);
        for violation in &health.violations {
            let _ = writeln!(
                out,
                "  [{}] {}: {}\n    fix: {}",
                violation.severity.as_str(),
                violation.code,
                violation.message,
                violation.remediation
            );
        }
    }
    out
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Prometheus text exposition of the snapshot.
pub fn render_prometheus(snapshot: &StatusSnapshot, health: Option<&HealthReport>) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# HELP scm_sync_jobs Jobs by status.");
    let _ = writeln!(out, "# TYPE scm_sync_jobs gauge");
    for (status, count) in &snapshot.job_counts {
        let _ = writeln!(out, "scm_sync_jobs{{status=\"{status}\"}} {count}");
    }

    let _ = writeln!(
        out,
        "# HELP scm_sync_jobs_expired_running Running jobs with a lease expired beyond grace."
    );
    let _ = writeln!(out, "# TYPE scm_sync_jobs_expired_running gauge");
    let _ = writeln!(
        out,
        "scm_sync_jobs_expired_running {}",
        snapshot.expired_running_jobs.len()
    );

    let _ = writeln!(out, "# HELP scm_sync_locks_expired Locks expired beyond grace.");
    let _ = writeln!(out, "# TYPE scm_sync_locks_expired gauge");
    let _ = writeln!(out, "scm_sync_locks_expired {}", snapshot.expired_locks.len());
    let _ = writeln!(out, "# HELP scm_sync_locks_orphaned Locks without a running job.");
    let _ = writeln!(out, "# TYPE scm_sync_locks_orphaned gauge");
    let _ = writeln!(out, "scm_sync_locks_orphaned {}", snapshot.orphaned_locks.len());

    let _ = writeln!(
        out,
        "# HELP scm_sync_breaker_state Circuit breaker state (0 closed, 1 half-open, 2 open)."
    );
    let _ = writeln!(out, "# TYPE scm_sync_breaker_state gauge");
    for breaker in &snapshot.breakers {
        let _ = writeln!(
            out,
            "scm_sync_breaker_state{{key=\"{}\"}} {}",
            escape_label(&breaker.snapshot.key),
            breaker.snapshot.state.gauge_value()
        );
    }

    let _ = writeln!(
        out,
        "# HELP scm_sync_rate_limit_paused Rate-limit bucket pause state (1 paused)."
    );
    let _ = writeln!(out, "# TYPE scm_sync_rate_limit_paused gauge");
    for bucket in &snapshot.rate_limit_buckets {
        let _ = writeln!(
            out,
            "scm_sync_rate_limit_paused{{bucket=\"{}\"}} {}",
            escape_label(&bucket.bucket_key),
            u8::from(bucket.paused)
        );
    }

    let _ = writeln!(out, "# HELP scm_sync_pauses Active operator pauses by reason.");
    let _ = writeln!(out, "# TYPE scm_sync_pauses gauge");
    for (reason, count) in &snapshot.pauses_by_reason {
        let _ = writeln!(
            out,
            "scm_sync_pauses{{reason=\"{}\"}} {count}",
            escape_label(reason)
        );
    }

    let _ = writeln!(
        out,
        "# HELP scm_sync_retry_backoff_seconds Scheduled backoff of jobs awaiting retry."
    );
    let _ = writeln!(out, "# TYPE scm_sync_retry_backoff_seconds summary");
    let sum: f64 = snapshot.retry_backoffs.iter().map(|b| b.backoff_seconds).sum();
    let _ = writeln!(out, "scm_sync_retry_backoff_seconds_sum {sum}");
    let _ = writeln!(
        out,
        "scm_sync_retry_backoff_seconds_count {}",
        snapshot.retry_backoffs.len()
    );

    if let Some(health) = health {
        let _ = writeln!(out, "# HELP scm_sync_health_violations Health violations by severity.");
        let _ = writeln!(out, "# TYPE scm_sync_health_violations gauge");
        for severity in [Severity::Critical, Severity::Warning, Severity::Info] {
            let _ = writeln!(
                out,
                "scm_sync_health_violations{{severity=\"{}\"}} {}",
                severity.as_str(),
                health.count(severity)
            );
        }
    }
    out
}
