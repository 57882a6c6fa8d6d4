//! # Admin
//!
//! Operator remediation: direct mutations of jobs, locks, pauses, cursors,
//! rate-limit buckets and breakers. Every applied mutation writes one
//! `sync_admin_audit` row; dry runs report what would change and write
//! nothing. The control loops never call into this module.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{EngineError, EngineResult};
use crate::lock::LockManager;
use crate::models::{rate_limit_bucket, sync_cursor, sync_pause};
use crate::policy::BreakerSnapshot;
use crate::queue::{JobListFilter, JobQueue, ResetDeadFilter, ResetDeadReport};
use crate::repositories::{
    AuditRepository, CircuitBreakerRepository, CursorRepository, PauseRepository,
    RateLimitRepository, RepositoryCatalog, bucket_key,
};
use crate::status::{JobSummary, LockSummary};
use crate::types::{JobType, SourceKind, Watermark};

/// Result of one admin mutation.
#[derive(Debug, Clone, Serialize)]
pub struct AdminChange {
    pub action: &'static str,
    pub dry_run: bool,
    /// Whether the mutation took effect, or would have on a dry run.
    pub applied: bool,
    pub target: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CursorView {
    pub repo_id: i64,
    pub job_type: String,
    pub watermark: Option<Watermark>,
    pub run_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

impl From<sync_cursor::Model> for CursorView {
    fn from(cursor: sync_cursor::Model) -> Self {
        Self {
            watermark: cursor.watermark(),
            repo_id: cursor.repo_id,
            job_type: cursor.job_type,
            run_id: cursor.run_id,
            updated_at: cursor.updated_at.with_timezone(&Utc),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PauseView {
    pub repo_id: i64,
    pub job_type: String,
    pub reason: String,
    pub paused_until: Option<DateTime<Utc>>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl From<sync_pause::Model> for PauseView {
    fn from(pause: sync_pause::Model) -> Self {
        Self {
            repo_id: pause.repo_id,
            job_type: pause.job_type,
            reason: pause.reason,
            paused_until: pause.paused_until.map(|at| at.with_timezone(&Utc)),
            created_by: pause.created_by,
            created_at: pause.created_at.with_timezone(&Utc),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketView {
    pub bucket_key: String,
    pub paused_until: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<rate_limit_bucket::Model> for BucketView {
    fn from(bucket: rate_limit_bucket::Model) -> Self {
        Self {
            bucket_key: bucket.bucket_key,
            paused_until: bucket.paused_until.map(|at| at.with_timezone(&Utc)),
            reason: bucket.reason,
            updated_at: bucket.updated_at.with_timezone(&Utc),
        }
    }
}

/// Parses an operator-supplied watermark and checks it fits the repository's
/// source kind.
pub fn parse_watermark(kind: SourceKind, value: &str) -> EngineResult<Watermark> {
    let watermark: Watermark = value
        .parse()
        .map_err(|err| EngineError::invalid(format!("{err}")))?;
    match (&watermark, kind.uses_revisions()) {
        (Watermark::Revision(_), true) | (Watermark::Timestamp(_), false) => Ok(watermark),
        _ => Err(EngineError::invalid(format!(
            "watermark {watermark} does not fit a {kind} repository"
        ))),
    }
}

#[derive(Debug, Clone)]
pub struct AdminService {
    actor: String,
    config: Arc<AppConfig>,
    queue: JobQueue,
    locks: LockManager,
    cursors: CursorRepository,
    pauses: PauseRepository,
    buckets: RateLimitRepository,
    breakers: CircuitBreakerRepository,
    catalog: RepositoryCatalog,
    audit: AuditRepository,
}

impl AdminService {
    pub fn new(config: Arc<AppConfig>, db: Arc<DatabaseConnection>, actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            queue: JobQueue::new(db.clone(), config.queue.clone(), config.retry.clone()),
            locks: LockManager::new(db.clone()),
            cursors: CursorRepository::new(db.clone()),
            pauses: PauseRepository::new(db.clone()),
            buckets: RateLimitRepository::new(db.clone()),
            breakers: CircuitBreakerRepository::new(db.clone()),
            catalog: RepositoryCatalog::new(db.clone()),
            audit: AuditRepository::new(db),
            config,
        }
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    async fn finish(
        &self,
        action: &'static str,
        dry_run: bool,
        applied: bool,
        target: JsonValue,
        detail: Option<JsonValue>,
    ) -> EngineResult<AdminChange> {
        if !dry_run {
            let mut recorded = detail.clone().unwrap_or_else(|| json!({}));
            if let Some(map) = recorded.as_object_mut() {
                map.insert("applied".to_string(), JsonValue::Bool(applied));
            }
            self.audit
                .record(action, &self.actor, target.clone(), Some(recorded))
                .await?;
            info!(action, actor = %self.actor, applied, target = %target, "Admin action applied");
        }
        Ok(AdminChange {
            action,
            dry_run,
            applied,
            target,
            detail,
        })
    }

    // jobs

    pub async fn list_jobs(&self, filter: &JobListFilter) -> EngineResult<Vec<JobSummary>> {
        Ok(self
            .queue
            .list(filter)
            .await?
            .iter()
            .map(JobSummary::from)
            .collect())
    }

    /// Returns dead jobs to pending. Keys that already have an active job are
    /// skipped so the one-active-job invariant holds.
    #[instrument(skip(self))]
    pub async fn reset_dead(
        &self,
        filter: &ResetDeadFilter,
        dry_run: bool,
    ) -> EngineResult<ResetDeadReport> {
        let report = if dry_run {
            let active: HashSet<(i64, String)> = self
                .queue
                .list_active()
                .await?
                .into_iter()
                .map(|job| (job.repo_id, job.job_type))
                .collect();
            let mut report = ResetDeadReport::default();
            let mut planned = HashSet::new();
            for job in self.queue.list_dead(filter).await? {
                let key = (job.repo_id, job.job_type.clone());
                if active.contains(&key) || !planned.insert(key) {
                    report.skipped.push(job.job_id);
                } else {
                    report.reset.push(job.job_id);
                }
            }
            report
        } else {
            self.queue.reset_dead(filter).await?
        };

        self.finish(
            "jobs.reset_dead",
            dry_run,
            !report.reset.is_empty(),
            json!({
                "job_id": filter.job_id,
                "repo_id": filter.repo_id,
                "job_type": filter.job_type,
                "gitlab_instance": filter.gitlab_instance,
            }),
            Some(serde_json::to_value(&report)?),
        )
        .await?;
        Ok(report)
    }

    #[instrument(skip(self))]
    pub async fn mark_dead(&self, job_id: Uuid, reason: &str, dry_run: bool) -> EngineResult<AdminChange> {
        let job = self
            .queue
            .find(job_id)
            .await?
            .ok_or_else(|| EngineError::not_found("job", job_id))?;
        let applied = if dry_run {
            job.status()?.is_active()
        } else {
            self.queue.force_mark_dead(job_id, reason).await?
        };
        self.finish(
            "jobs.mark_dead",
            dry_run,
            applied,
            json!({ "job_id": job_id }),
            Some(json!({ "reason": reason, "previous_status": job.status })),
        )
        .await
    }

    // locks

    pub async fn list_locks(&self) -> EngineResult<Vec<LockSummary>> {
        Ok(self.locks.list().await?.iter().map(LockSummary::from).collect())
    }

    pub async fn list_expired_locks(&self, grace_seconds: Option<u64>) -> EngineResult<Vec<LockSummary>> {
        let grace = grace_seconds.unwrap_or(self.config.reaper.grace_seconds);
        Ok(self
            .locks
            .list_expired(grace)
            .await?
            .iter()
            .map(LockSummary::from)
            .collect())
    }

    #[instrument(skip(self))]
    pub async fn force_release(&self, lock_id: Uuid, dry_run: bool) -> EngineResult<AdminChange> {
        let existing = self
            .locks
            .list()
            .await?
            .into_iter()
            .find(|lock| lock.lock_id == lock_id);
        let detail = existing
            .as_ref()
            .map(|lock| serde_json::to_value(LockSummary::from(lock)))
            .transpose()?;
        let applied = if dry_run {
            existing.is_some()
        } else {
            self.locks.force_release(lock_id).await?
        };
        self.finish(
            "locks.force_release",
            dry_run,
            applied,
            json!({ "lock_id": lock_id }),
            detail,
        )
        .await
    }

    // pauses

    pub async fn list_pauses(&self) -> EngineResult<Vec<PauseView>> {
        Ok(self
            .pauses
            .list()
            .await?
            .into_iter()
            .map(PauseView::from)
            .collect())
    }

    #[instrument(skip(self))]
    pub async fn set_pause(
        &self,
        repo: &str,
        job_type: JobType,
        reason: &str,
        paused_until: Option<DateTime<Utc>>,
        dry_run: bool,
    ) -> EngineResult<AdminChange> {
        if reason.trim().is_empty() {
            return Err(EngineError::invalid("pause reason must not be empty"));
        }
        let repository = self.catalog.resolve(repo).await?;
        if !dry_run {
            self.pauses
                .set(
                    repository.repo_id,
                    job_type,
                    reason,
                    paused_until,
                    &self.actor,
                    Utc::now(),
                )
                .await?;
        }
        self.finish(
            "pauses.set",
            dry_run,
            true,
            json!({ "repo_id": repository.repo_id, "job_type": job_type }),
            Some(json!({ "reason": reason, "paused_until": paused_until })),
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn unset_pause(&self, repo: &str, job_type: JobType, dry_run: bool) -> EngineResult<AdminChange> {
        let repository = self.catalog.resolve(repo).await?;
        let applied = if dry_run {
            self.pauses
                .list()
                .await?
                .iter()
                .any(|p| p.repo_id == repository.repo_id && p.job_type == job_type.as_str())
        } else {
            self.pauses.unset(repository.repo_id, job_type).await?
        };
        self.finish(
            "pauses.unset",
            dry_run,
            applied,
            json!({ "repo_id": repository.repo_id, "job_type": job_type }),
            None,
        )
        .await
    }

    // cursors

    pub async fn list_cursors(&self, repo: Option<&str>) -> EngineResult<Vec<CursorView>> {
        let repo_id = match repo {
            Some(reference) => Some(self.catalog.resolve(reference).await?.repo_id),
            None => None,
        };
        Ok(self
            .cursors
            .list(repo_id)
            .await?
            .into_iter()
            .map(CursorView::from)
            .collect())
    }

    pub async fn get_cursor(&self, repo: &str, job_type: JobType) -> EngineResult<Option<CursorView>> {
        let repository = self.catalog.resolve(repo).await?;
        Ok(self
            .cursors
            .get(repository.repo_id, job_type)
            .await?
            .map(CursorView::from))
    }

    /// Overwrites a cursor, moving it backwards if asked.
    #[instrument(skip(self))]
    pub async fn set_cursor(
        &self,
        repo: &str,
        job_type: JobType,
        value: &str,
        dry_run: bool,
    ) -> EngineResult<AdminChange> {
        let repository = self.catalog.resolve(repo).await?;
        let watermark = parse_watermark(repository.source_kind()?, value)?;
        let previous = self
            .cursors
            .get(repository.repo_id, job_type)
            .await?
            .and_then(|cursor| cursor.watermark());
        if !dry_run {
            self.cursors
                .set(repository.repo_id, job_type, &watermark)
                .await?;
        }
        self.finish(
            "cursors.set",
            dry_run,
            previous.as_ref() != Some(&watermark),
            json!({ "repo_id": repository.repo_id, "job_type": job_type }),
            Some(json!({ "previous": previous, "watermark": watermark })),
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn delete_cursor(&self, repo: &str, job_type: JobType, dry_run: bool) -> EngineResult<AdminChange> {
        let repository = self.catalog.resolve(repo).await?;
        let previous = self.cursors.get(repository.repo_id, job_type).await?;
        let applied = if dry_run {
            previous.is_some()
        } else {
            self.cursors.delete(repository.repo_id, job_type).await?
        };
        self.finish(
            "cursors.delete",
            dry_run,
            applied,
            json!({ "repo_id": repository.repo_id, "job_type": job_type }),
            Some(json!({ "previous": previous.and_then(|cursor| cursor.watermark()) })),
        )
        .await
    }

    // rate-limit buckets

    pub async fn list_buckets(&self) -> EngineResult<Vec<BucketView>> {
        Ok(self
            .buckets
            .list()
            .await?
            .into_iter()
            .map(BucketView::from)
            .collect())
    }

    #[instrument(skip(self))]
    pub async fn pause_bucket(
        &self,
        instance: &str,
        until: DateTime<Utc>,
        reason: &str,
        dry_run: bool,
    ) -> EngineResult<AdminChange> {
        let key = bucket_key(instance);
        if key.is_empty() {
            return Err(EngineError::invalid("bucket instance must not be empty"));
        }
        let now = Utc::now();
        if until <= now {
            return Err(EngineError::invalid("pause end must be in the future"));
        }
        if !dry_run {
            self.buckets.pause(&key, until, reason, false, now).await?;
        }
        self.finish(
            "rate_limit.pause",
            dry_run,
            true,
            json!({ "bucket_key": key }),
            Some(json!({ "paused_until": until, "reason": reason })),
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn unpause_bucket(&self, instance: &str, dry_run: bool) -> EngineResult<AdminChange> {
        let key = bucket_key(instance);
        let applied = if dry_run {
            self.buckets.get(&key).await?.is_some()
        } else {
            self.buckets.unpause(&key, Utc::now()).await?
        };
        self.finish(
            "rate_limit.unpause",
            dry_run,
            applied,
            json!({ "bucket_key": key }),
            None,
        )
        .await
    }

    // breakers

    pub async fn list_breakers(&self) -> EngineResult<Vec<BreakerSnapshot>> {
        self.breakers.list().await
    }

    #[instrument(skip(self))]
    pub async fn reset_breaker(&self, key: &str, dry_run: bool) -> EngineResult<AdminChange> {
        let previous = self.breakers.get(key).await?;
        let applied = if dry_run {
            previous.is_some()
        } else {
            self.breakers.reset(key, Utc::now()).await?
        };
        self.finish(
            "breakers.reset",
            dry_run,
            applied,
            json!({ "breaker_key": key }),
            Some(json!({ "previous_state": previous.map(|snapshot| snapshot.state) })),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_must_match_source_kind() {
        assert_eq!(
            parse_watermark(SourceKind::Svn, "r42").unwrap(),
            Watermark::Revision(42)
        );
        assert!(parse_watermark(SourceKind::Svn, "2025-01-01T00:00:00Z").is_err());
        assert!(matches!(
            parse_watermark(SourceKind::GitLab, "2025-01-01T00:00:00Z").unwrap(),
            Watermark::Timestamp(_)
        ));
        assert!(parse_watermark(SourceKind::GitHub, "17").is_err());
        assert!(parse_watermark(SourceKind::GitLab, "yesterday").is_err());
    }
}
