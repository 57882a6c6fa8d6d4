#[path = "test_utils/mod.rs"]
mod test_utils;

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use scm_sync::lock::LockManager;
use scm_sync::queue::{ClaimFilter, EnqueueRequest, JobQueue};
use scm_sync::repositories::{RateLimitRepository, bucket_key};
use scm_sync::status::{Severity, StatusService, evaluate_health, render_prometheus, render_text};
use scm_sync::types::{
    ErrorCategory, ErrorSummary, JobMode, JobPayload, JobStatus, JobType, SourceKind,
};
use sea_orm::DatabaseConnection;
use test_utils::{
    INSTANCE, insert_gitlab_repository, insert_repository, setup_test_db_arc, test_config,
    test_config_arc,
};

fn queue(db: &Arc<DatabaseConnection>) -> JobQueue {
    let config = test_config();
    JobQueue::new(db.clone(), config.queue, config.retry)
}

fn gitlab_request(repo_id: i64, job_type: JobType) -> EnqueueRequest {
    EnqueueRequest::new(repo_id, job_type, JobMode::Incremental).with_payload(JobPayload {
        gitlab_instance: Some(INSTANCE.to_string()),
        ..JobPayload::default()
    })
}

#[tokio::test]
async fn empty_store_is_healthy() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let config = test_config_arc();
    let snapshot = StatusService::new(config.clone(), db).snapshot(None).await?;
    let health = evaluate_health(&snapshot, &config);

    assert_eq!(health.exit_code, 0);
    assert_eq!(health.status, "healthy");
    assert_eq!(snapshot.job_counts.get(&JobStatus::Pending), Some(&0));

    let metrics = render_prometheus(&snapshot, Some(&health));
    assert!(metrics.contains("scm_sync_jobs{status=\"pending\"} 0"));
    assert!(metrics.contains("scm_sync_health_violations{severity=\"critical\"} 0"));
    Ok(())
}

#[tokio::test]
async fn dead_jobs_raise_a_warning() -> Result<()> {
    let db = setup_test_db_arc().await?;
    insert_gitlab_repository(&db, 1).await?;
    let queue = queue(&db);
    let job_id = queue
        .enqueue(gitlab_request(1, JobType::Commits))
        .await?
        .job_id();
    queue.claim("w", &ClaimFilter::default(), 1).await?;
    queue
        .mark_dead(job_id, "w", &ErrorSummary::new(ErrorCategory::Unauthorized, "token revoked"))
        .await?;

    let config = test_config_arc();
    let snapshot = StatusService::new(config.clone(), db).snapshot(None).await?;
    let health = evaluate_health(&snapshot, &config);

    assert_eq!(health.exit_code, 1);
    assert_eq!(health.status, "warning");
    assert_eq!(health.violations.len(), 1);
    assert_eq!(health.violations[0].code, "dead_jobs");
    assert_eq!(snapshot.dead_jobs[0].job_id, job_id);
    assert_eq!(snapshot.job_counts.get(&JobStatus::Dead), Some(&1));

    let text = render_text(&snapshot, Some(&health), true);
    assert!(text.contains("dead_jobs"));
    Ok(())
}

#[tokio::test]
async fn expired_running_job_is_critical() -> Result<()> {
    let db = setup_test_db_arc().await?;
    insert_gitlab_repository(&db, 1).await?;
    let queue = queue(&db);
    let started = Utc::now() - Duration::hours(2);
    let job_id = queue
        .enqueue_at(gitlab_request(1, JobType::Commits), started)
        .await?
        .job_id();
    queue
        .claim_at("vanished", &ClaimFilter::default(), 1, started)
        .await?;
    LockManager::new(db.clone())
        .acquire_at(1, JobType::Commits, "vanished", 300, Some(job_id), started)
        .await?;

    let config = test_config_arc();
    let snapshot = StatusService::new(config.clone(), db)
        .snapshot_at(Utc::now(), None)
        .await?;
    let health = evaluate_health(&snapshot, &config);

    assert_eq!(health.exit_code, 2);
    assert_eq!(health.status, "critical");
    assert_eq!(snapshot.expired_running_jobs.len(), 1);
    assert_eq!(snapshot.expired_locks.len(), 1);
    // The expired lock still points at a running job, so it is not orphaned.
    assert!(snapshot.orphaned_locks.is_empty());
    assert_eq!(health.violations[0].code, "expired_running_job");
    assert_eq!(health.count(Severity::Critical), 1);

    let metrics = render_prometheus(&snapshot, Some(&health));
    assert!(metrics.contains("scm_sync_jobs_expired_running 1"));
    assert!(metrics.contains("scm_sync_locks_expired 1"));
    Ok(())
}

#[tokio::test]
async fn orphaned_lock_is_critical() -> Result<()> {
    let db = setup_test_db_arc().await?;
    LockManager::new(db.clone())
        .acquire(7, JobType::MergeRequests, "ghost", 3600, None)
        .await?;

    let config = test_config_arc();
    let snapshot = StatusService::new(config.clone(), db).snapshot(None).await?;
    let health = evaluate_health(&snapshot, &config);

    assert_eq!(snapshot.orphaned_locks.len(), 1);
    assert_eq!(snapshot.orphaned_locks[0].locked_by, "ghost");
    assert_eq!(health.exit_code, 2);
    assert_eq!(health.violations[0].code, "orphaned_lock");
    Ok(())
}

#[tokio::test]
async fn gitlab_jobs_without_instance_are_flagged() -> Result<()> {
    let db = setup_test_db_arc().await?;
    insert_gitlab_repository(&db, 1).await?;
    insert_repository(&db, 2, "svn/trunk", SourceKind::Svn, None, None).await?;
    let queue = queue(&db);
    let gitlab_job = queue
        .enqueue(EnqueueRequest::new(1, JobType::Commits, JobMode::Incremental))
        .await?
        .job_id();
    queue
        .enqueue(EnqueueRequest::new(2, JobType::Commits, JobMode::Incremental))
        .await?;

    let config = test_config_arc();
    let snapshot = StatusService::new(config.clone(), db).snapshot(None).await?;
    let health = evaluate_health(&snapshot, &config);

    assert_eq!(snapshot.jobs_missing_dimensions.len(), 1);
    assert_eq!(snapshot.jobs_missing_dimensions[0].job_id, gitlab_job);
    assert_eq!(health.exit_code, 1);
    assert_eq!(health.violations[0].code, "missing_dimension");
    Ok(())
}

#[tokio::test]
async fn paused_bucket_is_informational() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let now = Utc::now();
    RateLimitRepository::new(db.clone())
        .pause(&bucket_key(INSTANCE), now + Duration::minutes(5), "429", true, now)
        .await?;

    let config = test_config_arc();
    let snapshot = StatusService::new(config.clone(), db)
        .snapshot_at(now, None)
        .await?;
    let health = evaluate_health(&snapshot, &config);

    assert_eq!(health.exit_code, 0);
    assert_eq!(health.count(Severity::Info), 1);
    assert_eq!(health.violations[0].code, "rate_limit_paused");

    let metrics = render_prometheus(&snapshot, Some(&health));
    assert!(metrics.contains(&format!("scm_sync_rate_limit_paused{{bucket=\"{INSTANCE}\"}} 1")));
    Ok(())
}

#[tokio::test]
async fn retry_backoff_is_reported() -> Result<()> {
    let db = setup_test_db_arc().await?;
    insert_gitlab_repository(&db, 1).await?;
    let queue = queue(&db);
    let now = Utc::now();
    let job_id = queue
        .enqueue_at(gitlab_request(1, JobType::Commits), now)
        .await?
        .job_id();
    queue.claim_at("w", &ClaimFilter::default(), 1, now).await?;
    queue
        .fail_retry_at(
            job_id,
            "w",
            &ErrorSummary::new(ErrorCategory::Transient, "502"),
            Some(now + Duration::seconds(120)),
            now,
        )
        .await?;

    let config = test_config_arc();
    let snapshot = StatusService::new(config.clone(), db)
        .snapshot_at(now, None)
        .await?;
    assert_eq!(snapshot.retry_backoffs.len(), 1);
    assert!((snapshot.retry_backoffs[0].backoff_seconds - 120.0).abs() < 1.0);

    let metrics = render_prometheus(&snapshot, None);
    assert!(metrics.contains("scm_sync_retry_backoff_seconds_count 1"));
    assert!(!metrics.contains("scm_sync_health_violations"));
    Ok(())
}
