#[path = "test_utils/mod.rs"]
mod test_utils;

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use scm_sync::lock::LockManager;
use scm_sync::models::sync_job;
use scm_sync::queue::{ClaimFilter, EnqueueRequest, JobQueue};
use scm_sync::reaper::SyncReaper;
use scm_sync::repositories::{PauseRepository, RunRepository};
use scm_sync::run_finish::RunFinish;
use scm_sync::types::{ErrorCategory, JobMode, JobStatus, JobType, RunCounts, RunStatus};
use sea_orm::DatabaseConnection;
use test_utils::{setup_test_db_arc, test_config, test_config_arc};

/// A job claimed by a worker that then disappeared, leaving its lock and
/// open run behind.
async fn crashed_execution(
    db: &Arc<DatabaseConnection>,
    repo_id: i64,
    at: DateTime<Utc>,
) -> Result<(sync_job::Model, uuid::Uuid)> {
    let config = test_config();
    let queue = JobQueue::new(db.clone(), config.queue.clone(), config.retry);
    queue
        .enqueue_at(EnqueueRequest::new(repo_id, JobType::Commits, JobMode::Incremental), at)
        .await?;
    let job = queue
        .claim_at(
            "crashed-worker",
            &ClaimFilter {
                repo_id: Some(repo_id),
                ..ClaimFilter::default()
            },
            1,
            at,
        )
        .await?
        .pop()
        .expect("job claimed");
    LockManager::new(db.clone())
        .acquire_at(
            repo_id,
            JobType::Commits,
            "crashed-worker",
            config.queue.lease_seconds,
            Some(job.job_id),
            at,
        )
        .await?;
    let run = RunRepository::new(db.clone()).start(&job, false, None, at).await?;
    Ok((job, run.run_id))
}

#[tokio::test]
async fn reaper_recovers_a_crashed_worker() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let config = test_config();
    let started = Utc::now() - Duration::hours(1);
    let (job, run_id) = crashed_execution(&db, 1, started).await?;
    let reaper = SyncReaper::new(test_config_arc(), db.clone());
    let now = Utc::now();

    let preview = reaper.tick_at(now, true).await?;
    assert!(preview.dry_run);
    assert_eq!(preview.reclaimed_jobs, vec![job.job_id]);
    assert_eq!(preview.expired_locks.len(), 1);
    // Still running under the crashed worker until the real pass.
    assert!(preview.abandoned_runs.is_empty());

    let queue = JobQueue::new(db.clone(), config.queue, config.retry);
    assert_eq!(queue.find(job.job_id).await?.expect("job").status()?, JobStatus::Running);

    let report = reaper.tick_at(now, false).await?;
    assert_eq!(report.reclaimed_jobs, vec![job.job_id]);
    assert_eq!(report.expired_locks, preview.expired_locks);
    assert_eq!(report.abandoned_runs, vec![run_id]);

    let reclaimed = queue.find(job.job_id).await?.expect("job");
    assert_eq!(reclaimed.status()?, JobStatus::Pending);
    assert_eq!(reclaimed.attempts, 1);
    assert!(LockManager::new(db.clone()).get(1, JobType::Commits).await?.is_none());

    let run = RunRepository::new(db.clone()).find(run_id).await?.expect("run");
    assert_eq!(run.status, RunStatus::Failed.as_str());
    assert_eq!(run.error_category(), Some(ErrorCategory::LeaseLost));

    assert!(reaper.tick_at(now, false).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn live_executions_are_left_alone() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let now = Utc::now();
    crashed_execution(&db, 1, now).await?;

    let report = SyncReaper::new(test_config_arc(), db.clone())
        .tick_at(now + Duration::seconds(30), false)
        .await?;
    assert!(report.is_empty(), "unexpected work: {report:?}");
    assert!(LockManager::new(db.clone()).get(1, JobType::Commits).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn orphaned_locks_are_deleted() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let locks = LockManager::new(db.clone());
    locks.acquire(9, JobType::ReviewEvents, "ghost", 3600, None).await?;

    let reaper = SyncReaper::new(test_config_arc(), db.clone());
    let report = reaper.tick(false).await?;
    assert_eq!(report.orphaned_locks.len(), 1);
    assert!(report.expired_locks.is_empty());
    assert!(locks.get(9, JobType::ReviewEvents).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn old_runs_and_expired_pauses_are_pruned() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let config = test_config();
    let now = Utc::now();
    let long_ago = now - Duration::days(i64::from(config.reaper.run_retention_days) + 5);

    let queue = JobQueue::new(db.clone(), config.queue.clone(), config.retry.clone());
    let runs = RunRepository::new(db.clone());
    queue
        .enqueue_at(EnqueueRequest::new(1, JobType::Commits, JobMode::Incremental), long_ago)
        .await?;
    let job = queue
        .claim_at("w", &ClaimFilter::default(), 1, long_ago)
        .await?
        .pop()
        .expect("job claimed");
    let old_run = runs.start(&job, false, None, long_ago).await?;
    runs.finalize_at(
        old_run.run_id,
        &RunFinish::success(RunCounts::default(), None),
        long_ago,
    )
    .await?;
    queue.ack_at(job.job_id, "w", long_ago).await?;

    let pauses = PauseRepository::new(db.clone());
    pauses
        .set(1, JobType::Commits, "window", Some(now - Duration::hours(1)), "tests", now)
        .await?;
    pauses
        .set(1, JobType::MergeRequests, "open-ended", None, "tests", now)
        .await?;

    let reaper = SyncReaper::new(test_config_arc(), db.clone());
    let preview = reaper.tick_at(now, true).await?;
    assert_eq!(preview.pruned_runs, 1);
    assert_eq!(preview.expired_pauses, 1);
    assert!(runs.find(old_run.run_id).await?.is_some());

    let report = reaper.tick_at(now, false).await?;
    assert_eq!(report.pruned_runs, 1);
    assert_eq!(report.expired_pauses, 1);
    assert!(runs.find(old_run.run_id).await?.is_none());
    assert_eq!(pauses.list().await?.len(), 1);
    Ok(())
}
