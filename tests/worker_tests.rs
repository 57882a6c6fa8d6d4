#[path = "test_utils/mod.rs"]
mod test_utils;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use scm_sync::lock::LockManager;
use scm_sync::queue::{EnqueueRequest, RequeueOutcome};
use scm_sync::repositories::{CursorRepository, RateLimitRepository, RunRepository, bucket_key};
use scm_sync::sources::{
    ExampleSource, FetchOutcome, FetchRequest, SourceError, SourceRegistry, SyncSource,
};
use scm_sync::types::{
    ErrorCategory, JobMode, JobPayload, JobStatus, JobType, RunCounts, RunStatus, Watermark,
};
use scm_sync::worker::{JobOutcome, SyncWorker};
use sea_orm::DatabaseConnection;
use test_utils::{
    INSTANCE, insert_gitlab_repository, setup_test_db_arc, test_config, test_config_arc,
};

/// Replays scripted fetch results and records the requests it saw.
#[derive(Default)]
struct ScriptedSource {
    responses: Mutex<VecDeque<Result<FetchOutcome, SourceError>>>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl ScriptedSource {
    fn new(responses: Vec<Result<FetchOutcome, SourceError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::default(),
        })
    }

    fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl SyncSource for ScriptedSource {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn fetch(&self, request: FetchRequest) -> Result<FetchOutcome, SourceError> {
        self.requests.lock().expect("requests lock").push(request);
        self.responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .unwrap_or_else(|| Ok(FetchOutcome::default()))
    }
}

fn fetched(count: u64, watermark: Watermark, has_more: bool) -> FetchOutcome {
    FetchOutcome {
        stats: RunCounts {
            fetched: count,
            inserted: count,
            ..RunCounts::default()
        },
        watermark_end: Some(watermark),
        has_more,
    }
}

fn worker_with(db: &Arc<DatabaseConnection>, source: Option<Arc<ScriptedSource>>) -> SyncWorker {
    let mut registry = SourceRegistry::new();
    if let Some(source) = source {
        registry.register(JobType::Commits, source);
    }
    SyncWorker::new(db.clone(), test_config_arc(), Arc::new(registry), "worker-1")
}

async fn enqueue_commits(worker: &SyncWorker, repo_id: i64) -> Result<uuid::Uuid> {
    let payload = JobPayload {
        gitlab_instance: Some(INSTANCE.to_string()),
        tenant_id: Some("tenant-a".to_string()),
        ..JobPayload::default()
    };
    let outcome = worker
        .queue()
        .enqueue(
            EnqueueRequest::new(repo_id, JobType::Commits, JobMode::Incremental)
                .with_payload(payload),
        )
        .await?;
    Ok(outcome.job_id())
}

#[tokio::test]
async fn successful_fetch_advances_cursor_and_completes_job() -> Result<()> {
    let db = setup_test_db_arc().await?;
    insert_gitlab_repository(&db, 42).await?;
    let end = Utc::now() - Duration::minutes(1);
    let source = ScriptedSource::new(vec![Ok(fetched(12, Watermark::Timestamp(end), false))]);
    let worker = worker_with(&db, Some(source.clone()));
    let job_id = enqueue_commits(&worker, 42).await?;

    let outcomes = worker.run_once().await?;
    assert_eq!(outcomes.len(), 1);
    let JobOutcome::Completed {
        run_id,
        status,
        counts,
        follow_up_job_id,
        ..
    } = outcomes[0].clone()
    else {
        panic!("expected completion, got {:?}", outcomes[0]);
    };
    assert_eq!(status, RunStatus::Completed);
    assert_eq!(counts.fetched, 12);
    assert!(follow_up_job_id.is_none());

    let job = worker.queue().find(job_id).await?.expect("job exists");
    assert_eq!(job.status()?, JobStatus::Completed);

    let cursor = CursorRepository::new(db.clone())
        .get(42, JobType::Commits)
        .await?
        .expect("cursor written");
    assert_eq!(cursor.watermark(), Some(Watermark::Timestamp(end)));
    assert_eq!(cursor.run_id, Some(run_id));

    let run = RunRepository::new(db.clone()).find(run_id).await?.expect("run exists");
    assert_eq!(run.status, RunStatus::Completed.as_str());
    assert!(run.finished_at.is_some());
    assert!(LockManager::new(db.clone()).get(42, JobType::Commits).await?.is_none());

    let requests = source.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].repo_key, "group/project-42");
    assert!(requests[0].cursor.is_none());
    Ok(())
}

#[tokio::test]
async fn has_more_enqueues_an_incremental_follow_up() -> Result<()> {
    let db = setup_test_db_arc().await?;
    insert_gitlab_repository(&db, 42).await?;
    let first_end = Utc::now() - Duration::hours(2);
    let source = ScriptedSource::new(vec![
        Ok(fetched(100, Watermark::Timestamp(first_end), true)),
        Ok(FetchOutcome::default()),
    ]);
    let worker = worker_with(&db, Some(source.clone()));
    enqueue_commits(&worker, 42).await?;

    let outcomes = worker.run_once().await?;
    let JobOutcome::Completed {
        follow_up_job_id: Some(follow_up),
        ..
    } = outcomes[0].clone()
    else {
        panic!("expected a follow-up, got {:?}", outcomes[0]);
    };

    let job = worker.queue().find(follow_up).await?.expect("follow-up exists");
    assert_eq!(job.status()?, JobStatus::Pending);
    assert_eq!(job.mode()?, JobMode::Incremental);
    assert_eq!(job.gitlab_instance.as_deref(), Some(INSTANCE));

    // The follow-up resumes from the cursor the first page committed.
    let outcomes = worker.run_once().await?;
    assert!(matches!(
        outcomes[0],
        JobOutcome::Completed {
            status: RunStatus::NoData,
            ..
        }
    ));
    let requests = source.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].cursor, Some(Watermark::Timestamp(first_end)));
    Ok(())
}

#[tokio::test]
async fn rate_limit_pauses_bucket_and_schedules_retry() -> Result<()> {
    let db = setup_test_db_arc().await?;
    insert_gitlab_repository(&db, 42).await?;
    let source = ScriptedSource::new(vec![Err(SourceError::rate_limited(Some(120)))]);
    let worker = worker_with(&db, Some(source));
    let job_id = enqueue_commits(&worker, 42).await?;
    let before = Utc::now();

    let outcomes = worker.run_once().await?;
    let JobOutcome::Retrying {
        category,
        backoff_seconds,
        run_id,
        ..
    } = outcomes[0].clone()
    else {
        panic!("expected retry, got {:?}", outcomes[0]);
    };
    assert_eq!(category, ErrorCategory::RateLimited);
    assert!(backoff_seconds >= 120.0);

    let job = worker.queue().find(job_id).await?.expect("job exists");
    assert_eq!(job.status()?, JobStatus::Failed);
    assert!(job.not_before.with_timezone(&Utc) >= before + Duration::seconds(120));

    let bucket = RateLimitRepository::new(db.clone())
        .get(&bucket_key(INSTANCE))
        .await?
        .expect("bucket paused");
    let paused_until = bucket.paused_until.expect("pause recorded").with_timezone(&Utc);
    assert!(paused_until >= before + Duration::seconds(119));

    let run = RunRepository::new(db.clone()).find(run_id).await?.expect("run exists");
    assert_eq!(run.status, RunStatus::Failed.as_str());
    assert_eq!(run.error_category.as_deref(), Some("rate_limited"));
    assert!(CursorRepository::new(db.clone()).get(42, JobType::Commits).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn non_retryable_errors_dead_letter_immediately() -> Result<()> {
    let db = setup_test_db_arc().await?;
    insert_gitlab_repository(&db, 42).await?;
    let source = ScriptedSource::new(vec![Err(SourceError::unauthorized("token revoked"))]);
    let worker = worker_with(&db, Some(source));
    let job_id = enqueue_commits(&worker, 42).await?;

    let outcomes = worker.run_once().await?;
    assert!(matches!(
        outcomes[0],
        JobOutcome::DeadLettered {
            category: ErrorCategory::Unauthorized,
            run_id: Some(_),
            ..
        }
    ));

    let job = worker.queue().find(job_id).await?.expect("job exists");
    assert_eq!(job.status()?, JobStatus::Dead);
    assert_eq!(job.dead_reason.as_deref(), Some("token revoked"));
    assert!(LockManager::new(db.clone()).get(42, JobType::Commits).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn missing_source_dead_letters_as_configuration() -> Result<()> {
    let db = setup_test_db_arc().await?;
    insert_gitlab_repository(&db, 42).await?;
    let worker = worker_with(&db, None);
    let job_id = enqueue_commits(&worker, 42).await?;

    let outcomes = worker.run_once().await?;
    assert!(matches!(
        outcomes[0],
        JobOutcome::DeadLettered {
            category: ErrorCategory::Configuration,
            ..
        }
    ));
    let job = worker.queue().find(job_id).await?.expect("job exists");
    assert_eq!(job.status()?, JobStatus::Dead);
    Ok(())
}

#[tokio::test]
async fn unknown_repository_dead_letters_as_not_found() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let source = ScriptedSource::new(Vec::new());
    let worker = worker_with(&db, Some(source.clone()));
    enqueue_commits(&worker, 999).await?;

    let outcomes = worker.run_once().await?;
    assert!(matches!(
        outcomes[0],
        JobOutcome::DeadLettered {
            category: ErrorCategory::NotFound,
            ..
        }
    ));
    assert!(source.requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn held_key_lock_requeues_without_penalty() -> Result<()> {
    let db = setup_test_db_arc().await?;
    insert_gitlab_repository(&db, 42).await?;
    let source = ScriptedSource::new(Vec::new());
    let worker = worker_with(&db, Some(source.clone()));
    let job_id = enqueue_commits(&worker, 42).await?;

    assert!(
        LockManager::new(db.clone())
            .acquire(42, JobType::Commits, "someone-else", 300, None)
            .await?
    );

    let outcomes = worker.run_once().await?;
    assert!(matches!(
        outcomes[0],
        JobOutcome::Contended {
            requeue: RequeueOutcome::Requeued { .. },
            ..
        }
    ));
    let job = worker.queue().find(job_id).await?.expect("job exists");
    assert_eq!(job.status()?, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
    assert!(source.requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn stale_watermark_does_not_move_cursor_backwards() -> Result<()> {
    let db = setup_test_db_arc().await?;
    insert_gitlab_repository(&db, 42).await?;
    let stored = Utc::now() - Duration::hours(1);
    CursorRepository::new(db.clone())
        .set(42, JobType::Commits, &Watermark::Timestamp(stored))
        .await?;

    let older = stored - Duration::hours(3);
    let source = ScriptedSource::new(vec![Ok(fetched(3, Watermark::Timestamp(older), false))]);
    let worker = worker_with(&db, Some(source.clone()));
    enqueue_commits(&worker, 42).await?;

    let outcomes = worker.run_once().await?;
    assert!(outcomes[0].is_success());
    assert_eq!(source.requests()[0].cursor, Some(Watermark::Timestamp(stored)));

    let cursor = CursorRepository::new(db.clone())
        .get(42, JobType::Commits)
        .await?
        .expect("cursor exists");
    assert_eq!(cursor.watermark(), Some(Watermark::Timestamp(stored)));
    Ok(())
}

#[tokio::test]
async fn lost_lease_abandons_the_fetch_and_keeps_the_cursor() -> Result<()> {
    let db = setup_test_db_arc().await?;
    insert_gitlab_repository(&db, 42).await?;
    let stored = Utc::now() - Duration::days(2);
    let cursors = CursorRepository::new(db.clone());
    cursors
        .set(42, JobType::Commits, &Watermark::Timestamp(stored))
        .await?;

    let mut config = test_config();
    config.worker.renew_interval_seconds = 1;
    config.worker.max_run_seconds = 30;
    let slow: Arc<dyn SyncSource> =
        Arc::new(ExampleSource::default().with_latency(std::time::Duration::from_secs(5)));
    let mut registry = SourceRegistry::new();
    registry.register(JobType::Commits, slow);
    let worker = SyncWorker::new(db.clone(), Arc::new(config), Arc::new(registry), "worker-1");
    let job_id = enqueue_commits(&worker, 42).await?;

    // The reaper hands the job back while the fetch is still in flight.
    let reclaim = async {
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        worker
            .queue()
            .reclaim_expired_at(0, false, Utc::now() + Duration::hours(1))
            .await
    };
    let (outcomes, reclaimed) = tokio::join!(worker.run_once(), reclaim);
    assert_eq!(reclaimed?.reclaimed, vec![job_id]);

    let outcomes = outcomes?;
    let JobOutcome::LeaseLost { run_id, .. } = outcomes[0].clone() else {
        panic!("expected lease loss, got {:?}", outcomes[0]);
    };

    let run = RunRepository::new(db.clone()).find(run_id).await?.expect("run exists");
    assert_eq!(run.status, RunStatus::Failed.as_str());
    assert_eq!(run.error_category.as_deref(), Some("lease_lost"));

    let cursor = cursors.get(42, JobType::Commits).await?.expect("cursor exists");
    assert_eq!(cursor.watermark(), Some(Watermark::Timestamp(stored)));
    assert!(LockManager::new(db.clone()).get(42, JobType::Commits).await?.is_none());

    // The job itself stays with the reaper's decision.
    let job = worker.queue().find(job_id).await?.expect("job exists");
    assert_eq!(job.status()?, JobStatus::Pending);
    assert!(job.locked_by.is_none());
    Ok(())
}
