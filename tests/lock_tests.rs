#[path = "test_utils/mod.rs"]
mod test_utils;

use anyhow::Result;
use chrono::{Duration, Utc};
use scm_sync::lock::{LockManager, NamedLease};
use scm_sync::queue::{ClaimFilter, EnqueueRequest, JobQueue};
use scm_sync::types::{JobMode, JobType};
use test_utils::{setup_test_db_arc, test_config};

#[tokio::test]
async fn second_worker_cannot_take_a_live_lock() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let locks = LockManager::new(db);
    let now = Utc::now();

    assert!(locks.acquire_at(1, JobType::Commits, "a", 60, None, now).await?);
    assert!(!locks.acquire_at(1, JobType::Commits, "b", 60, None, now).await?);
    // Different job type is a different key.
    assert!(locks.acquire_at(1, JobType::MergeRequests, "b", 60, None, now).await?);

    let held = locks.get(1, JobType::Commits).await?.expect("lock exists");
    assert_eq!(held.locked_by, "a");
    Ok(())
}

#[tokio::test]
async fn holder_reacquires_and_renews() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let locks = LockManager::new(db);
    let now = Utc::now();

    assert!(locks.acquire_at(1, JobType::Commits, "a", 60, None, now).await?);
    assert!(locks.acquire_at(1, JobType::Commits, "a", 60, None, now).await?);

    let later = now + Duration::seconds(45);
    assert!(locks.renew_at(1, JobType::Commits, "a", later).await?);
    assert!(!locks.renew_at(1, JobType::Commits, "b", later).await?);

    let held = locks.get(1, JobType::Commits).await?.expect("lock exists");
    assert_eq!(
        held.expires_at.with_timezone(&Utc).timestamp(),
        (later + Duration::seconds(60)).timestamp()
    );
    Ok(())
}

#[tokio::test]
async fn expired_lock_is_taken_over() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let locks = LockManager::new(db);
    let now = Utc::now();

    assert!(locks.acquire_at(1, JobType::Commits, "a", 30, None, now).await?);
    let later = now + Duration::seconds(31);
    assert!(locks.acquire_at(1, JobType::Commits, "b", 30, None, later).await?);

    let held = locks.get(1, JobType::Commits).await?.expect("lock exists");
    assert_eq!(held.locked_by, "b");
    assert!(!locks.release(1, JobType::Commits, "a").await?);
    assert!(locks.release(1, JobType::Commits, "b").await?);
    assert!(locks.get(1, JobType::Commits).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn expired_and_orphaned_locks_are_listed() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let config = test_config();
    let queue = JobQueue::new(db.clone(), config.queue, config.retry);
    let locks = LockManager::new(db);
    let now = Utc::now();

    let job_id = queue
        .enqueue_at(EnqueueRequest::new(1, JobType::Commits, JobMode::Incremental), now)
        .await?
        .job_id();
    queue.claim_at("a", &ClaimFilter::default(), 1, now).await?;
    assert!(locks.acquire_at(1, JobType::Commits, "a", 300, Some(job_id), now).await?);
    // Nothing is running for repo 2 under "ghost".
    assert!(locks.acquire_at(2, JobType::Commits, "ghost", 10, None, now).await?);

    let orphaned = locks.list_orphaned().await?;
    assert_eq!(orphaned.len(), 1);
    assert_eq!(orphaned[0].repo_id, 2);

    let expired = locks.list_expired_at(60, now + Duration::seconds(30)).await?;
    assert!(expired.is_empty());
    let expired = locks.list_expired_at(60, now + Duration::seconds(120)).await?;
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].locked_by, "ghost");

    let cutoff = now + Duration::seconds(60);
    assert!(locks.delete_if_expired(expired[0].lock_id, cutoff).await?);
    assert!(!locks.delete_if_held_by(orphaned[0].lock_id, "ghost").await?);
    assert_eq!(locks.list().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn force_release_ignores_holder() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let locks = LockManager::new(db);

    assert!(locks.acquire(5, JobType::ReviewEvents, "a", 60, None).await?);
    let lock = locks.get(5, JobType::ReviewEvents).await?.expect("lock exists");
    assert!(locks.force_release(lock.lock_id).await?);
    assert!(!locks.force_release(lock.lock_id).await?);
    assert!(locks.acquire(5, JobType::ReviewEvents, "b", 60, None).await?);
    Ok(())
}

#[tokio::test]
async fn named_lease_has_a_single_holder() -> Result<()> {
    let db = setup_test_db_arc().await?;
    let lease = NamedLease::new(db);
    let now = Utc::now();

    assert!(lease.try_acquire("scheduler", "one", 60, now).await?);
    assert!(!lease.try_acquire("scheduler", "two", 60, now).await?);
    assert!(lease.try_acquire("scheduler", "one", 60, now).await?);
    assert!(lease.renew("scheduler", "one", 60, now).await?);
    assert!(!lease.renew("scheduler", "two", 60, now).await?);

    let later = now + Duration::seconds(61);
    assert!(lease.try_acquire("scheduler", "two", 60, later).await?);
    assert_eq!(
        lease.current("scheduler").await?.map(|l| l.holder),
        Some("two".to_string())
    );
    assert!(!lease.release("scheduler", "one").await?);
    assert!(lease.release("scheduler", "two").await?);
    assert!(lease.current("scheduler").await?.is_none());
    Ok(())
}
