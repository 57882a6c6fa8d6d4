//! # Key Locks and Named Leases
//!
//! [`LockManager`] guards execution per repository and job type: only the
//! holder of a key's lock may fetch for it. [`NamedLease`] backs process
//! singletons such as the scheduler.
//!
//! Both are lease based. An expired lock can be taken over by anyone; a live
//! one only by its holder.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, Set,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::to_db_time;
use crate::error::{EngineResult, db_err, is_unique_violation};
use crate::models::leader_lease::{self, Entity as LeaderLease};
use crate::models::sync_job::{self, Entity as SyncJob};
use crate::models::sync_lock::{ActiveModel, Column, Entity as SyncLock, Model};
use crate::types::{JobStatus, JobType};

#[derive(Debug, Clone)]
pub struct LockManager {
    db: Arc<DatabaseConnection>,
}

impl LockManager {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn acquire(
        &self,
        repo_id: i64,
        job_type: JobType,
        worker_id: &str,
        lease_seconds: u32,
        job_id: Option<Uuid>,
    ) -> EngineResult<bool> {
        self.acquire_at(repo_id, job_type, worker_id, lease_seconds, job_id, Utc::now())
            .await
    }

    /// Takes the key lock for `worker_id`.
    ///
    /// Re-acquiring a lock already held by the same worker refreshes it. An
    /// expired lock is taken over. Anything else fails closed.
    pub async fn acquire_at(
        &self,
        repo_id: i64,
        job_type: JobType,
        worker_id: &str,
        lease_seconds: u32,
        job_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let expires_at = now + Duration::seconds(lease_seconds as i64);
        let existing = self.get(repo_id, job_type).await?;

        let Some(current) = existing else {
            let insert = ActiveModel {
                lock_id: Set(Uuid::new_v4()),
                repo_id: Set(repo_id),
                job_type: Set(job_type.as_str().to_string()),
                job_id: Set(job_id),
                locked_by: Set(worker_id.to_string()),
                locked_at: Set(to_db_time(now)),
                lease_seconds: Set(lease_seconds as i32),
                expires_at: Set(to_db_time(expires_at)),
            }
            .insert(self.db.as_ref())
            .await;

            return match insert {
                Ok(_) => {
                    debug!(repo_id, job_type = %job_type, worker_id, "Lock acquired");
                    Ok(true)
                }
                Err(err) if is_unique_violation(&err) => {
                    debug!(repo_id, job_type = %job_type, worker_id, "Lock acquisition lost race");
                    Ok(false)
                }
                Err(err) => Err(db_err("failed to insert lock")(err)),
            };
        };

        let takeover = current.locked_by != worker_id;
        if takeover && current.expires_at.with_timezone(&Utc) >= now {
            debug!(
                repo_id,
                job_type = %job_type,
                worker_id,
                holder = %current.locked_by,
                "Lock held by another worker"
            );
            return Ok(false);
        }

        let mut condition = Condition::all()
            .add(Column::LockId.eq(current.lock_id))
            .add(Column::LockedBy.eq(current.locked_by.as_str()));
        if takeover {
            condition = condition.add(Column::ExpiresAt.lt(to_db_time(now)));
        }

        let result = SyncLock::update_many()
            .set(ActiveModel {
                job_id: Set(job_id),
                locked_by: Set(worker_id.to_string()),
                locked_at: Set(to_db_time(now)),
                lease_seconds: Set(lease_seconds as i32),
                expires_at: Set(to_db_time(expires_at)),
                ..Default::default()
            })
            .filter(condition)
            .exec(self.db.as_ref())
            .await
            .map_err(db_err("failed to take over lock"))?;

        let acquired = result.rows_affected == 1;
        if acquired && takeover {
            info!(
                repo_id,
                job_type = %job_type,
                worker_id,
                previous_holder = %current.locked_by,
                "Took over expired lock"
            );
        }
        Ok(acquired)
    }

    pub async fn renew(&self, repo_id: i64, job_type: JobType, worker_id: &str) -> EngineResult<bool> {
        self.renew_at(repo_id, job_type, worker_id, Utc::now()).await
    }

    /// Extends the holder's lock by its lease length from `now`.
    pub async fn renew_at(
        &self,
        repo_id: i64,
        job_type: JobType,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let Some(current) = self.get(repo_id, job_type).await? else {
            return Ok(false);
        };
        if current.locked_by != worker_id {
            return Ok(false);
        }

        let expires_at = now + Duration::seconds(current.lease_seconds.max(1) as i64);
        let result = SyncLock::update_many()
            .set(ActiveModel {
                expires_at: Set(to_db_time(expires_at)),
                ..Default::default()
            })
            .filter(Column::LockId.eq(current.lock_id))
            .filter(Column::LockedBy.eq(worker_id))
            .exec(self.db.as_ref())
            .await
            .map_err(db_err("failed to renew lock"))?;
        Ok(result.rows_affected == 1)
    }

    pub async fn release(&self, repo_id: i64, job_type: JobType, worker_id: &str) -> EngineResult<bool> {
        Self::release_in(self.db.as_ref(), repo_id, job_type, worker_id).await
    }

    /// Deletes the key lock if `worker_id` holds it.
    pub async fn release_in<C>(
        conn: &C,
        repo_id: i64,
        job_type: JobType,
        worker_id: &str,
    ) -> EngineResult<bool>
    where
        C: ConnectionTrait,
    {
        let result = SyncLock::delete_many()
            .filter(Column::RepoId.eq(repo_id))
            .filter(Column::JobType.eq(job_type.as_str()))
            .filter(Column::LockedBy.eq(worker_id))
            .exec(conn)
            .await
            .map_err(db_err("failed to release lock"))?;
        Ok(result.rows_affected > 0)
    }

    pub async fn get(&self, repo_id: i64, job_type: JobType) -> EngineResult<Option<Model>> {
        SyncLock::find()
            .filter(Column::RepoId.eq(repo_id))
            .filter(Column::JobType.eq(job_type.as_str()))
            .one(self.db.as_ref())
            .await
            .map_err(db_err("failed to load lock"))
    }

    pub async fn list(&self) -> EngineResult<Vec<Model>> {
        SyncLock::find()
            .order_by_asc(Column::ExpiresAt)
            .all(self.db.as_ref())
            .await
            .map_err(db_err("failed to list locks"))
    }

    pub async fn list_expired(&self, grace_seconds: u64) -> EngineResult<Vec<Model>> {
        self.list_expired_at(grace_seconds, Utc::now()).await
    }

    /// Locks that expired more than `grace_seconds` before `now`.
    pub async fn list_expired_at(
        &self,
        grace_seconds: u64,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<Model>> {
        let cutoff = now - Duration::seconds(grace_seconds as i64);
        SyncLock::find()
            .filter(Column::ExpiresAt.lt(to_db_time(cutoff)))
            .order_by_asc(Column::ExpiresAt)
            .all(self.db.as_ref())
            .await
            .map_err(db_err("failed to list expired locks"))
    }

    /// Locks whose holder does not own a running job for the same key.
    pub async fn list_orphaned(&self) -> EngineResult<Vec<Model>> {
        let running: HashSet<(i64, String, String)> = SyncJob::find()
            .filter(sync_job::Column::Status.eq(JobStatus::Running.as_str()))
            .filter(sync_job::Column::LockedBy.is_not_null())
            .all(self.db.as_ref())
            .await
            .map_err(db_err("failed to load running jobs for orphan check"))?
            .into_iter()
            .filter_map(|job| {
                job.locked_by
                    .map(|owner| (job.repo_id, job.job_type, owner))
            })
            .collect();

        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|lock| {
                !running.contains(&(lock.repo_id, lock.job_type.clone(), lock.locked_by.clone()))
            })
            .collect())
    }

    /// Deletes a lock by id regardless of holder.
    pub async fn force_release(&self, lock_id: Uuid) -> EngineResult<bool> {
        let result = SyncLock::delete_by_id(lock_id)
            .exec(self.db.as_ref())
            .await
            .map_err(db_err("failed to force release lock"))?;
        if result.rows_affected > 0 {
            warn!(lock_id = %lock_id, "Lock force released");
        }
        Ok(result.rows_affected > 0)
    }

    /// Deletes a lock only if it is still expired past `cutoff`.
    pub async fn delete_if_expired(&self, lock_id: Uuid, cutoff: DateTime<Utc>) -> EngineResult<bool> {
        let result = SyncLock::delete_many()
            .filter(Column::LockId.eq(lock_id))
            .filter(Column::ExpiresAt.lt(to_db_time(cutoff)))
            .exec(self.db.as_ref())
            .await
            .map_err(db_err("failed to delete expired lock"))?;
        Ok(result.rows_affected > 0)
    }

    /// Deletes a lock only if the same holder still has it.
    pub async fn delete_if_held_by(&self, lock_id: Uuid, holder: &str) -> EngineResult<bool> {
        let result = SyncLock::delete_many()
            .filter(Column::LockId.eq(lock_id))
            .filter(Column::LockedBy.eq(holder))
            .exec(self.db.as_ref())
            .await
            .map_err(db_err("failed to delete orphaned lock"))?;
        Ok(result.rows_affected > 0)
    }
}

/// Singleton lease over `sync_leader_leases`.
#[derive(Debug, Clone)]
pub struct NamedLease {
    db: Arc<DatabaseConnection>,
}

impl NamedLease {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn current(&self, name: &str) -> EngineResult<Option<leader_lease::Model>> {
        LeaderLease::find_by_id(name.to_string())
            .one(self.db.as_ref())
            .await
            .map_err(db_err("failed to load named lease"))
    }

    /// Acquires `name` for `holder` if it is free, expired, or already theirs.
    pub async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl_seconds: u64,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let expires_at = to_db_time(now + Duration::seconds(ttl_seconds as i64));

        let insert = leader_lease::ActiveModel {
            name: Set(name.to_string()),
            holder: Set(holder.to_string()),
            acquired_at: Set(to_db_time(now)),
            expires_at: Set(expires_at),
        }
        .insert(self.db.as_ref())
        .await;

        match insert {
            Ok(_) => return Ok(true),
            Err(err) if is_unique_violation(&err) => {}
            Err(err) => return Err(db_err("failed to insert named lease")(err)),
        }

        let result = LeaderLease::update_many()
            .set(leader_lease::ActiveModel {
                holder: Set(holder.to_string()),
                acquired_at: Set(to_db_time(now)),
                expires_at: Set(expires_at),
                ..Default::default()
            })
            .filter(leader_lease::Column::Name.eq(name))
            .filter(
                Condition::any()
                    .add(leader_lease::Column::Holder.eq(holder))
                    .add(leader_lease::Column::ExpiresAt.lt(to_db_time(now))),
            )
            .exec(self.db.as_ref())
            .await
            .map_err(db_err("failed to take over named lease"))?;
        Ok(result.rows_affected == 1)
    }

    /// Extends the lease if `holder` still has it.
    pub async fn renew(
        &self,
        name: &str,
        holder: &str,
        ttl_seconds: u64,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let result = LeaderLease::update_many()
            .set(leader_lease::ActiveModel {
                expires_at: Set(to_db_time(now + Duration::seconds(ttl_seconds as i64))),
                ..Default::default()
            })
            .filter(leader_lease::Column::Name.eq(name))
            .filter(leader_lease::Column::Holder.eq(holder))
            .exec(self.db.as_ref())
            .await
            .map_err(db_err("failed to renew named lease"))?;
        Ok(result.rows_affected == 1)
    }

    pub async fn release(&self, name: &str, holder: &str) -> EngineResult<bool> {
        let result = LeaderLease::delete_many()
            .filter(leader_lease::Column::Name.eq(name))
            .filter(leader_lease::Column::Holder.eq(holder))
            .exec(self.db.as_ref())
            .await
            .map_err(db_err("failed to release named lease"))?;
        Ok(result.rows_affected > 0)
    }
}
