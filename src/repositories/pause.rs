//! # Pause Repository
//!
//! Operator pauses per repository and job type.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set};
use uuid::Uuid;

use crate::db::to_db_time;
use crate::error::{EngineResult, db_err};
use crate::models::sync_pause::{ActiveModel, Column, Entity as SyncPause, Model};
use crate::types::JobType;

#[derive(Debug, Clone)]
pub struct PauseRepository {
    db: Arc<DatabaseConnection>,
}

impl PauseRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn list(&self) -> EngineResult<Vec<Model>> {
        SyncPause::find()
            .order_by_asc(Column::RepoId)
            .order_by_asc(Column::JobType)
            .all(self.db.as_ref())
            .await
            .map_err(db_err("failed to list pauses"))
    }

    /// Pauses in effect at `now`: indefinite ones and those not yet expired.
    pub async fn list_active(&self, now: DateTime<Utc>) -> EngineResult<Vec<Model>> {
        SyncPause::find()
            .filter(
                Condition::any()
                    .add(Column::PausedUntil.is_null())
                    .add(Column::PausedUntil.gt(to_db_time(now))),
            )
            .all(self.db.as_ref())
            .await
            .map_err(db_err("failed to list active pauses"))
    }

    pub async fn list_expired(&self, now: DateTime<Utc>) -> EngineResult<Vec<Model>> {
        SyncPause::find()
            .filter(Column::PausedUntil.lte(to_db_time(now)))
            .all(self.db.as_ref())
            .await
            .map_err(db_err("failed to list expired pauses"))
    }

    /// Creates or replaces the pause for a key.
    pub async fn set(
        &self,
        repo_id: i64,
        job_type: JobType,
        reason: &str,
        paused_until: Option<DateTime<Utc>>,
        created_by: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let model = ActiveModel {
            pause_id: Set(Uuid::new_v4()),
            repo_id: Set(repo_id),
            job_type: Set(job_type.as_str().to_string()),
            reason: Set(reason.to_string()),
            paused_until: Set(paused_until.map(to_db_time)),
            created_by: Set(created_by.to_string()),
            created_at: Set(to_db_time(now)),
        };

        SyncPause::insert(model)
            .on_conflict(
                OnConflict::columns([Column::RepoId, Column::JobType])
                    .update_columns([
                        Column::Reason,
                        Column::PausedUntil,
                        Column::CreatedBy,
                        Column::CreatedAt,
                    ])
                    .to_owned(),
            )
            .exec(self.db.as_ref())
            .await
            .map_err(db_err("failed to set pause"))?;
        Ok(())
    }

    pub async fn unset(&self, repo_id: i64, job_type: JobType) -> EngineResult<bool> {
        let result = SyncPause::delete_many()
            .filter(Column::RepoId.eq(repo_id))
            .filter(Column::JobType.eq(job_type.as_str()))
            .exec(self.db.as_ref())
            .await
            .map_err(db_err("failed to unset pause"))?;
        Ok(result.rows_affected > 0)
    }

    pub async fn delete_expired(&self, now: DateTime<Utc>) -> EngineResult<u64> {
        let result = SyncPause::delete_many()
            .filter(Column::PausedUntil.lte(to_db_time(now)))
            .exec(self.db.as_ref())
            .await
            .map_err(db_err("failed to delete expired pauses"))?;
        Ok(result.rows_affected)
    }
}
