//! # Cursor Repository
//!
//! Progress watermarks per repository and job type. Automatic paths only move
//! a cursor forward; operators may set it anywhere.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::to_db_time;
use crate::error::{EngineResult, db_err};
use crate::models::sync_cursor::{self, ActiveModel, Column, Entity as SyncCursor, Model};
use crate::types::{JobType, Watermark};

#[derive(Debug, Clone)]
pub struct CursorRepository {
    db: Arc<DatabaseConnection>,
}

impl CursorRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn get(&self, repo_id: i64, job_type: JobType) -> EngineResult<Option<Model>> {
        SyncCursor::find_by_id((repo_id, job_type.as_str().to_string()))
            .one(self.db.as_ref())
            .await
            .map_err(db_err("failed to load cursor"))
    }

    /// Lists cursors, optionally restricted to one repository.
    pub async fn list(&self, repo_id: Option<i64>) -> EngineResult<Vec<Model>> {
        let mut query = SyncCursor::find()
            .order_by_asc(Column::RepoId)
            .order_by_asc(Column::JobType);
        if let Some(repo_id) = repo_id {
            query = query.filter(Column::RepoId.eq(repo_id));
        }
        query
            .all(self.db.as_ref())
            .await
            .map_err(db_err("failed to list cursors"))
    }

    /// Moves the cursor to `watermark` only when it is a strict advance of the
    /// stored value. Returns whether the cursor changed.
    ///
    /// Meant to run inside the transaction that completes the owning job.
    pub async fn advance_in<C>(
        conn: &C,
        repo_id: i64,
        job_type: JobType,
        watermark: &Watermark,
        run_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> EngineResult<bool>
    where
        C: ConnectionTrait,
    {
        let existing = SyncCursor::find_by_id((repo_id, job_type.as_str().to_string()))
            .one(conn)
            .await
            .map_err(db_err("failed to load cursor for advance"))?;

        match existing {
            None => {
                ActiveModel {
                    repo_id: Set(repo_id),
                    job_type: Set(job_type.as_str().to_string()),
                    watermark: Set(watermark.to_json()),
                    run_id: Set(run_id),
                    updated_at: Set(to_db_time(now)),
                }
                .insert(conn)
                .await
                .map_err(db_err("failed to insert cursor"))?;
                Ok(true)
            }
            Some(current) => {
                match current.watermark() {
                    Some(stored) if !stored.is_advanced_by(watermark) => {
                        debug!(
                            repo_id,
                            job_type = %job_type,
                            stored = %stored,
                            proposed = %watermark,
                            "Cursor not advanced; proposed watermark is not newer"
                        );
                        return Ok(false);
                    }
                    Some(_) => {}
                    None => warn!(
                        repo_id,
                        job_type = %job_type,
                        "Stored cursor is unreadable; replacing it"
                    ),
                }

                let mut active: ActiveModel = current.into();
                active.watermark = Set(watermark.to_json());
                active.run_id = Set(run_id);
                active.updated_at = Set(to_db_time(now));
                active
                    .update(conn)
                    .await
                    .map_err(db_err("failed to advance cursor"))?;
                Ok(true)
            }
        }
    }

    /// Operator override: writes `watermark` regardless of direction.
    pub async fn set(
        &self,
        repo_id: i64,
        job_type: JobType,
        watermark: &Watermark,
    ) -> EngineResult<Model> {
        let now = to_db_time(Utc::now());
        let existing = self.get(repo_id, job_type).await?;

        let result = match existing {
            Some(current) => {
                let mut active: sync_cursor::ActiveModel = current.into();
                active.watermark = Set(watermark.to_json());
                active.run_id = Set(None);
                active.updated_at = Set(now);
                active.update(self.db.as_ref()).await
            }
            None => {
                ActiveModel {
                    repo_id: Set(repo_id),
                    job_type: Set(job_type.as_str().to_string()),
                    watermark: Set(watermark.to_json()),
                    run_id: Set(None),
                    updated_at: Set(now),
                }
                .insert(self.db.as_ref())
                .await
            }
        };

        result.map_err(db_err("failed to set cursor"))
    }

    pub async fn delete(&self, repo_id: i64, job_type: JobType) -> EngineResult<bool> {
        let result = SyncCursor::delete_by_id((repo_id, job_type.as_str().to_string()))
            .exec(self.db.as_ref())
            .await
            .map_err(db_err("failed to delete cursor"))?;
        Ok(result.rows_affected > 0)
    }
}
