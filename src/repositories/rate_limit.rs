//! # Rate Limit Bucket Repository
//!
//! Per-instance pauses set when an upstream answers 429.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use tracing::info;

use crate::db::to_db_time;
use crate::error::{EngineResult, db_err};
use crate::models::rate_limit_bucket::{ActiveModel, Column, Entity as RateLimitBucket, Model};

/// Bucket key for an upstream instance host.
pub fn bucket_key(instance: &str) -> String {
    instance.trim().to_ascii_lowercase()
}

#[derive(Debug, Clone)]
pub struct RateLimitRepository {
    db: Arc<DatabaseConnection>,
}

impl RateLimitRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn get(&self, bucket_key: &str) -> EngineResult<Option<Model>> {
        RateLimitBucket::find_by_id(bucket_key.to_string())
            .one(self.db.as_ref())
            .await
            .map_err(db_err("failed to load rate limit bucket"))
    }

    pub async fn list(&self) -> EngineResult<Vec<Model>> {
        RateLimitBucket::find()
            .order_by_asc(Column::BucketKey)
            .all(self.db.as_ref())
            .await
            .map_err(db_err("failed to list rate limit buckets"))
    }

    /// Buckets whose pause is still in effect at `now`.
    pub async fn list_paused(&self, now: DateTime<Utc>) -> EngineResult<Vec<Model>> {
        RateLimitBucket::find()
            .filter(Column::PausedUntil.gt(to_db_time(now)))
            .order_by_asc(Column::BucketKey)
            .all(self.db.as_ref())
            .await
            .map_err(db_err("failed to list paused rate limit buckets"))
    }

    /// Pauses a bucket until `until`. With `extend_only` an existing later
    /// pause is kept, which is what concurrent 429s from several workers want.
    pub async fn pause(
        &self,
        bucket_key: &str,
        until: DateTime<Utc>,
        reason: &str,
        extend_only: bool,
        now: DateTime<Utc>,
    ) -> EngineResult<Model> {
        let existing = self.get(bucket_key).await?;

        let saved = match existing {
            Some(current) => {
                let keeps_later = current
                    .paused_until
                    .is_some_and(|paused| paused.with_timezone(&Utc) >= until);
                if extend_only && keeps_later {
                    return Ok(current);
                }
                let mut active: ActiveModel = current.into();
                active.paused_until = Set(Some(to_db_time(until)));
                active.reason = Set(Some(reason.to_string()));
                active.updated_at = Set(to_db_time(now));
                active.update(self.db.as_ref()).await
            }
            None => {
                ActiveModel {
                    bucket_key: Set(bucket_key.to_string()),
                    paused_until: Set(Some(to_db_time(until))),
                    reason: Set(Some(reason.to_string())),
                    updated_at: Set(to_db_time(now)),
                }
                .insert(self.db.as_ref())
                .await
            }
        }
        .map_err(db_err("failed to pause rate limit bucket"))?;

        info!(bucket_key, paused_until = %until, reason, "Rate limit bucket paused");
        Ok(saved)
    }

    /// Clears a pause. Returns false when the bucket does not exist.
    pub async fn unpause(&self, bucket_key: &str, now: DateTime<Utc>) -> EngineResult<bool> {
        let result = RateLimitBucket::update_many()
            .set(ActiveModel {
                paused_until: Set(None),
                reason: Set(None),
                updated_at: Set(to_db_time(now)),
                ..Default::default()
            })
            .filter(Column::BucketKey.eq(bucket_key))
            .exec(self.db.as_ref())
            .await
            .map_err(db_err("failed to unpause rate limit bucket"))?;
        Ok(result.rows_affected > 0)
    }
}
