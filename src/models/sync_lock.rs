//! SyncLock entity model
//!
//! Lease-based mutual exclusion per repository and job type.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_locks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub lock_id: Uuid,
    pub repo_id: i64,
    pub job_type: String,
    /// Job the holder is executing, when acquired by a worker
    pub job_id: Option<Uuid>,
    pub locked_by: String,
    pub locked_at: DateTimeWithTimeZone,
    pub lease_seconds: i32,
    pub expires_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
