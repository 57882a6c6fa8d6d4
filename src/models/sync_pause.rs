//! SyncPause entity model
//!
//! Operator pause for a repository and job type. A pause without
//! `paused_until` holds until it is removed.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_pauses")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub pause_id: Uuid,
    pub repo_id: i64,
    pub job_type: String,
    pub reason: String,
    pub paused_until: Option<DateTimeWithTimeZone>,
    pub created_by: String,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
