//! RateLimitBucket entity model

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_rate_limit_buckets")]
pub struct Model {
    /// Instance host the bucket throttles
    #[sea_orm(primary_key, auto_increment = false)]
    pub bucket_key: String,
    pub paused_until: Option<DateTimeWithTimeZone>,
    pub reason: Option<String>,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
