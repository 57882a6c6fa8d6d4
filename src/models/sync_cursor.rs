//! SyncCursor entity model

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::types::Watermark;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_cursors")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub repo_id: i64,
    #[sea_orm(primary_key, auto_increment = false)]
    pub job_type: String,
    /// Serialized [`Watermark`]
    #[sea_orm(column_type = "JsonBinary")]
    pub watermark: JsonValue,
    /// Run that last advanced the cursor; empty after an operator edit
    pub run_id: Option<Uuid>,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn watermark(&self) -> Option<Watermark> {
        Watermark::from_json(&self.watermark)
    }
}
