//! SyncRun entity model
//!
//! One row per execution attempt. Terminal fields are written only through
//! [`crate::run_finish::RunFinish`].

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::types::{ErrorCategory, ErrorSummary, RunCounts, Watermark};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_runs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub run_id: Uuid,
    pub job_id: Uuid,
    pub repo_id: i64,
    pub job_type: String,
    pub mode: String,
    pub gitlab_instance: Option<String>,
    pub tenant_id: Option<String>,
    pub is_probe: bool,
    /// `running`, `completed`, `failed` or `no_data`
    pub status: String,
    pub started_at: DateTimeWithTimeZone,
    pub finished_at: Option<DateTimeWithTimeZone>,
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub watermark_start: Option<JsonValue>,
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub watermark_end: Option<JsonValue>,
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub stats: Option<JsonValue>,
    pub error_category: Option<String>,
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub error_summary: Option<JsonValue>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn error_category(&self) -> Option<ErrorCategory> {
        self.error_category
            .as_deref()
            .and_then(|value| value.parse().ok())
    }

    pub fn error_summary(&self) -> Option<ErrorSummary> {
        self.error_summary
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn counts(&self) -> Option<RunCounts> {
        self.stats
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn watermark_end(&self) -> Option<Watermark> {
        self.watermark_end.as_ref().and_then(Watermark::from_json)
    }
}
