//! SyncJob entity model
//!
//! A queued unit of work for one repository and job type. Claiming, lease
//! renewal and resolution all go through [`crate::queue::JobQueue`].

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::types::{ErrorSummary, JobMode, JobPayload, JobStatus, JobType, ParseEnumError};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub job_id: Uuid,

    pub repo_id: i64,

    /// `commits`, `merge_requests` or `review_events`
    pub job_type: String,

    /// `incremental` or `backfill`
    pub mode: String,

    /// `pending`, `running`, `completed`, `failed` or `dead`
    pub status: String,

    /// Executions started; incremented by claim, undone by a penalty-free requeue
    pub attempts: i32,

    /// Failures that are retried before the job is dead-lettered
    pub max_attempts: i32,

    /// Penalty-free requeues caused by lock contention
    pub contention_count: i32,

    /// Higher values are claimed first
    pub priority: i32,

    /// Earliest time the job may be claimed
    pub not_before: DateTimeWithTimeZone,

    /// Worker currently holding the job
    pub locked_by: Option<String>,

    pub locked_at: Option<DateTimeWithTimeZone>,

    pub lease_seconds: i32,

    /// `locked_at + lease_seconds`, pushed forward on every renewal
    pub lease_expires_at: Option<DateTimeWithTimeZone>,

    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    pub gitlab_instance: Option<String>,

    pub tenant_id: Option<String>,

    /// Last recorded [`ErrorSummary`]
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub last_error: Option<JsonValue>,

    pub dead_reason: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn job_type(&self) -> Result<JobType, ParseEnumError> {
        self.job_type.parse()
    }

    pub fn mode(&self) -> Result<JobMode, ParseEnumError> {
        self.mode.parse()
    }

    pub fn status(&self) -> Result<JobStatus, ParseEnumError> {
        self.status.parse()
    }

    pub fn payload(&self) -> JobPayload {
        JobPayload::from_json(&self.payload)
    }

    pub fn last_error(&self) -> Option<ErrorSummary> {
        self.last_error
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Whether another failure of this execution should dead-letter the job.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts > self.max_attempts
    }
}
