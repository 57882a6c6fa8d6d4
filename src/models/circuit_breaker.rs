//! CircuitBreaker entity model

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_circuit_breakers")]
pub struct Model {
    /// `instance:<host>` or `global`
    #[sea_orm(primary_key, auto_increment = false)]
    pub breaker_key: String,
    pub state: String,
    pub opened_at: Option<DateTimeWithTimeZone>,
    pub half_opened_at: Option<DateTimeWithTimeZone>,
    pub last_failure_reason: Option<String>,
    pub failure_rate: f64,
    pub rate_limit_rate: f64,
    pub timeout_rate: f64,
    pub consecutive_successes: i32,
    pub probes_issued: i32,
    pub probe_window_started_at: Option<DateTimeWithTimeZone>,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
