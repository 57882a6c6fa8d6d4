//! # Circuit Breaker Repository
//!
//! Persists [`BreakerSnapshot`]s. State changes are computed by
//! [`crate::policy`]; this module only loads and stores them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::OnConflict;
use sea_orm::{ConnectionTrait, DatabaseConnection, EntityTrait, QueryOrder, Set};

use crate::db::to_db_time;
use crate::error::{EngineResult, db_err};
use crate::models::circuit_breaker::{ActiveModel, Column, Entity as CircuitBreaker, Model};
use crate::policy::{BreakerSnapshot, Rates};
use crate::types::BreakerState;

#[derive(Debug, Clone)]
pub struct CircuitBreakerRepository {
    db: Arc<DatabaseConnection>,
}

impl CircuitBreakerRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn get(&self, key: &str) -> EngineResult<Option<BreakerSnapshot>> {
        let model = CircuitBreaker::find_by_id(key.to_string())
            .one(self.db.as_ref())
            .await
            .map_err(db_err("failed to load circuit breaker"))?;
        model.map(snapshot_from_model).transpose()
    }

    /// Stored state, or a fresh closed breaker when none was recorded yet.
    pub async fn get_or_closed(&self, key: &str) -> EngineResult<BreakerSnapshot> {
        Ok(self
            .get(key)
            .await?
            .unwrap_or_else(|| BreakerSnapshot::closed(key)))
    }

    pub async fn list(&self) -> EngineResult<Vec<BreakerSnapshot>> {
        CircuitBreaker::find()
            .order_by_asc(Column::BreakerKey)
            .all(self.db.as_ref())
            .await
            .map_err(db_err("failed to list circuit breakers"))?
            .into_iter()
            .map(snapshot_from_model)
            .collect()
    }

    pub async fn save(&self, snapshot: &BreakerSnapshot, now: DateTime<Utc>) -> EngineResult<()> {
        Self::save_in(self.db.as_ref(), snapshot, now).await
    }

    pub async fn save_in<C>(
        conn: &C,
        snapshot: &BreakerSnapshot,
        now: DateTime<Utc>,
    ) -> EngineResult<()>
    where
        C: ConnectionTrait,
    {
        let model = ActiveModel {
            breaker_key: Set(snapshot.key.clone()),
            state: Set(snapshot.state.as_str().to_string()),
            opened_at: Set(snapshot.opened_at.map(to_db_time)),
            half_opened_at: Set(snapshot.half_opened_at.map(to_db_time)),
            last_failure_reason: Set(snapshot.last_failure_reason.clone()),
            failure_rate: Set(snapshot.rates.failure_rate),
            rate_limit_rate: Set(snapshot.rates.rate_limit_rate),
            timeout_rate: Set(snapshot.rates.timeout_rate),
            consecutive_successes: Set(snapshot.consecutive_successes as i32),
            probes_issued: Set(snapshot.probes_issued as i32),
            probe_window_started_at: Set(snapshot.probe_window_started_at.map(to_db_time)),
            updated_at: Set(to_db_time(now)),
        };

        CircuitBreaker::insert(model)
            .on_conflict(
                OnConflict::column(Column::BreakerKey)
                    .update_columns([
                        Column::State,
                        Column::OpenedAt,
                        Column::HalfOpenedAt,
                        Column::LastFailureReason,
                        Column::FailureRate,
                        Column::RateLimitRate,
                        Column::TimeoutRate,
                        Column::ConsecutiveSuccesses,
                        Column::ProbesIssued,
                        Column::ProbeWindowStartedAt,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(conn)
            .await
            .map_err(db_err("failed to save circuit breaker"))?;

        Ok(())
    }

    /// Forces a breaker back to closed. Returns false when no record existed.
    pub async fn reset(&self, key: &str, now: DateTime<Utc>) -> EngineResult<bool> {
        if self.get(key).await?.is_none() {
            return Ok(false);
        }
        self.save(&BreakerSnapshot::closed(key), now).await?;
        Ok(true)
    }
}

fn snapshot_from_model(model: Model) -> EngineResult<BreakerSnapshot> {
    Ok(BreakerSnapshot {
        state: model.state.parse::<BreakerState>()?,
        key: model.breaker_key,
        opened_at: model.opened_at.map(|ts| ts.with_timezone(&Utc)),
        half_opened_at: model.half_opened_at.map(|ts| ts.with_timezone(&Utc)),
        last_failure_reason: model.last_failure_reason,
        rates: Rates {
            failure_rate: model.failure_rate,
            rate_limit_rate: model.rate_limit_rate,
            timeout_rate: model.timeout_rate,
        },
        consecutive_successes: model.consecutive_successes.max(0) as u32,
        probes_issued: model.probes_issued.max(0) as u32,
        probe_window_started_at: model.probe_window_started_at.map(|ts| ts.with_timezone(&Utc)),
    })
}
