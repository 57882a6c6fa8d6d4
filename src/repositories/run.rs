//! # Run Repository
//!
//! Execution history. Rows are opened by [`RunRepository::start`] and closed
//! exactly once through a [`RunFinish`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use uuid::Uuid;

use crate::db::to_db_time;
use crate::error::{EngineResult, db_err};
use crate::models::sync_job;
use crate::models::sync_run::{ActiveModel, Column, Entity as SyncRun, Model};
use crate::policy::OutcomeSample;
use crate::run_finish::RunFinish;
use crate::types::{ErrorCategory, JobType, RunStatus, Watermark};

/// Recent failure profile of one repository and job type.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RepoFailureRates {
    pub runs: usize,
    pub failure_rate: f64,
    pub rate_limit_rate: f64,
}

#[derive(Debug, Clone)]
pub struct RunRepository {
    db: Arc<DatabaseConnection>,
}

impl RunRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Opens a run for a claimed job.
    pub async fn start(
        &self,
        job: &sync_job::Model,
        is_probe: bool,
        watermark_start: Option<&Watermark>,
        now: DateTime<Utc>,
    ) -> EngineResult<Model> {
        ActiveModel {
            run_id: Set(Uuid::new_v4()),
            job_id: Set(job.job_id),
            repo_id: Set(job.repo_id),
            job_type: Set(job.job_type.clone()),
            mode: Set(job.mode.clone()),
            gitlab_instance: Set(job.gitlab_instance.clone()),
            tenant_id: Set(job.tenant_id.clone()),
            is_probe: Set(is_probe),
            status: Set(RunStatus::Running.as_str().to_string()),
            started_at: Set(to_db_time(now)),
            finished_at: Set(None),
            watermark_start: Set(watermark_start.map(Watermark::to_json)),
            watermark_end: Set(None),
            stats: Set(None),
            error_category: Set(None),
            error_summary: Set(None),
        }
        .insert(self.db.as_ref())
        .await
        .map_err(db_err("failed to start run"))
    }

    /// Writes the terminal state of a still-running run. Returns false when
    /// the run was already finalized.
    pub async fn finalize_in<C>(
        conn: &C,
        run_id: Uuid,
        finish: &RunFinish,
        now: DateTime<Utc>,
    ) -> EngineResult<bool>
    where
        C: ConnectionTrait,
    {
        let counts = finish.counts().map(serde_json::to_value).transpose()?;
        let summary = finish
            .error_summary()
            .map(serde_json::to_value)
            .transpose()?;

        let result = SyncRun::update_many()
            .set(ActiveModel {
                status: Set(finish.status().as_str().to_string()),
                finished_at: Set(Some(to_db_time(now))),
                watermark_end: Set(finish.cursor_after().map(Watermark::to_json)),
                stats: Set(counts),
                error_category: Set(finish.error_category().map(|c| c.as_str().to_string())),
                error_summary: Set(summary),
                ..Default::default()
            })
            .filter(Column::RunId.eq(run_id))
            .filter(Column::Status.eq(RunStatus::Running.as_str()))
            .exec(conn)
            .await
            .map_err(db_err("failed to finalize run"))?;

        Ok(result.rows_affected == 1)
    }

    pub async fn finalize(&self, run_id: Uuid, finish: &RunFinish) -> EngineResult<bool> {
        self.finalize_at(run_id, finish, Utc::now()).await
    }

    pub async fn finalize_at(
        &self,
        run_id: Uuid,
        finish: &RunFinish,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        Self::finalize_in(self.db.as_ref(), run_id, finish, now).await
    }

    pub async fn find(&self, run_id: Uuid) -> EngineResult<Option<Model>> {
        SyncRun::find_by_id(run_id)
            .one(self.db.as_ref())
            .await
            .map_err(db_err("failed to load run"))
    }

    pub async fn list_for_job(&self, job_id: Uuid) -> EngineResult<Vec<Model>> {
        SyncRun::find()
            .filter(Column::JobId.eq(job_id))
            .order_by_asc(Column::StartedAt)
            .all(self.db.as_ref())
            .await
            .map_err(db_err("failed to list runs for job"))
    }

    /// Finished runs since `since`, newest first, as breaker samples.
    ///
    /// `instance` restricts the window to one upstream; `None` covers all.
    pub async fn recent_outcomes(
        &self,
        instance: Option<&str>,
        since: DateTime<Utc>,
        limit: usize,
    ) -> EngineResult<Vec<OutcomeSample>> {
        let mut query = SyncRun::find()
            .filter(Column::FinishedAt.is_not_null())
            .filter(Column::FinishedAt.gte(to_db_time(since)))
            .order_by_desc(Column::FinishedAt)
            .limit(limit as u64);
        if let Some(instance) = instance {
            query = query.filter(Column::GitlabInstance.eq(instance));
        }

        let runs = query
            .all(self.db.as_ref())
            .await
            .map_err(db_err("failed to load recent runs"))?;

        Ok(runs.iter().filter_map(outcome_sample).collect())
    }

    /// Failure and rate-limit rates per repository and job type over runs
    /// finished since `since`. Non-counting outcomes are ignored.
    pub async fn repo_failure_rates(
        &self,
        since: DateTime<Utc>,
    ) -> EngineResult<HashMap<(i64, JobType), RepoFailureRates>> {
        let runs = SyncRun::find()
            .filter(Column::FinishedAt.is_not_null())
            .filter(Column::FinishedAt.gte(to_db_time(since)))
            .all(self.db.as_ref())
            .await
            .map_err(db_err("failed to load runs for failure rates"))?;

        let mut tallies: HashMap<(i64, JobType), (usize, usize, usize)> = HashMap::new();
        for run in &runs {
            let Ok(job_type) = run.job_type.parse::<JobType>() else {
                continue;
            };
            let Some(sample) = outcome_sample(run) else {
                continue;
            };
            if sample
                .category
                .is_some_and(|category| !category.counts_toward_breaker())
            {
                continue;
            }
            let entry = tallies.entry((run.repo_id, job_type)).or_default();
            entry.0 += 1;
            if !sample.success {
                entry.1 += 1;
            }
            if sample.category == Some(ErrorCategory::RateLimited) {
                entry.2 += 1;
            }
        }

        Ok(tallies
            .into_iter()
            .map(|(key, (runs, failures, limited))| {
                (
                    key,
                    RepoFailureRates {
                        runs,
                        failure_rate: failures as f64 / runs as f64,
                        rate_limit_rate: limited as f64 / runs as f64,
                    },
                )
            })
            .collect())
    }

    /// Repository/job type keys with a run that finished since `since`.
    pub async fn keys_finished_since(
        &self,
        since: DateTime<Utc>,
    ) -> EngineResult<HashSet<(i64, JobType)>> {
        let runs = SyncRun::find()
            .filter(Column::FinishedAt.is_not_null())
            .filter(Column::FinishedAt.gte(to_db_time(since)))
            .all(self.db.as_ref())
            .await
            .map_err(db_err("failed to load recently finished runs"))?;

        Ok(runs
            .iter()
            .filter_map(|run| {
                run.job_type
                    .parse::<JobType>()
                    .ok()
                    .map(|job_type| (run.repo_id, job_type))
            })
            .collect())
    }

    /// Runs still marked running, for reconciliation.
    pub async fn list_open(&self) -> EngineResult<Vec<Model>> {
        SyncRun::find()
            .filter(Column::Status.eq(RunStatus::Running.as_str()))
            .order_by_asc(Column::StartedAt)
            .all(self.db.as_ref())
            .await
            .map_err(db_err("failed to list open runs"))
    }

    pub async fn count_finished_before(&self, cutoff: DateTime<Utc>) -> EngineResult<u64> {
        SyncRun::find()
            .filter(Column::FinishedAt.is_not_null())
            .filter(Column::FinishedAt.lt(to_db_time(cutoff)))
            .count(self.db.as_ref())
            .await
            .map_err(db_err("failed to count prunable runs"))
    }

    /// Deletes finished runs older than `cutoff`. Open runs are kept.
    pub async fn prune_finished_before(&self, cutoff: DateTime<Utc>) -> EngineResult<u64> {
        let result = SyncRun::delete_many()
            .filter(Column::FinishedAt.is_not_null())
            .filter(Column::FinishedAt.lt(to_db_time(cutoff)))
            .exec(self.db.as_ref())
            .await
            .map_err(db_err("failed to prune runs"))?;
        Ok(result.rows_affected)
    }
}

fn outcome_sample(run: &Model) -> Option<OutcomeSample> {
    let finished_at = run.finished_at?.with_timezone(&Utc);
    let status = run.status.parse::<RunStatus>().ok()?;
    Some(OutcomeSample {
        finished_at,
        success: matches!(status, RunStatus::Completed | RunStatus::NoData),
        category: run.error_category(),
    })
}
