//! Example source
//!
//! A deterministic synthetic upstream for local runs and tests. Time-based
//! repositories see one event per job-type interval since `origin`; SVN
//! repositories see revisions `1..=head_revision`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use crate::sources::{FetchOutcome, FetchRequest, SourceError, SyncSource};
use crate::types::{DiffMode, JobType, RunCounts, Watermark};

#[derive(Debug, Clone)]
pub struct ExampleSource {
    origin: DateTime<Utc>,
    /// Fixed end of history; `None` follows the wall clock.
    horizon: Option<DateTime<Utc>>,
    head_revision: i64,
    latency: Duration,
}

impl Default for ExampleSource {
    fn default() -> Self {
        Self {
            origin: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default(),
            horizon: None,
            head_revision: 500,
            latency: Duration::ZERO,
        }
    }
}

impl ExampleSource {
    pub fn new(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            ..Self::default()
        }
    }

    pub fn with_horizon(mut self, horizon: DateTime<Utc>) -> Self {
        self.horizon = Some(horizon);
        self
    }

    pub fn with_head_revision(mut self, head: i64) -> Self {
        self.head_revision = head;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn interval(job_type: JobType) -> chrono::Duration {
        match job_type {
            JobType::Commits => chrono::Duration::hours(1),
            JobType::ReviewEvents => chrono::Duration::hours(3),
            JobType::MergeRequests => chrono::Duration::hours(6),
        }
    }

    fn fetch_revisions(&self, after: i64, request: &FetchRequest) -> FetchOutcome {
        let end = request
            .payload
            .end_rev
            .map_or(self.head_revision, |end| end.min(self.head_revision));
        let first = after.max(0) + 1;
        let last = (after.max(0) + i64::from(request.batch_size)).min(end);
        if last < first {
            return FetchOutcome::default();
        }
        let fetched = (last - first + 1) as u64;
        FetchOutcome {
            stats: counts(fetched, request.diff_mode),
            watermark_end: Some(Watermark::Revision(last)),
            has_more: last < end,
        }
    }

    fn fetch_events(&self, after: Option<DateTime<Utc>>, request: &FetchRequest) -> FetchOutcome {
        let interval = Self::interval(request.job_type);
        let horizon = self.horizon.unwrap_or_else(Utc::now);
        let end = request.payload.until.map_or(horizon, |until| until.min(horizon));

        // Events sit at origin + k * interval for k >= 1.
        let step = interval.num_seconds().max(1);
        let next_index = match after {
            Some(after) if after >= self.origin => (after - self.origin).num_seconds() / step + 1,
            _ => 1,
        };
        let mut fetched = 0u64;
        let mut last_event = None;
        let mut index = next_index;
        while fetched < u64::from(request.batch_size) {
            let event = self.origin + chrono::Duration::seconds(index * step);
            if event > end {
                break;
            }
            last_event = Some(event);
            fetched += 1;
            index += 1;
        }
        let next_event = self.origin + chrono::Duration::seconds(index * step);
        FetchOutcome {
            stats: counts(fetched, request.diff_mode),
            watermark_end: last_event.map(Watermark::Timestamp),
            has_more: fetched > 0 && next_event <= end,
        }
    }
}

fn counts(fetched: u64, diff_mode: DiffMode) -> RunCounts {
    RunCounts {
        fetched,
        inserted: fetched,
        updated: 0,
        // Diffs are not fetched when the breaker has degraded the run.
        skipped: if diff_mode == DiffMode::Off { fetched } else { 0 },
    }
}

#[async_trait]
impl SyncSource for ExampleSource {
    fn name(&self) -> &'static str {
        "example"
    }

    async fn fetch(&self, request: FetchRequest) -> Result<FetchOutcome, SourceError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let start = request.start_position();
        let outcome = match (request.source_kind.uses_revisions(), start) {
            (true, None) => self.fetch_revisions(0, &request),
            (true, Some(Watermark::Revision(rev))) => self.fetch_revisions(rev, &request),
            (false, None) => self.fetch_events(None, &request),
            (false, Some(Watermark::Timestamp(ts))) => self.fetch_events(Some(ts), &request),
            (_, Some(other)) => {
                return Err(SourceError::configuration(format!(
                    "cursor {other} does not match source kind {}",
                    request.source_kind
                )));
            }
        };
        debug!(
            repo_key = %request.repo_key,
            job_type = %request.job_type,
            fetched = outcome.stats.fetched,
            has_more = outcome.has_more,
            "Example source fetched batch"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobMode, JobPayload, SourceKind};
    use uuid::Uuid;

    fn request(kind: SourceKind, cursor: Option<Watermark>, batch_size: u32) -> FetchRequest {
        FetchRequest {
            job_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            repo_id: 1,
            repo_key: "group/project".to_string(),
            source_kind: kind,
            job_type: JobType::Commits,
            mode: JobMode::Incremental,
            cursor,
            payload: JobPayload::default(),
            batch_size,
            diff_mode: DiffMode::Full,
        }
    }

    fn source() -> ExampleSource {
        let origin = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        ExampleSource::new(origin).with_horizon(origin + chrono::Duration::hours(10))
    }

    #[tokio::test]
    async fn timestamp_history_pages_until_horizon() {
        let source = source();
        let first = source
            .fetch(request(SourceKind::GitLab, None, 4))
            .await
            .unwrap();
        assert_eq!(first.stats.fetched, 4);
        assert!(first.has_more);

        let second = source
            .fetch(request(SourceKind::GitLab, first.watermark_end.clone(), 4))
            .await
            .unwrap();
        assert!(first.watermark_end.unwrap().is_advanced_by(second.watermark_end.as_ref().unwrap()));

        let third = source
            .fetch(request(SourceKind::GitLab, second.watermark_end.clone(), 4))
            .await
            .unwrap();
        assert_eq!(third.stats.fetched, 2);
        assert!(!third.has_more);
        assert_eq!(
            third.watermark_end,
            Some(Watermark::Timestamp(
                Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap()
            ))
        );

        let drained = source
            .fetch(request(SourceKind::GitLab, third.watermark_end, 4))
            .await
            .unwrap();
        assert_eq!(drained, FetchOutcome::default());
    }

    #[tokio::test]
    async fn revisions_stop_at_head() {
        let source = source().with_head_revision(12);
        let outcome = source
            .fetch(request(SourceKind::Svn, Some(Watermark::Revision(10)), 5))
            .await
            .unwrap();
        assert_eq!(outcome.stats.fetched, 2);
        assert_eq!(outcome.watermark_end, Some(Watermark::Revision(12)));
        assert!(!outcome.has_more);
    }

    #[tokio::test]
    async fn mismatched_cursor_is_a_configuration_error() {
        let err = source()
            .fetch(request(SourceKind::Svn, Some(Watermark::Timestamp(Utc::now())), 5))
            .await
            .unwrap_err();
        assert_eq!(err.category(), crate::types::ErrorCategory::Configuration);
    }
}
