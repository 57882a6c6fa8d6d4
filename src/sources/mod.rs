//! Sources: the pluggable fetchers that mirror upstream history.
//!
//! This module provides:
//! - The [`SyncSource`] trait every fetcher implements
//! - [`SourceError`] / [`SourceTransportError`] classification
//! - A [`SourceRegistry`] keyed by [`JobType`]
//! - The bundled [`ExampleSource`]

pub mod error;
pub mod example;
pub mod registry;

use async_trait::async_trait;
use uuid::Uuid;

use crate::types::{DiffMode, JobMode, JobPayload, JobType, RunCounts, SourceKind, Watermark};

pub use error::{SourceError, SourceTransportError};
pub use example::ExampleSource;
pub use registry::SourceRegistry;

/// Everything a source needs to fetch one batch for a repository.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub job_id: Uuid,
    pub run_id: Uuid,
    pub repo_id: i64,
    pub repo_key: String,
    pub source_kind: SourceKind,
    pub job_type: JobType,
    pub mode: JobMode,
    /// Stored cursor at the time the run started.
    pub cursor: Option<Watermark>,
    pub payload: JobPayload,
    pub batch_size: u32,
    pub diff_mode: DiffMode,
}

impl FetchRequest {
    /// Position the fetch starts after. Backfills replay their payload window
    /// regardless of the cursor; incremental runs resume from the cursor and
    /// fall back to the window start.
    pub fn start_position(&self) -> Option<Watermark> {
        if self.mode == JobMode::Incremental {
            if let Some(cursor) = &self.cursor {
                return Some(cursor.clone());
            }
        }
        self.window_start()
    }

    fn window_start(&self) -> Option<Watermark> {
        if self.source_kind.uses_revisions() {
            self.payload.start_rev.map(Watermark::Revision)
        } else {
            self.payload.since.map(Watermark::Timestamp)
        }
    }
}

/// Result of a successful fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOutcome {
    pub stats: RunCounts,
    /// Last position fully persisted by this fetch.
    pub watermark_end: Option<Watermark>,
    /// More history is available beyond `watermark_end`.
    pub has_more: bool,
}

/// A fetcher for one or more job types.
#[async_trait]
pub trait SyncSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Fetch and persist one batch. Must be safe to drop mid-flight: the
    /// worker abandons the future when its lease is lost or the run times out.
    async fn fetch(&self, request: FetchRequest) -> Result<FetchOutcome, SourceError>;
}
