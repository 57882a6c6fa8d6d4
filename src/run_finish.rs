//! Terminal outcomes for a [`sync_run`](crate::models::sync_run) row.
//!
//! A run's terminal fields can only be written from a [`RunFinish`], and a
//! `RunFinish` can only be produced by one of the builders below.

use serde::Serialize;

use crate::types::{ErrorCategory, ErrorSummary, RunCounts, RunStatus, Watermark};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunFinish {
    status: RunStatus,
    counts: Option<RunCounts>,
    cursor_after: Option<Watermark>,
    error_summary: Option<ErrorSummary>,
}

impl RunFinish {
    /// Fetch completed and produced data.
    pub fn success(counts: RunCounts, cursor_after: Option<Watermark>) -> Self {
        Self {
            status: RunStatus::Completed,
            counts: Some(counts),
            cursor_after,
            error_summary: None,
        }
    }

    /// Fetch completed without new data. The cursor may still move when the
    /// source reports a later watermark (e.g. an empty window was scanned).
    pub fn no_data(cursor_after: Option<Watermark>) -> Self {
        Self {
            status: RunStatus::NoData,
            counts: Some(RunCounts::default()),
            cursor_after,
            error_summary: None,
        }
    }

    /// Fetch failed; the job will be retried or dead-lettered by the caller.
    pub fn exception(error: ErrorSummary, counts: Option<RunCounts>) -> Self {
        Self {
            status: RunStatus::Failed,
            counts,
            cursor_after: None,
            error_summary: Some(error),
        }
    }

    /// The worker lost its lease mid-run; nothing it produced is committed.
    pub fn lease_lost<S: Into<String>>(message: S) -> Self {
        Self {
            status: RunStatus::Failed,
            counts: None,
            cursor_after: None,
            error_summary: Some(ErrorSummary::new(ErrorCategory::LeaseLost, message)),
        }
    }

    /// The job was dead-lettered while this run was open.
    pub fn mark_dead(error: ErrorSummary) -> Self {
        Self {
            status: RunStatus::Failed,
            counts: None,
            cursor_after: None,
            error_summary: Some(error),
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn counts(&self) -> Option<&RunCounts> {
        self.counts.as_ref()
    }

    pub fn cursor_after(&self) -> Option<&Watermark> {
        self.cursor_after.as_ref()
    }

    pub fn error_summary(&self) -> Option<&ErrorSummary> {
        self.error_summary.as_ref()
    }

    pub fn error_category(&self) -> Option<ErrorCategory> {
        self.error_summary.as_ref().map(|summary| summary.category)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, RunStatus::Completed | RunStatus::NoData)
    }
}
