//! Domain vocabulary shared by the queue, workers, scheduler and admin surface.
//!
//! Status and kind values are persisted as lowercase text; every enum here
//! round-trips through [`as_str`](JobStatus::as_str) and `FromStr`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

/// Error returned when a persisted or user-supplied token is not a known variant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

text_enum!(
    /// The kind of history a job mirrors.
    JobType, "job type", {
        Commits => "commits",
        MergeRequests => "merge_requests",
        ReviewEvents => "review_events",
    }
);

text_enum!(
    /// Whether a job continues from the cursor or replays a bounded window.
    JobMode, "job mode", {
        Incremental => "incremental",
        Backfill => "backfill",
    }
);

text_enum!(
    /// Persisted job lifecycle state.
    JobStatus, "job status", {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        Dead => "dead",
    }
);

text_enum!(
    /// Persisted run state.
    RunStatus, "run status", {
        Running => "running",
        Completed => "completed",
        Failed => "failed",
        NoData => "no_data",
    }
);

text_enum!(
    /// Upstream system a repository is mirrored from.
    SourceKind, "source kind", {
        GitLab => "gitlab",
        GitHub => "github",
        Svn => "svn",
    }
);

text_enum!(
    /// Classification of an execution outcome used for retry and breaker decisions.
    ErrorCategory, "error category", {
        Contention => "contention",
        LeaseLost => "lease_lost",
        Skipped => "skipped",
        Timeout => "timeout",
        Transient => "transient",
        RateLimited => "rate_limited",
        Unauthorized => "unauthorized",
        NotFound => "not_found",
        Configuration => "configuration",
        Internal => "internal",
    }
);

text_enum!(
    /// Circuit breaker state machine position.
    BreakerState, "breaker state", {
        Closed => "closed",
        HalfOpen => "half_open",
        Open => "open",
    }
);

text_enum!(
    /// How much diff detail a source should fetch.
    DiffMode, "diff mode", {
        Full => "full",
        Stat => "stat",
        Off => "none",
    }
);

impl JobStatus {
    /// Statuses that occupy the single active slot of a repository/job type key.
    pub const ACTIVE: &'static [JobStatus] =
        &[JobStatus::Pending, JobStatus::Running, JobStatus::Failed];

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }
}

impl SourceKind {
    /// Job types this kind of upstream can serve.
    pub fn job_types(&self) -> &'static [JobType] {
        match self {
            SourceKind::GitLab | SourceKind::GitHub => JobType::ALL,
            SourceKind::Svn => &[JobType::Commits],
        }
    }

    /// SVN history is addressed by revision, everything else by time.
    pub fn uses_revisions(&self) -> bool {
        matches!(self, SourceKind::Svn)
    }
}

impl BreakerState {
    /// Numeric encoding for gauges: closed 0, half-open 1, open 2.
    pub fn gauge_value(&self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::HalfOpen => 1.0,
            BreakerState::Open => 2.0,
        }
    }
}

impl ErrorCategory {
    /// Whether the job should be retried with backoff rather than dead-lettered.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Timeout
                | ErrorCategory::Transient
                | ErrorCategory::RateLimited
                | ErrorCategory::Internal
        )
    }

    /// Whether the outcome feeds the circuit breaker windows.
    pub fn counts_toward_breaker(&self) -> bool {
        !matches!(
            self,
            ErrorCategory::Contention | ErrorCategory::LeaseLost | ErrorCategory::Skipped
        )
    }
}

/// Progress marker for a repository/job type.
///
/// Timestamps and revisions never compare with each other; a cursor keeps the
/// kind it was first written with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Watermark {
    Timestamp(DateTime<Utc>),
    Revision(i64),
}

impl Watermark {
    /// True when `next` moves strictly forward from `self`.
    ///
    /// Mismatched kinds are never an advance.
    pub fn is_advanced_by(&self, next: &Watermark) -> bool {
        match (self, next) {
            (Watermark::Timestamp(current), Watermark::Timestamp(candidate)) => {
                candidate > current
            }
            (Watermark::Revision(current), Watermark::Revision(candidate)) => candidate > current,
            _ => false,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    pub fn from_json(value: &JsonValue) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Watermark::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Watermark::Revision(rev) => write!(f, "r{rev}"),
        }
    }
}

impl FromStr for Watermark {
    type Err = ParseEnumError;

    /// Accepts `r<N>` or a bare integer for revisions and RFC 3339 for timestamps.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let revision = trimmed.strip_prefix('r').unwrap_or(trimmed);
        if let Ok(rev) = revision.parse::<i64>() {
            return Ok(Watermark::Revision(rev));
        }
        DateTime::parse_from_rfc3339(trimmed)
            .map(|ts| Watermark::Timestamp(ts.with_timezone(&Utc)))
            .map_err(|_| ParseEnumError {
                kind: "watermark",
                value: value.to_string(),
            })
    }
}

/// Per-run counters reported by a source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub fetched: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
}

impl RunCounts {
    pub fn is_empty(&self) -> bool {
        self.fetched == 0 && self.inserted == 0 && self.updated == 0
    }
}

/// Structured error stored on failed runs and jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub category: ErrorCategory,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_backoff_seconds: Option<f64>,
}

impl ErrorSummary {
    pub fn new<S: Into<String>>(category: ErrorCategory, message: S) -> Self {
        Self {
            category,
            message: message.into(),
            suggested_backoff_seconds: None,
        }
    }

    pub fn with_backoff(mut self, seconds: f64) -> Self {
        self.suggested_backoff_seconds = Some(seconds);
        self
    }
}

/// Job payload exchanged between the scheduler and sources.
///
/// Keys this engine does not interpret are preserved in `extra` so producers
/// and handlers can extend the contract without a migration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitlab_instance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_batch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_diff_mode: Option<DiffMode>,
    #[serde(default)]
    pub is_backfill_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_state: Option<BreakerState>,
    #[serde(default)]
    pub is_probe: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_rev: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_rev: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl JobPayload {
    /// Decodes a stored payload, falling back to an empty payload that keeps
    /// the original object keys when the known fields are malformed.
    pub fn from_json(value: &JsonValue) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_else(|_| JobPayload {
            extra: value.as_object().cloned().unwrap_or_default(),
            ..Default::default()
        })
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or_else(|_| JsonValue::Object(Map::new()))
    }

    /// Batch size the source should use: explicit size first, then the hint.
    pub fn effective_batch_size(&self, default: u32) -> u32 {
        self.batch_size
            .or(self.suggested_batch_size)
            .unwrap_or(default)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn enums_round_trip_through_text() {
        for job_type in JobType::ALL {
            assert_eq!(job_type.as_str().parse::<JobType>().unwrap(), *job_type);
        }
        assert!("pull_requests".parse::<JobType>().is_err());
        assert_eq!("no_data".parse::<RunStatus>().unwrap(), RunStatus::NoData);
    }

    #[test]
    fn failed_is_active_but_dead_is_not() {
        assert!(JobStatus::Failed.is_active());
        assert!(!JobStatus::Dead.is_active());
        assert!(!JobStatus::Completed.is_active());
    }

    #[test]
    fn watermark_only_advances_within_kind() {
        let early = Watermark::Timestamp("2025-01-01T00:00:00Z".parse().unwrap());
        let late = Watermark::Timestamp("2025-01-02T00:00:00Z".parse().unwrap());
        assert!(early.is_advanced_by(&late));
        assert!(!late.is_advanced_by(&early));
        assert!(!late.is_advanced_by(&late));
        assert!(!Watermark::Revision(10).is_advanced_by(&late));
        assert!(Watermark::Revision(10).is_advanced_by(&Watermark::Revision(11)));
    }

    #[test]
    fn watermark_parses_revisions_and_timestamps() {
        assert_eq!("r42".parse::<Watermark>().unwrap(), Watermark::Revision(42));
        assert_eq!("42".parse::<Watermark>().unwrap(), Watermark::Revision(42));
        assert!(matches!(
            "2025-03-01T10:00:00+00:00".parse::<Watermark>().unwrap(),
            Watermark::Timestamp(_)
        ));
        assert!("yesterday".parse::<Watermark>().is_err());
    }

    #[test]
    fn payload_preserves_unknown_fields() {
        let raw = json!({
            "gitlab_instance": "gitlab.example.com",
            "batch_size": 50,
            "is_probe": true,
            "custom_hint": {"nested": [1, 2]},
        });
        let payload = JobPayload::from_json(&raw);
        assert_eq!(payload.gitlab_instance.as_deref(), Some("gitlab.example.com"));
        assert!(payload.is_probe);
        assert_eq!(payload.extra.get("custom_hint"), raw.get("custom_hint"));

        let encoded = payload.to_json();
        assert_eq!(encoded.get("custom_hint"), raw.get("custom_hint"));
        assert_eq!(encoded.get("batch_size"), Some(&json!(50)));
    }

    #[test]
    fn effective_batch_prefers_explicit_size() {
        let payload = JobPayload {
            batch_size: None,
            suggested_batch_size: Some(25),
            ..Default::default()
        };
        assert_eq!(payload.effective_batch_size(100), 25);
        let payload = JobPayload {
            batch_size: Some(10),
            suggested_batch_size: Some(25),
            ..Default::default()
        };
        assert_eq!(payload.effective_batch_size(100), 10);
    }
}
