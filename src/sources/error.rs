use thiserror::Error;

use crate::types::{ErrorCategory, ErrorSummary};

/// Transport-level failure reported by an upstream client.
#[derive(Debug, Clone, Error)]
pub enum SourceTransportError {
    #[error("HTTP error {status}: {}", body.as_deref().unwrap_or_default())]
    HttpError {
        status: u16,
        body: Option<String>,
        retry_after: Option<u64>,
    },
    #[error("malformed response: {details}")]
    MalformedResponse { details: String },
    #[error("network error: {details}")]
    NetworkError { details: String, retryable: bool },
    #[error("request timed out: {details}")]
    Timeout { details: String },
    #[error("authentication failed: {details}")]
    AuthenticationError { details: String },
    #[error("rate limited")]
    RateLimitError {
        retry_after: Option<u64>,
        limit: Option<u32>,
    },
    #[error("configuration error: {details}")]
    ConfigurationError { details: String },
}

/// Classified fetch failure; the category drives retry and breaker decisions.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{category}: {message}")]
pub struct SourceError {
    category: ErrorCategory,
    message: String,
    retry_after_seconds: Option<u64>,
}

impl SourceError {
    pub fn new<S: Into<String>>(category: ErrorCategory, message: S) -> Self {
        Self {
            category,
            message: message.into(),
            retry_after_seconds: None,
        }
    }

    pub fn rate_limited(retry_after_seconds: Option<u64>) -> Self {
        Self {
            category: ErrorCategory::RateLimited,
            message: match retry_after_seconds {
                Some(seconds) => format!("rate limited; retry after {seconds}s"),
                None => "rate limited".to_string(),
            },
            retry_after_seconds,
        }
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorCategory::Transient, message)
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorCategory::Timeout, message)
    }

    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorCategory::Unauthorized, message)
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorCategory::NotFound, message)
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorCategory::Configuration, message)
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn retry_after_seconds(&self) -> Option<u64> {
        self.retry_after_seconds
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }

    /// Summary persisted on the job and run.
    pub fn to_summary(&self) -> ErrorSummary {
        let summary = ErrorSummary::new(self.category, self.message.clone());
        match self.retry_after_seconds {
            Some(seconds) => summary.with_backoff(seconds as f64),
            None => summary,
        }
    }
}

impl From<SourceTransportError> for SourceError {
    fn from(err: SourceTransportError) -> Self {
        match err {
            SourceTransportError::RateLimitError { retry_after, .. } => {
                SourceError::rate_limited(retry_after)
            }
            SourceTransportError::AuthenticationError { details } => {
                SourceError::unauthorized(details)
            }
            SourceTransportError::NetworkError { details, retryable } => {
                if retryable {
                    SourceError::transient(details)
                } else {
                    SourceError::configuration(details)
                }
            }
            SourceTransportError::Timeout { details } => SourceError::timeout(details),
            SourceTransportError::HttpError {
                status,
                body,
                retry_after,
            } => {
                let message = format!("HTTP error {}: {}", status, body.unwrap_or_default());
                match status {
                    429 => SourceError::rate_limited(retry_after),
                    401 | 403 => SourceError::unauthorized(message),
                    404 | 410 => SourceError::not_found(message),
                    408 | 504 => SourceError::timeout(message),
                    400..=499 => SourceError::configuration(message),
                    _ => SourceError::transient(message),
                }
            }
            SourceTransportError::MalformedResponse { details } => {
                SourceError::transient(format!("malformed response: {details}"))
            }
            SourceTransportError::ConfigurationError { details } => {
                SourceError::configuration(details)
            }
        }
    }
}
