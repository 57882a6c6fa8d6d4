//! Error types shared by the engine's persistence-facing components.

use sea_orm::{DbErr, RuntimeErr};
use thiserror::Error;
use tracing::error;

use crate::types::ParseEnumError;

/// Errors raised by queue, lock, repository and control-loop operations.
///
/// Business outcomes (retries, dead letters, contention) are recorded as state
/// transitions and never surface here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{context}: {source}")]
    Database {
        context: &'static str,
        #[source]
        source: DbErr,
    },
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("corrupt stored value: {0}")]
    CorruptValue(#[from] ParseEnumError),
    #[error("singleton '{name}' is held by {holder} until {expires_at}")]
    SingletonHeld {
        name: String,
        holder: String,
        expires_at: String,
    },
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput(message.into())
    }
}

/// Returns a mapper that logs a database failure with its context before
/// wrapping it, for use as `.map_err(db_err("failed to claim jobs"))`.
pub fn db_err(context: &'static str) -> impl FnOnce(DbErr) -> EngineError {
    move |source| {
        error!(error = ?source, context, "Database operation failed");
        EngineError::Database { context, source }
    }
}

/// Detects unique-constraint violations across the supported backends.
pub fn is_unique_violation(error: &DbErr) -> bool {
    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error
        .code()
        .map(|code| code.as_ref() == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code.as_ref()))
        .unwrap_or(false)
}
