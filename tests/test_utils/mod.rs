//! Test utilities for database testing.
//!
//! Each helper works against an in-memory SQLite database with every
//! migration applied.

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use migration::{Migrator, MigratorTrait};
use scm_sync::config::AppConfig;
use scm_sync::models::sync_repository;
use scm_sync::repositories::{NewRepository, RepositoryCatalog};
use scm_sync::types::SourceKind;
use sea_orm::{Database, DatabaseConnection};

pub const INSTANCE: &str = "gitlab.example.com";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

pub async fn setup_test_db_arc() -> Result<Arc<DatabaseConnection>> {
    Ok(Arc::new(setup_test_db().await?))
}

/// Defaults with the knobs tests rely on pinned: no retry jitter, no enqueue
/// jitter, and a single-job claim batch.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.retry.jitter_factor = 0.0;
    config.scheduler.enqueue_jitter_seconds = 0;
    config.queue.claim_batch = 1;
    config.worker.concurrency = 1;
    config
}

pub fn test_config_arc() -> Arc<AppConfig> {
    Arc::new(test_config())
}

/// Registers an enabled repository in the catalog.
pub async fn insert_repository(
    db: &Arc<DatabaseConnection>,
    repo_id: i64,
    repo_key: &str,
    source_kind: SourceKind,
    gitlab_instance: Option<&str>,
    tenant_id: Option<&str>,
) -> Result<sync_repository::Model> {
    let catalog = RepositoryCatalog::new(db.clone());
    let repo = catalog
        .upsert(NewRepository {
            repo_id,
            repo_key: repo_key.to_string(),
            source_kind,
            gitlab_instance: gitlab_instance.map(str::to_string),
            tenant_id: tenant_id.map(str::to_string),
            enabled: true,
        })
        .await?;
    Ok(repo)
}

/// Registers a GitLab repository on [`INSTANCE`].
pub async fn insert_gitlab_repository(
    db: &Arc<DatabaseConnection>,
    repo_id: i64,
) -> Result<sync_repository::Model> {
    insert_repository(
        db,
        repo_id,
        &format!("group/project-{repo_id}"),
        SourceKind::GitLab,
        Some(INSTANCE),
        Some("tenant-a"),
    )
    .await
}
