//! # Repository Catalog
//!
//! Read access to the repositories the ledger wants mirrored, plus the upsert
//! used for local seeding and tests.

use std::sync::Arc;

use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set};

use crate::db::to_db_time;
use crate::error::{EngineError, EngineResult, db_err};
use crate::models::sync_repository::{ActiveModel, Column, Entity as SyncRepository, Model};
use crate::types::SourceKind;

/// Repository row to register.
#[derive(Debug, Clone)]
pub struct NewRepository {
    pub repo_id: i64,
    pub repo_key: String,
    pub source_kind: SourceKind,
    pub gitlab_instance: Option<String>,
    pub tenant_id: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct RepositoryCatalog {
    db: Arc<DatabaseConnection>,
}

impl RepositoryCatalog {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Enabled repositories, oldest first.
    pub async fn list_enabled(&self) -> EngineResult<Vec<Model>> {
        SyncRepository::find()
            .filter(Column::Enabled.eq(true))
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::RepoId)
            .all(self.db.as_ref())
            .await
            .map_err(db_err("failed to list enabled repositories"))
    }

    pub async fn find_by_id(&self, repo_id: i64) -> EngineResult<Option<Model>> {
        SyncRepository::find_by_id(repo_id)
            .one(self.db.as_ref())
            .await
            .map_err(db_err("failed to load repository"))
    }

    pub async fn find_by_key(&self, repo_key: &str) -> EngineResult<Option<Model>> {
        SyncRepository::find()
            .filter(Column::RepoKey.eq(repo_key))
            .one(self.db.as_ref())
            .await
            .map_err(db_err("failed to load repository by key"))
    }

    /// Resolves either a numeric id or a repository key.
    pub async fn resolve(&self, reference: &str) -> EngineResult<Model> {
        if let Ok(repo_id) = reference.parse::<i64>()
            && let Some(found) = self.find_by_id(repo_id).await?
        {
            return Ok(found);
        }
        self.find_by_key(reference)
            .await?
            .ok_or_else(|| EngineError::not_found("repository", reference))
    }

    pub async fn upsert(&self, repo: NewRepository) -> EngineResult<Model> {
        let now = to_db_time(Utc::now());
        let model = ActiveModel {
            repo_id: Set(repo.repo_id),
            repo_key: Set(repo.repo_key),
            source_kind: Set(repo.source_kind.as_str().to_string()),
            gitlab_instance: Set(repo.gitlab_instance),
            tenant_id: Set(repo.tenant_id),
            enabled: Set(repo.enabled),
            created_at: Set(now),
            updated_at: Set(now),
        };

        SyncRepository::insert(model)
            .on_conflict(
                OnConflict::column(Column::RepoId)
                    .update_columns([
                        Column::RepoKey,
                        Column::SourceKind,
                        Column::GitlabInstance,
                        Column::TenantId,
                        Column::Enabled,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(self.db.as_ref())
            .await
            .map_err(db_err("failed to upsert repository"))?;

        self.find_by_id(repo.repo_id)
            .await?
            .ok_or_else(|| EngineError::not_found("repository", repo.repo_id))
    }
}
