//! Migration to create the sync_repositories table.
//!
//! Repositories are owned by the ledger; the engine reads them to decide what
//! to schedule.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncRepositories::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncRepositories::RepoId)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(SyncRepositories::RepoKey)
                            .text()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(SyncRepositories::SourceKind).text().not_null())
                    .col(ColumnDef::new(SyncRepositories::GitlabInstance).text().null())
                    .col(ColumnDef::new(SyncRepositories::TenantId).text().null())
                    .col(
                        ColumnDef::new(SyncRepositories::Enabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(SyncRepositories::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncRepositories::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_repositories_enabled_created")
                    .table(SyncRepositories::Table)
                    .col(SyncRepositories::Enabled)
                    .col(SyncRepositories::CreatedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SyncRepositories::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncRepositories {
    Table,
    RepoId,
    RepoKey,
    SourceKind,
    GitlabInstance,
    TenantId,
    Enabled,
    CreatedAt,
    UpdatedAt,
}
