//! Migration to create the sync_pauses table for operator pauses.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncPauses::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(SyncPauses::PauseId).uuid().not_null().primary_key())
                    .col(ColumnDef::new(SyncPauses::RepoId).big_integer().not_null())
                    .col(ColumnDef::new(SyncPauses::JobType).text().not_null())
                    .col(ColumnDef::new(SyncPauses::Reason).text().not_null())
                    .col(
                        ColumnDef::new(SyncPauses::PausedUntil)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(SyncPauses::CreatedBy).text().not_null())
                    .col(
                        ColumnDef::new(SyncPauses::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_pauses_repo_job_type")
                    .table(SyncPauses::Table)
                    .col(SyncPauses::RepoId)
                    .col(SyncPauses::JobType)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SyncPauses::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncPauses {
    Table,
    PauseId,
    RepoId,
    JobType,
    Reason,
    PausedUntil,
    CreatedBy,
    CreatedAt,
}
