//! Migration to create the sync_locks table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncLocks::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(SyncLocks::LockId).uuid().not_null().primary_key())
                    .col(ColumnDef::new(SyncLocks::RepoId).big_integer().not_null())
                    .col(ColumnDef::new(SyncLocks::JobType).text().not_null())
                    .col(ColumnDef::new(SyncLocks::JobId).uuid().null())
                    .col(ColumnDef::new(SyncLocks::LockedBy).text().not_null())
                    .col(
                        ColumnDef::new(SyncLocks::LockedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(SyncLocks::LeaseSeconds).integer().not_null())
                    .col(
                        ColumnDef::new(SyncLocks::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_locks_repo_job_type")
                    .table(SyncLocks::Table)
                    .col(SyncLocks::RepoId)
                    .col(SyncLocks::JobType)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_locks_expires_at")
                    .table(SyncLocks::Table)
                    .col(SyncLocks::ExpiresAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SyncLocks::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncLocks {
    Table,
    LockId,
    RepoId,
    JobType,
    JobId,
    LockedBy,
    LockedAt,
    LeaseSeconds,
    ExpiresAt,
}
