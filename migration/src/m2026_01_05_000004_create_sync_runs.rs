//! Migration to create the sync_runs table.
//!
//! Runs are the execution history the circuit breaker windows are computed
//! from, so they carry the instance and error category alongside timing.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncRuns::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(SyncRuns::RunId).uuid().not_null().primary_key())
                    .col(ColumnDef::new(SyncRuns::JobId).uuid().not_null())
                    .col(ColumnDef::new(SyncRuns::RepoId).big_integer().not_null())
                    .col(ColumnDef::new(SyncRuns::JobType).text().not_null())
                    .col(ColumnDef::new(SyncRuns::Mode).text().not_null())
                    .col(ColumnDef::new(SyncRuns::GitlabInstance).text().null())
                    .col(ColumnDef::new(SyncRuns::TenantId).text().null())
                    .col(
                        ColumnDef::new(SyncRuns::IsProbe)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(SyncRuns::Status).text().not_null())
                    .col(
                        ColumnDef::new(SyncRuns::StartedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncRuns::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(SyncRuns::WatermarkStart).json_binary().null())
                    .col(ColumnDef::new(SyncRuns::WatermarkEnd).json_binary().null())
                    .col(ColumnDef::new(SyncRuns::Stats).json_binary().null())
                    .col(ColumnDef::new(SyncRuns::ErrorCategory).text().null())
                    .col(ColumnDef::new(SyncRuns::ErrorSummary).json_binary().null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_runs_instance_finished")
                    .table(SyncRuns::Table)
                    .col(SyncRuns::GitlabInstance)
                    .col(SyncRuns::FinishedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_runs_repo_finished")
                    .table(SyncRuns::Table)
                    .col(SyncRuns::RepoId)
                    .col(SyncRuns::FinishedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_runs_job_id")
                    .table(SyncRuns::Table)
                    .col(SyncRuns::JobId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SyncRuns::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncRuns {
    Table,
    RunId,
    JobId,
    RepoId,
    JobType,
    Mode,
    GitlabInstance,
    TenantId,
    IsProbe,
    Status,
    StartedAt,
    FinishedAt,
    WatermarkStart,
    WatermarkEnd,
    Stats,
    ErrorCategory,
    ErrorSummary,
}
