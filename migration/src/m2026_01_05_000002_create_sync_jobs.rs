//! Migration to create the sync_jobs table.
//!
//! Besides the claim-ordering index this adds a partial unique index that keeps
//! at most one active (pending, running or failed) job per repository and job
//! type.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::{DatabaseBackend, Statement};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncJobs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(SyncJobs::JobId).uuid().not_null().primary_key())
                    .col(ColumnDef::new(SyncJobs::RepoId).big_integer().not_null())
                    .col(ColumnDef::new(SyncJobs::JobType).text().not_null())
                    .col(ColumnDef::new(SyncJobs::Mode).text().not_null())
                    .col(
                        ColumnDef::new(SyncJobs::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::Attempts)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::MaxAttempts)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::ContentionCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::Priority)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::NotBefore)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(SyncJobs::LockedBy).text().null())
                    .col(
                        ColumnDef::new(SyncJobs::LockedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::LeaseSeconds)
                            .integer()
                            .not_null()
                            .default(300),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::LeaseExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(SyncJobs::Payload).json_binary().not_null())
                    .col(ColumnDef::new(SyncJobs::GitlabInstance).text().null())
                    .col(ColumnDef::new(SyncJobs::TenantId).text().null())
                    .col(ColumnDef::new(SyncJobs::LastError).json_binary().null())
                    .col(ColumnDef::new(SyncJobs::DeadReason).text().null())
                    .col(
                        ColumnDef::new(SyncJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Claim ordering: priority DESC, not_before ASC within a status.
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_sync_jobs_status_priority_not_before \
                 ON sync_jobs (status, priority DESC, not_before)"
                    .to_string(),
            ))
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_jobs_running_lease")
                    .table(SyncJobs::Table)
                    .col(SyncJobs::Status)
                    .col(SyncJobs::LeaseExpiresAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_jobs_repo_job_type")
                    .table(SyncJobs::Table)
                    .col(SyncJobs::RepoId)
                    .col(SyncJobs::JobType)
                    .to_owned(),
            )
            .await?;

        let backend = manager.get_database_backend();
        let statement = match backend {
            DatabaseBackend::Postgres => {
                "DO $$\nBEGIN\n    IF NOT EXISTS (\n        SELECT 1 FROM pg_indexes\n        WHERE schemaname = current_schema()\n          AND indexname = 'idx_sync_jobs_active_key'\n    ) THEN\n        CREATE UNIQUE INDEX idx_sync_jobs_active_key\n            ON sync_jobs (repo_id, job_type)\n            WHERE status IN ('pending','running','failed');\n    END IF;\nEND\n$$;"
            }
            _ => {
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_jobs_active_key \
                 ON sync_jobs (repo_id, job_type) \
                 WHERE status IN ('pending','running','failed')"
            }
        };
        manager
            .get_connection()
            .execute(Statement::from_string(backend, statement.to_string()))
            .await
            .map(|_| ())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "DROP INDEX IF EXISTS idx_sync_jobs_active_key".to_string(),
            ))
            .await?;

        manager
            .drop_table(Table::drop().table(SyncJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncJobs {
    Table,
    JobId,
    RepoId,
    JobType,
    Mode,
    Status,
    Attempts,
    MaxAttempts,
    ContentionCount,
    Priority,
    NotBefore,
    LockedBy,
    LockedAt,
    LeaseSeconds,
    LeaseExpiresAt,
    Payload,
    GitlabInstance,
    TenantId,
    LastError,
    DeadReason,
    CreatedAt,
    UpdatedAt,
}
