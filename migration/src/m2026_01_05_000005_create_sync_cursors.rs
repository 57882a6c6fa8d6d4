//! Migration to create the sync_cursors table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncCursors::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(SyncCursors::RepoId).big_integer().not_null())
                    .col(ColumnDef::new(SyncCursors::JobType).text().not_null())
                    .col(ColumnDef::new(SyncCursors::Watermark).json_binary().not_null())
                    .col(ColumnDef::new(SyncCursors::RunId).uuid().null())
                    .col(
                        ColumnDef::new(SyncCursors::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .name("pk_sync_cursors")
                            .col(SyncCursors::RepoId)
                            .col(SyncCursors::JobType),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SyncCursors::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncCursors {
    Table,
    RepoId,
    JobType,
    Watermark,
    RunId,
    UpdatedAt,
}
