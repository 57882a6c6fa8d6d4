//! Migration to create the sync_rate_limit_buckets table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncRateLimitBuckets::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncRateLimitBuckets::BucketKey)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(SyncRateLimitBuckets::PausedUntil)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(SyncRateLimitBuckets::Reason).text().null())
                    .col(
                        ColumnDef::new(SyncRateLimitBuckets::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SyncRateLimitBuckets::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncRateLimitBuckets {
    Table,
    BucketKey,
    PausedUntil,
    Reason,
    UpdatedAt,
}
