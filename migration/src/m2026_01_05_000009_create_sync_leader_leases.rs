//! Migration to create the sync_leader_leases table backing singleton roles.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncLeaderLeases::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncLeaderLeases::Name)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncLeaderLeases::Holder).text().not_null())
                    .col(
                        ColumnDef::new(SyncLeaderLeases::AcquiredAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncLeaderLeases::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SyncLeaderLeases::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncLeaderLeases {
    Table,
    Name,
    Holder,
    AcquiredAt,
    ExpiresAt,
}
