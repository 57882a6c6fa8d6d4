//! Migration to create the sync_circuit_breakers table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncCircuitBreakers::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncCircuitBreakers::BreakerKey)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(SyncCircuitBreakers::State)
                            .text()
                            .not_null()
                            .default("closed"),
                    )
                    .col(
                        ColumnDef::new(SyncCircuitBreakers::OpenedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncCircuitBreakers::HalfOpenedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncCircuitBreakers::LastFailureReason)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncCircuitBreakers::FailureRate)
                            .double()
                            .not_null()
                            .default(0.0),
                    )
                    .col(
                        ColumnDef::new(SyncCircuitBreakers::RateLimitRate)
                            .double()
                            .not_null()
                            .default(0.0),
                    )
                    .col(
                        ColumnDef::new(SyncCircuitBreakers::TimeoutRate)
                            .double()
                            .not_null()
                            .default(0.0),
                    )
                    .col(
                        ColumnDef::new(SyncCircuitBreakers::ConsecutiveSuccesses)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncCircuitBreakers::ProbesIssued)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncCircuitBreakers::ProbeWindowStartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncCircuitBreakers::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SyncCircuitBreakers::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncCircuitBreakers {
    Table,
    BreakerKey,
    State,
    OpenedAt,
    HalfOpenedAt,
    LastFailureReason,
    FailureRate,
    RateLimitRate,
    TimeoutRate,
    ConsecutiveSuccesses,
    ProbesIssued,
    ProbeWindowStartedAt,
    UpdatedAt,
}
