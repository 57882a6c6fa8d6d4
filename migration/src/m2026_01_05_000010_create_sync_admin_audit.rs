//! Migration to create the sync_admin_audit table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncAdminAudit::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncAdminAudit::AuditId)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncAdminAudit::Action).text().not_null())
                    .col(ColumnDef::new(SyncAdminAudit::Actor).text().not_null())
                    .col(ColumnDef::new(SyncAdminAudit::Target).json_binary().not_null())
                    .col(ColumnDef::new(SyncAdminAudit::Detail).json_binary().null())
                    .col(
                        ColumnDef::new(SyncAdminAudit::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_admin_audit_created_at")
                    .table(SyncAdminAudit::Table)
                    .col(SyncAdminAudit::CreatedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SyncAdminAudit::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncAdminAudit {
    Table,
    AuditId,
    Action,
    Actor,
    Target,
    Detail,
    CreatedAt,
}
