use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(WarnLogs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(WarnLogs::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(WarnLogs::NodeId).big_integer().not_null())
                    .col(ColumnDef::new(WarnLogs::NodeInfo).string_len(128).not_null().default(""))
                    .col(ColumnDef::new(WarnLogs::EventType).big_integer().not_null())
                    .col(ColumnDef::new(WarnLogs::EventModule).big_integer().not_null())
                    .col(ColumnDef::new(WarnLogs::ContainerId).string_len(128).not_null().default(""))
                    .col(ColumnDef::new(WarnLogs::ContainerName).string_len(128).not_null().default(""))
                    .col(ColumnDef::new(WarnLogs::Detail).text().not_null())
                    .col(ColumnDef::new(WarnLogs::HaveRead).boolean().not_null().default(false))
                    .col(ColumnDef::new(WarnLogs::CreatedAt).big_integer().not_null())
                    .col(ColumnDef::new(WarnLogs::UpdatedAt).big_integer().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(RuntimeLogs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RuntimeLogs::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(RuntimeLogs::NodeId).big_integer().not_null().default(0))
                    .col(ColumnDef::new(RuntimeLogs::NodeInfo).string_len(128).not_null().default(""))
                    .col(ColumnDef::new(RuntimeLogs::UserId).big_integer().not_null().default(0))
                    .col(ColumnDef::new(RuntimeLogs::EventModule).big_integer().not_null())
                    .col(ColumnDef::new(RuntimeLogs::Target).string_len(255).not_null())
                    .col(ColumnDef::new(RuntimeLogs::Detail).text().not_null())
                    .col(ColumnDef::new(RuntimeLogs::StatusCode).big_integer().not_null())
                    .col(ColumnDef::new(RuntimeLogs::Error).text().not_null())
                    .col(ColumnDef::new(RuntimeLogs::CreatedAt).big_integer().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_warn_logs_unread")
                    .table(WarnLogs::Table)
                    .col(WarnLogs::HaveRead)
                    .col(WarnLogs::NodeId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_runtime_logs_created_at")
                    .table(RuntimeLogs::Table)
                    .col(RuntimeLogs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(RuntimeLogs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(WarnLogs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum WarnLogs {
    Table,
    Id,
    NodeId,
    NodeInfo,
    EventType,
    EventModule,
    ContainerId,
    ContainerName,
    Detail,
    HaveRead,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum RuntimeLogs {
    Table,
    Id,
    NodeId,
    NodeInfo,
    UserId,
    EventModule,
    Target,
    Detail,
    StatusCode,
    Error,
    CreatedAt,
}
