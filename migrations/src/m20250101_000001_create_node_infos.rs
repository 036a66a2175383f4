use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(NodeInfos::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(NodeInfos::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(NodeInfos::Name).string_len(64).not_null())
                    .col(ColumnDef::new(NodeInfos::Address).string_len(64).not_null())
                    .col(ColumnDef::new(NodeInfos::Comment).string_len(256).not_null().default(""))
                    .col(ColumnDef::new(NodeInfos::CpuLimit).double().not_null().default(0.0))
                    .col(ColumnDef::new(NodeInfos::MemoryLimit).double().not_null().default(0.0))
                    .col(ColumnDef::new(NodeInfos::DiskLimit).double().not_null().default(0.0))
                    .col(ColumnDef::new(NodeInfos::UnreadWarn).big_integer().not_null().default(0))
                    .col(ColumnDef::new(NodeInfos::Deleted).boolean().not_null().default(false))
                    .col(ColumnDef::new(NodeInfos::CreatedAt).big_integer().not_null())
                    .col(ColumnDef::new(NodeInfos::UpdatedAt).big_integer().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_node_infos_address")
                    .table(NodeInfos::Table)
                    .col(NodeInfos::Address)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(NodeInfos::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum NodeInfos {
    Table,
    Id,
    Name,
    Address,
    Comment,
    CpuLimit,
    MemoryLimit,
    DiskLimit,
    UnreadWarn,
    Deleted,
    CreatedAt,
    UpdatedAt,
}
