use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ContainerConfigs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ContainerConfigs::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ContainerConfigs::NodeId).big_integer().not_null())
                    .col(ColumnDef::new(ContainerConfigs::Uuid).string_len(64).not_null())
                    .col(ColumnDef::new(ContainerConfigs::ContainerId).string_len(128).not_null().default(""))
                    .col(ColumnDef::new(ContainerConfigs::ContainerName).string_len(128).not_null())
                    .col(ColumnDef::new(ContainerConfigs::SecurityConfig).text().not_null())
                    .col(ColumnDef::new(ContainerConfigs::CreatedAt).big_integer().not_null())
                    .col(ColumnDef::new(ContainerConfigs::UpdatedAt).big_integer().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_container_configs_uuid")
                    .table(ContainerConfigs::Table)
                    .col(ContainerConfigs::Uuid)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_container_configs_node_container")
                    .table(ContainerConfigs::Table)
                    .col(ContainerConfigs::NodeId)
                    .col(ContainerConfigs::ContainerId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ContainerConfigs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ContainerConfigs {
    Table,
    Id,
    NodeId,
    Uuid,
    ContainerId,
    ContainerName,
    SecurityConfig,
    CreatedAt,
    UpdatedAt,
}
