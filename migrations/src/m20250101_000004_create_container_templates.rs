use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ContainerTemplates::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ContainerTemplates::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ContainerTemplates::NodeId).big_integer().not_null().default(0))
                    .col(ColumnDef::new(ContainerTemplates::Name).string_len(128).not_null())
                    .col(ColumnDef::new(ContainerTemplates::ConfigJson).text().not_null())
                    .col(ColumnDef::new(ContainerTemplates::CreatedAt).big_integer().not_null())
                    .col(ColumnDef::new(ContainerTemplates::UpdatedAt).big_integer().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_container_templates_name")
                    .table(ContainerTemplates::Table)
                    .col(ContainerTemplates::Name)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ContainerTemplates::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ContainerTemplates {
    Table,
    Id,
    NodeId,
    Name,
    ConfigJson,
    CreatedAt,
    UpdatedAt,
}
