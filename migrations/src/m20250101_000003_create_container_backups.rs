use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ContainerBackups::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ContainerBackups::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ContainerBackups::NodeId).big_integer().not_null())
                    .col(ColumnDef::new(ContainerBackups::Uuid).string_len(64).not_null())
                    .col(ColumnDef::new(ContainerBackups::BackupName).string_len(64).not_null())
                    .col(ColumnDef::new(ContainerBackups::BackupDesc).string_len(512).not_null().default(""))
                    .col(ColumnDef::new(ContainerBackups::ImageRef).string_len(255).not_null().default(""))
                    .col(ColumnDef::new(ContainerBackups::ImageId).string_len(128).not_null().default(""))
                    .col(ColumnDef::new(ContainerBackups::ImageSize).big_integer().not_null().default(0))
                    .col(ColumnDef::new(ContainerBackups::Status).small_integer().not_null().default(0))
                    .col(ColumnDef::new(ContainerBackups::CreatedAt).big_integer().not_null())
                    .col(ColumnDef::new(ContainerBackups::UpdatedAt).big_integer().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_container_backups_uuid")
                    .table(ContainerBackups::Table)
                    .col(ContainerBackups::Uuid)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ContainerBackups::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ContainerBackups {
    Table,
    Id,
    NodeId,
    Uuid,
    BackupName,
    BackupDesc,
    ImageRef,
    ImageId,
    ImageSize,
    Status,
    CreatedAt,
    UpdatedAt,
}
