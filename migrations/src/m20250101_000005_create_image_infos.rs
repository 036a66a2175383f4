use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ImageInfos::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ImageInfos::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ImageInfos::Name).string_len(128).not_null())
                    .col(ColumnDef::new(ImageInfos::Version).string_len(128).not_null())
                    .col(ColumnDef::new(ImageInfos::Description).string_len(512).not_null().default(""))
                    .col(ColumnDef::new(ImageInfos::FileSize).big_integer().not_null().default(0))
                    .col(ColumnDef::new(ImageInfos::ImageId).string_len(128).not_null().default(""))
                    .col(ColumnDef::new(ImageInfos::RejectReason).string_len(512).not_null().default(""))
                    .col(ColumnDef::new(ImageInfos::ApprovalStatus).small_integer().not_null().default(0))
                    .col(ColumnDef::new(ImageInfos::VerifyStatus).small_integer().not_null().default(0))
                    .col(ColumnDef::new(ImageInfos::CreatedAt).big_integer().not_null())
                    .col(ColumnDef::new(ImageInfos::UpdatedAt).big_integer().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_image_infos_name_version")
                    .table(ImageInfos::Table)
                    .col(ImageInfos::Name)
                    .col(ImageInfos::Version)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ImageInfos::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ImageInfos {
    Table,
    Id,
    Name,
    Version,
    Description,
    FileSize,
    ImageId,
    RejectReason,
    ApprovalStatus,
    VerifyStatus,
    CreatedAt,
    UpdatedAt,
}
