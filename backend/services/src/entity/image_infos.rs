use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "image_infos")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    pub version: String,
    pub description: String,
    pub file_size: i64,
    pub image_id: String,
    pub reject_reason: String,
    /// 0 waiting, 1 rejected, 2 approved
    #[sea_orm(column_type = "SmallInteger")]
    pub approval_status: i16,
    /// 0 failed, 1 abnormal, 2 passed
    #[sea_orm(column_type = "SmallInteger")]
    pub verify_status: i16,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
