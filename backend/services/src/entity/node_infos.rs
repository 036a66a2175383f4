use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "node_infos")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    /// Unique; a removed node keeps its row and is revived on re-create.
    pub address: String,
    pub comment: String,
    #[sea_orm(column_type = "Double")]
    pub cpu_limit: f64,
    #[sea_orm(column_type = "Double")]
    pub memory_limit: f64,
    #[sea_orm(column_type = "Double")]
    pub disk_limit: f64,
    pub unread_warn: i64,
    pub deleted: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
