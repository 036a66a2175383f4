use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "runtime_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub node_id: i64,
    pub node_info: String,
    pub user_id: i64,
    pub event_module: i64,
    pub target: String,
    #[sea_orm(column_type = "Text")]
    pub detail: String,
    pub status_code: i64,
    #[sea_orm(column_type = "Text")]
    pub error: String,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
