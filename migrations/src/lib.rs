pub use sea_orm_migration::prelude::*;

pub mod m20250101_000001_create_node_infos;
pub mod m20250101_000002_create_container_configs;
pub mod m20250101_000003_create_container_backups;
pub mod m20250101_000004_create_container_templates;
pub mod m20250101_000005_create_image_infos;
pub mod m20250101_000006_create_logs;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250101_000001_create_node_infos::Migration),
            Box::new(m20250101_000002_create_container_configs::Migration),
            Box::new(m20250101_000003_create_container_backups::Migration),
            Box::new(m20250101_000004_create_container_templates::Migration),
            Box::new(m20250101_000005_create_image_infos::Migration),
            Box::new(m20250101_000006_create_logs::Migration),
        ]
    }
}
