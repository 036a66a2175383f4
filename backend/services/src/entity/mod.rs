pub mod container_backups;
pub mod container_configs;
pub mod container_templates;
pub mod image_infos;
pub mod node_infos;
pub mod runtime_logs;
pub mod warn_logs;
