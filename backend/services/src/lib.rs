pub mod agent;
pub mod agent_client;
pub mod agent_pool;
pub mod config_diff;
pub mod container_service;
pub mod database;
pub mod entity;
pub mod error;
pub mod image_service;
pub mod log_service;
pub mod node_registry;
pub mod pagination;
pub mod permission;
pub mod registry_client;
pub mod security_service;
pub mod validation;
pub mod watchdog;

#[cfg(test)]
mod testing;

pub use agent_client::{AgentApi, HttpAgentClient};
pub use agent_pool::{AgentPool, HttpConnector};
pub use container_service::ContainerService;
pub use database::create_connection;
pub use error::{ServiceError, ServiceResult};
pub use image_service::ImageService;
pub use log_service::{LogService, RuntimeLogWriter};
pub use node_registry::NodeRegistry;
pub use permission::Caller;
pub use registry_client::{ImageRegistry, RegistryClient};
pub use security_service::SecurityService;
pub use watchdog::{MasterGate, Watchdog};
