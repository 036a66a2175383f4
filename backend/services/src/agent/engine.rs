//! Container engine seam used by the agent runtime driver.
//!
//! The types here carry only what the driver reads or writes, so the driver
//! can be exercised against an in-memory engine in tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};

use crate::error::ServiceResult;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub image_id: String,
    pub command: String,
    pub state: String,
    pub created: i64,
    /// Bytes of the container's root filesystem.
    pub size_root_fs: i64,
    pub labels: HashMap<String, String>,
    /// Network name to the IPv4 address the container holds or asked for.
    pub networks: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineMount {
    pub kind: String,
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineEndpoint {
    pub network: String,
    /// Address requested through IPAM, empty when the engine picked one.
    pub ipam_address: String,
    pub ip_address: String,
    pub ip_prefix_len: i64,
    pub mac_address: String,
    pub gateway: String,
}

/// Resource settings in engine units: nano CPUs, share weight and bytes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineResources {
    pub nano_cpus: i64,
    pub cpu_shares: i64,
    pub memory: i64,
    pub memory_reservation: i64,
    pub memory_swap: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineRestartPolicy {
    pub name: String,
    pub max_retry: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub mounts: Vec<EngineMount>,
    pub restart: Option<EngineRestartPolicy>,
    pub resources: Option<EngineResources>,
    pub storage_opt: HashMap<String, String>,
    /// Only the first network can be attached at create time.
    pub network: Option<EngineEndpoint>,
    pub tty: bool,
    pub open_stdin: bool,
    pub privileged: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineInspect {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub running: bool,
    pub pid: i64,
    pub started_at: i64,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
    pub mounts: Vec<EngineMount>,
    pub restart: Option<EngineRestartPolicy>,
    pub resources: Option<EngineResources>,
    pub storage_opt: HashMap<String, String>,
    pub networks: Vec<EngineEndpoint>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineImage {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub size: i64,
    pub created: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineNetwork {
    pub name: String,
    pub driver: String,
    pub subnet: String,
    pub ip_range: String,
    pub gateway: String,
}

/// One-shot container usage sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    /// Cores in use.
    pub cpu_cores: f64,
    pub online_cpus: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineInfo {
    pub containers: i64,
    pub containers_running: i64,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn info(&self) -> ServiceResult<EngineInfo>;

    async fn list_containers(&self, all: bool) -> ServiceResult<Vec<EngineContainer>>;
    async fn create_container(&self, spec: &EngineSpec) -> ServiceResult<String>;
    async fn start_container(&self, id: &str) -> ServiceResult<()>;
    /// `timeout` is the grace period in seconds before the engine kills.
    async fn stop_container(&self, id: &str, timeout: i64) -> ServiceResult<()>;
    async fn kill_container(&self, id: &str) -> ServiceResult<()>;
    async fn restart_container(&self, id: &str, timeout: i64) -> ServiceResult<()>;
    async fn remove_container(&self, id: &str, force: bool) -> ServiceResult<()>;
    async fn inspect_container(&self, id: &str) -> ServiceResult<EngineInspect>;
    async fn update_container(
        &self,
        id: &str,
        resources: Option<&EngineResources>,
        restart: Option<&EngineRestartPolicy>,
    ) -> ServiceResult<()>;
    async fn container_stats(&self, id: &str) -> ServiceResult<EngineStats>;
    /// Commits the container to `reference` and returns the new image id.
    async fn commit_container(&self, id: &str, reference: &str) -> ServiceResult<String>;

    async fn list_images(&self) -> ServiceResult<Vec<EngineImage>>;
    async fn inspect_image(&self, reference: &str) -> ServiceResult<EngineImage>;
    async fn pull_image(&self, reference: &str) -> ServiceResult<()>;
    async fn tag_image(&self, source: &str, reference: &str) -> ServiceResult<()>;
    async fn remove_image(&self, reference: &str) -> ServiceResult<()>;

    async fn list_networks(&self) -> ServiceResult<Vec<EngineNetwork>>;
    async fn connect_network(&self, container_id: &str, endpoint: &EngineEndpoint) -> ServiceResult<()>;
    async fn disconnect_network(&self, container_id: &str, network: &str) -> ServiceResult<()>;
}
