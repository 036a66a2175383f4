//! Request and reply bodies exchanged between clients, the controller and agents.

use crate::models::*;
use crate::error::RpcError;
use serde::{Deserialize, Serialize};

/// Reply body for operations that return nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageRequest {
    pub page_size: i64,
    pub page_no: i64,
}

// ---------------------------------------------------------------------------
// Container service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListContainersRequest {
    /// `None` targets every registered node.
    pub node_ids: Option<Vec<i64>>,
    pub list_all: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListContainersReply {
    pub containers: Vec<NodeContainer>,
    /// Addresses of the nodes that could not be queried.
    pub fail_nodes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateContainerRequest {
    pub node_id: i64,
    pub configs: ContainerConfigs,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateContainerReply {
    pub container_id: String,
    /// Set by the agent when the container exists but could not be finished
    /// or cleaned up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerBatchRequest {
    pub ids: Vec<ContainerIdList>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerBatchReply {
    pub ok_ids: Vec<String>,
    pub fail_infos: Vec<ContainerFailInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectContainerRequest {
    pub node_id: i64,
    pub container_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectContainerReply {
    pub configs: ContainerConfigs,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateContainerRequest {
    pub node_id: i64,
    pub container_id: String,
    pub resource_limit: Option<ResourceLimit>,
    pub restart_policy: Option<RestartPolicy>,
    pub networks: Option<Vec<NetworkConfig>>,
    pub security_config: Option<SecurityConfig>,
}

impl UpdateContainerRequest {
    pub fn is_empty(&self) -> bool {
        self.resource_limit.is_none()
            && self.restart_policy.is_none()
            && self.networks.is_none()
            && self.security_config.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorHistoryRequest {
    pub node_id: i64,
    /// Empty queries the host itself.
    pub container_id: String,
    pub start_time: i64,
    pub end_time: i64,
    /// Minutes per sample.
    pub interval: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorHistoryReply {
    pub rsc_limit: ResourceLimit,
    pub cpu_usage: Vec<MonitorSample>,
    pub memory_usage: Vec<MonitorSample>,
    pub disk_usage: Vec<MonitorSample>,
    pub net_rx: Vec<MonitorSample>,
    pub net_tx: Vec<MonitorSample>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListTemplateReply {
    pub page: PageInfo,
    pub data: Vec<ContainerTemplate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateRequest {
    /// Ignored on create.
    pub id: i64,
    pub node_id: i64,
    pub conf: ContainerConfigs,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdRequest {
    pub id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdsRequest {
    pub ids: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateBackupRequest {
    pub node_id: i64,
    pub container_id: String,
    pub backup_desc: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateBackupRequest {
    pub id: i64,
    pub backup_desc: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumeBackupRequest {
    pub node_id: i64,
    pub container_id: String,
    pub backup_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumeBackupReply {
    pub container_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListBackupReply {
    pub data: Vec<ContainerBackup>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentRemoveBackupRequest {
    pub image_ref: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentResumeBackupRequest {
    pub container_id: String,
    pub image_ref: String,
    pub security_config: Option<SecurityConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddBackupJobRequest {
    pub id: i64,
    pub container_id: String,
    pub backup_name: String,
}

// ---------------------------------------------------------------------------
// Node service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListNodesReply {
    pub nodes: Vec<NodeInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateNodeRequest {
    pub name: String,
    pub address: String,
    pub comment: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateNodeRequest {
    pub node_id: i64,
    pub name: String,
    pub comment: String,
    pub rsc_limit: Option<NodeResourceLimit>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeStatusRequest {
    /// Empty means every node.
    pub node_ids: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeStatusReply {
    pub status_list: Vec<NodeStatus>,
}

// ---------------------------------------------------------------------------
// Image service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeImagesReply {
    pub images: Vec<NodeImage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSyncRequest {
    pub to_remove: Vec<String>,
    pub to_pull: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListImagesReply {
    pub page: PageInfo,
    pub images: Vec<ImageInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApproveImageRequest {
    pub image_id: i64,
    pub approve: bool,
    pub reject_reason: String,
}

// ---------------------------------------------------------------------------
// Network service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeRequest {
    pub node_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListNetworksReply {
    pub bridges: Vec<BridgeNetwork>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectNetworkRequest {
    pub node_id: i64,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisconnectNetworkRequest {
    pub node_id: i64,
    pub interface: String,
    pub container_id: String,
}

// ---------------------------------------------------------------------------
// Security service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcProtectionType {
    /// Executable whitelist enforced by the kernel module.
    #[default]
    Exec,
    /// Processes allowed to reach the network.
    Net,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateFileProtectionRequest {
    pub node_id: i64,
    pub container_id: String,
    pub is_on: bool,
    pub to_append: Vec<String>,
    pub to_remove: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateProcProtectionRequest {
    pub node_id: i64,
    pub container_id: String,
    pub protection_type: ProcProtectionType,
    pub is_on: bool,
    pub to_append: Vec<String>,
    pub to_remove: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListProtectionRequest {
    pub node_id: i64,
    pub container_id: String,
    pub protection_type: ProcProtectionType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSecurityState {
    pub container_id: String,
    pub proc_protection: Option<ProcProtection>,
    pub file_protection: Option<FileProtection>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadSecurityConfigRequest {
    pub configs: Vec<ContainerSecurityState>,
}

// ---------------------------------------------------------------------------
// Logging service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListRuntimeRequest {
    pub page_size: i64,
    pub page_no: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub node_id: i64,
    pub event_module: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListRuntimeReply {
    pub page: PageInfo,
    pub logs: Vec<RuntimeLog>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListWarnRequest {
    pub page_size: i64,
    pub page_no: i64,
    pub node_id: i64,
    pub event_module: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListWarnReply {
    pub page: PageInfo,
    pub logs: Vec<WarnLog>,
}

// ---------------------------------------------------------------------------
// Authz plugin
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitiveAction {
    Add,
    Del,
}

/// One line on the authz plugin socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthzUpdateRequest {
    pub action: SensitiveAction,
    /// Container name followed by id prefixes and the full id.
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthzUpdateReply {
    pub ok: bool,
    pub error: String,
}
