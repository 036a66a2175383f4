use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Container configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimit {
    /// Fractional cores, 0 means all host cores.
    pub cpu_limit: f64,
    /// Offset on top of the engine's default CPU share weight.
    pub cpu_prio: i64,
    /// Megabytes.
    pub memory_limit: f64,
    pub memory_soft_limit: f64,
    pub disk_limit: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    pub name: String,
    pub max_retry: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub interface: String,
    pub container_id: String,
    pub ip_address: String,
    pub ip_prefix_len: i64,
    pub mac_address: String,
    pub gateway: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mount {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcProtection {
    pub is_on: bool,
    pub exe_list: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileProtection {
    pub is_on: bool,
    pub file_list: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkRule {
    /// tcp, udp, icmp
    pub protocols: Vec<String>,
    /// Single address or CIDR block.
    pub addr: String,
    /// 0 for every port.
    pub port: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkRuleList {
    pub is_on: bool,
    pub rules: Vec<NetworkRule>,
}

/// Per-container security posture. Stored as a JSON blob next to the
/// container configuration record and pushed to the agent on change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub disable_external_network: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub disable_cmd_operation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proc_protection: Option<ProcProtection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nproc_protection: Option<ProcProtection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_protection: Option<FileProtection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_rule: Option<NetworkRuleList>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfigs {
    pub container_id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub desc: String,
    pub uuid: String,
    pub envs: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub networks: Vec<NetworkConfig>,
    pub resource_limit: Option<ResourceLimit>,
    pub restart_policy: Option<RestartPolicy>,
    pub enable_graphic: bool,
    pub security_config: Option<SecurityConfig>,
}

// ---------------------------------------------------------------------------
// Runtime state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuStat {
    pub total: f64,
    pub used: f64,
    pub used_percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStat {
    /// Megabytes.
    pub total: f64,
    pub used: f64,
    pub free: f64,
    pub used_percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskStat {
    /// Megabytes.
    pub total: f64,
    pub used: f64,
    pub free: f64,
    pub limit: f64,
    pub used_percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceStat {
    pub cpu_stat: Option<CpuStat>,
    pub mem_stat: Option<MemoryStat>,
    pub disk_stat: Option<DiskStat>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub image_id: String,
    pub command: String,
    pub state: String,
    pub created: i64,
    pub started: i64,
    pub resource_stat: Option<ResourceStat>,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeContainer {
    pub node_id: i64,
    pub node_address: String,
    pub info: ContainerInfo,
}

/// Node scoped group of container ids used by every batch operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerIdList {
    pub node_id: i64,
    pub container_ids: Vec<String>,
    /// Images produced by backups of these containers; the agent must keep them.
    pub backup_image_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerFailInfo {
    pub node_id: i64,
    pub node_info: String,
    pub container_id: String,
    pub fail_reason: String,
    /// Taxonomy code of the failure, 0 when unknown.
    pub fail_code: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSample {
    pub timestamp: i64,
    pub value: f64,
}

// ---------------------------------------------------------------------------
// Templates and backups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerTemplate {
    pub id: i64,
    pub node_id: i64,
    pub conf: ContainerConfigs,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    #[default]
    Pending,
    Succeeded,
    Failed,
}

impl BackupStatus {
    pub fn as_i16(self) -> i16 {
        match self {
            BackupStatus::Pending => 0,
            BackupStatus::Succeeded => 1,
            BackupStatus::Failed => 2,
        }
    }

    /// Anything that is not a known terminal code counts as still pending.
    pub fn from_i16(v: i16) -> Self {
        match v {
            1 => BackupStatus::Succeeded,
            2 => BackupStatus::Failed,
            _ => BackupStatus::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != BackupStatus::Pending
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerBackup {
    pub id: i64,
    pub node_id: i64,
    pub uuid: String,
    pub backup_name: String,
    pub backup_desc: String,
    pub image_ref: String,
    pub image_id: String,
    pub image_size: i64,
    pub status: BackupStatus,
    pub created_at: i64,
}

/// Agent side state of an asynchronous container commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupJob {
    pub id: i64,
    pub container_id: String,
    pub backup_name: String,
    pub image_ref: String,
    pub image_id: String,
    pub image_size: i64,
    pub status: BackupStatus,
    pub updated_at: i64,
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    #[default]
    Unknown,
    Offline,
    Online,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerStat {
    pub running: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeStatus {
    pub node_id: i64,
    pub state: NodeState,
    pub cpu_stat: Option<CpuStat>,
    pub mem_stat: Option<MemoryStat>,
    pub disk_stat: Option<DiskStat>,
    pub container_stat: Option<ContainerStat>,
}

impl NodeStatus {
    pub fn offline(node_id: i64) -> Self {
        Self {
            node_id,
            state: NodeState::Offline,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeResourceLimit {
    /// Fraction of total CPU, 0 disables the check.
    pub cpu_limit: f64,
    /// Megabytes.
    pub memory_limit: f64,
    pub disk_limit: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeInfo {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub comment: String,
    pub unread_warn: i64,
    pub rsc_limit: NodeResourceLimit,
    pub status: Option<NodeStatus>,
}

// ---------------------------------------------------------------------------
// Images and networks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeImage {
    pub id: String,
    /// `repo:tag`
    pub name: String,
    pub size: i64,
    pub created: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[default]
    Wait,
    Reject,
    Pass,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyStatus {
    #[default]
    Fail,
    Abnormal,
    Pass,
}

impl ApprovalStatus {
    pub fn as_i16(self) -> i16 {
        match self {
            ApprovalStatus::Wait => 0,
            ApprovalStatus::Reject => 1,
            ApprovalStatus::Pass => 2,
        }
    }

    pub fn from_i16(v: i16) -> Self {
        match v {
            1 => ApprovalStatus::Reject,
            2 => ApprovalStatus::Pass,
            _ => ApprovalStatus::Wait,
        }
    }
}

impl VerifyStatus {
    pub fn as_i16(self) -> i16 {
        match self {
            VerifyStatus::Fail => 0,
            VerifyStatus::Abnormal => 1,
            VerifyStatus::Pass => 2,
        }
    }

    pub fn from_i16(v: i16) -> Self {
        match v {
            1 => VerifyStatus::Abnormal,
            2 => VerifyStatus::Pass,
            _ => VerifyStatus::Fail,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageInfo {
    pub id: i64,
    pub name: String,
    pub version: String,
    pub description: String,
    pub file_size: i64,
    pub image_id: String,
    pub reject_reason: String,
    pub approval_status: ApprovalStatus,
    pub verify_status: VerifyStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ImageInfo {
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.version)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Subnet {
    pub addr: String,
    pub prefix_len: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeNetwork {
    pub name: String,
    pub subnet: Subnet,
    pub ip_range: Option<Subnet>,
    pub gateway: String,
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventModule {
    Node,
    Container,
    Image,
    Security,
    Logging,
}

impl EventModule {
    pub fn as_i64(self) -> i64 {
        match self {
            EventModule::Node => 1,
            EventModule::Container => 2,
            EventModule::Image => 3,
            EventModule::Security => 4,
            EventModule::Logging => 5,
        }
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            1 => Some(EventModule::Node),
            2 => Some(EventModule::Container),
            3 => Some(EventModule::Image),
            4 => Some(EventModule::Security),
            5 => Some(EventModule::Logging),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnEvent {
    NodeOffline,
    NodeAbnormal,
    ResourceUsage,
    IllegalContainer,
}

impl WarnEvent {
    pub fn as_i64(self) -> i64 {
        match self {
            WarnEvent::NodeOffline => 1,
            WarnEvent::NodeAbnormal => 2,
            WarnEvent::ResourceUsage => 3,
            WarnEvent::IllegalContainer => 4,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarnLog {
    pub id: i64,
    pub node_id: i64,
    pub node_info: String,
    pub event_type: i64,
    pub event_module: i64,
    pub container_id: String,
    pub container_name: String,
    pub detail: String,
    pub have_read: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeLog {
    pub id: i64,
    pub node_id: i64,
    pub node_info: String,
    pub user_id: i64,
    pub event_module: i64,
    pub target: String,
    pub detail: String,
    pub status_code: i64,
    pub error: String,
    pub created_at: i64,
}

/// Paging data returned with every paginated list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageInfo {
    pub page_no: u64,
    pub page_size: u64,
    pub total_pages: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_security_config_serializes_compactly() {
        let json = serde_json::to_string(&SecurityConfig::default()).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn security_config_accepts_partial_json() {
        let cfg: SecurityConfig =
            serde_json::from_str(r#"{"file_protection":{"is_on":true}}"#).unwrap();
        assert_eq!(
            cfg.file_protection,
            Some(FileProtection {
                is_on: true,
                file_list: vec![]
            })
        );
        assert!(cfg.proc_protection.is_none());
    }

    #[test]
    fn backup_status_codes() {
        for s in [BackupStatus::Pending, BackupStatus::Succeeded, BackupStatus::Failed] {
            assert_eq!(BackupStatus::from_i16(s.as_i16()), s);
        }
        assert_eq!(BackupStatus::from_i16(9), BackupStatus::Pending);
    }
}
