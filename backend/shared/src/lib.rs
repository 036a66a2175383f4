pub mod error;
pub mod models;
pub mod rpc;

pub use error::{ErrorKind, RpcError};
pub use models::{
    ApprovalStatus, BackupJob, BackupStatus, BridgeNetwork, ContainerBackup, ContainerConfigs,
    ContainerFailInfo, ContainerIdList, ContainerInfo, ContainerStat, ContainerTemplate, CpuStat,
    DiskStat, EventModule, FileProtection, ImageInfo, MemoryStat, MonitorSample, Mount,
    NetworkConfig, NetworkRule, NetworkRuleList, NodeContainer, NodeImage, NodeInfo,
    NodeResourceLimit, NodeState, NodeStatus, PageInfo, ProcProtection, ResourceLimit,
    ResourceStat, RestartPolicy, RuntimeLog, SecurityConfig, Subnet, VerifyStatus, WarnEvent,
    WarnLog,
};
