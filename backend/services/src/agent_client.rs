//! Controller side view of a node agent.
//!
//! Every agent operation is a JSON `POST` under `/agent/...`. Failures come
//! back as a non-2xx status carrying an [`RpcError`] body, which is turned
//! back into the matching [`ServiceError`] so taxonomy codes survive the hop.

use async_trait::async_trait;
use fleetwarden_shared::rpc::*;
use fleetwarden_shared::{
    BackupJob, BridgeNetwork, ContainerConfigs, ContainerIdList, ContainerInfo, NetworkConfig,
    NodeImage, NodeStatus, RpcError,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::error::{ServiceError, ServiceResult};

/// Per-call deadlines. There is no retry at this layer.
pub mod timeouts {
    use std::time::Duration;

    pub const CONTAINER_OP: Duration = Duration::from_secs(10);
    pub const NODE_CHECK: Duration = Duration::from_secs(10);
    pub const BACKUP_POLL: Duration = Duration::from_secs(5);
    pub const IMAGE_SYNC: Duration = Duration::from_secs(5);
    pub const NODE_STATUS: Duration = Duration::from_secs(2);
}

/// Agent endpoint paths, shared with the agent's route table.
pub mod paths {
    pub const CONTAINER_LIST: &str = "/agent/container/list";
    pub const CONTAINER_CREATE: &str = "/agent/container/create";
    pub const CONTAINER_START: &str = "/agent/container/start";
    pub const CONTAINER_STOP: &str = "/agent/container/stop";
    pub const CONTAINER_KILL: &str = "/agent/container/kill";
    pub const CONTAINER_RESTART: &str = "/agent/container/restart";
    pub const CONTAINER_REMOVE: &str = "/agent/container/remove";
    pub const CONTAINER_INSPECT: &str = "/agent/container/inspect";
    pub const CONTAINER_UPDATE: &str = "/agent/container/update";
    pub const CONTAINER_MONITOR_HISTORY: &str = "/agent/container/monitor_history";
    pub const BACKUP_JOB_ADD: &str = "/agent/container/backup_job/add";
    pub const BACKUP_JOB_GET: &str = "/agent/container/backup_job/get";
    pub const BACKUP_JOB_DEL: &str = "/agent/container/backup_job/del";
    pub const BACKUP_REMOVE: &str = "/agent/container/backup/remove";
    pub const BACKUP_RESUME: &str = "/agent/container/backup/resume";
    pub const NODE_STATUS: &str = "/agent/node/status";
    pub const IMAGE_LIST: &str = "/agent/image/list";
    pub const IMAGE_SYNC: &str = "/agent/image/sync";
    pub const NETWORK_LIST: &str = "/agent/network/list";
    pub const NETWORK_CONNECT: &str = "/agent/network/connect";
    pub const NETWORK_DISCONNECT: &str = "/agent/network/disconnect";
    pub const SECURITY_FILE_PROTECTION: &str = "/agent/security/file_protection";
    pub const SECURITY_PROC_PROTECTION: &str = "/agent/security/proc_protection";
    pub const SECURITY_LOAD: &str = "/agent/security/load";
}

#[async_trait]
pub trait AgentApi: Send + Sync {
    async fn list_containers(&self, list_all: bool) -> ServiceResult<Vec<ContainerInfo>>;
    async fn create_container(&self, req: &CreateContainerRequest) -> ServiceResult<CreateContainerReply>;
    async fn start_containers(&self, ids: &ContainerIdList) -> ServiceResult<ContainerBatchReply>;
    async fn stop_containers(&self, ids: &ContainerIdList) -> ServiceResult<ContainerBatchReply>;
    async fn kill_containers(&self, ids: &ContainerIdList) -> ServiceResult<ContainerBatchReply>;
    async fn restart_containers(&self, ids: &ContainerIdList) -> ServiceResult<ContainerBatchReply>;
    async fn remove_containers(&self, ids: &ContainerIdList) -> ServiceResult<ContainerBatchReply>;
    async fn inspect_container(&self, container_id: &str) -> ServiceResult<ContainerConfigs>;
    async fn update_container(&self, req: &UpdateContainerRequest) -> ServiceResult<()>;
    async fn monitor_history(&self, req: &MonitorHistoryRequest) -> ServiceResult<MonitorHistoryReply>;

    async fn add_backup_job(&self, req: &AddBackupJobRequest) -> ServiceResult<()>;
    async fn get_backup_job(&self, id: i64) -> ServiceResult<BackupJob>;
    async fn del_backup_job(&self, id: i64) -> ServiceResult<()>;
    async fn remove_backup(&self, image_ref: &str) -> ServiceResult<()>;
    async fn resume_backup(&self, req: &AgentResumeBackupRequest) -> ServiceResult<String>;

    async fn node_status(&self, timeout: Duration) -> ServiceResult<NodeStatus>;

    async fn list_images(&self) -> ServiceResult<Vec<NodeImage>>;
    async fn sync_images(&self, req: &AgentSyncRequest) -> ServiceResult<()>;

    async fn list_networks(&self) -> ServiceResult<Vec<BridgeNetwork>>;
    async fn connect_network(&self, network: &NetworkConfig) -> ServiceResult<()>;
    async fn disconnect_network(&self, interface: &str, container_id: &str) -> ServiceResult<()>;

    async fn update_file_protection(&self, req: &UpdateFileProtectionRequest) -> ServiceResult<()>;
    async fn update_proc_protection(&self, req: &UpdateProcProtectionRequest) -> ServiceResult<()>;
    async fn load_security_config(&self, req: &LoadSecurityConfigRequest) -> ServiceResult<()>;
}

pub struct HttpAgentClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAgentClient {
    pub fn new(client: reqwest::Client, address: &str, port: u16) -> Self {
        Self {
            client,
            base_url: format!("http://{}:{}", address, port),
        }
    }

    async fn call<Req, Resp>(&self, path: &str, body: &Req, timeout: Duration) -> ServiceResult<Resp>
    where
        Req: Serialize + Sync + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                log::warn!("agent call {} failed: {}", url, e);
                if e.is_timeout() {
                    ServiceError::internal(format!("agent {} timed out", self.base_url))
                } else {
                    ServiceError::internal(format!("agent {} unreachable", self.base_url))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return response.json::<Resp>().await.map_err(|e| {
                ServiceError::internal(format!("decode reply from {}: {}", url, e))
            });
        }

        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<RpcError>(&text) {
            Ok(rpc) => Err(rpc.into()),
            Err(_) => Err(ServiceError::internal(format!(
                "agent {} returned {}: {}",
                url, status, text
            ))),
        }
    }
}

#[async_trait]
impl AgentApi for HttpAgentClient {
    async fn list_containers(&self, list_all: bool) -> ServiceResult<Vec<ContainerInfo>> {
        let req = ListContainersRequest { node_ids: None, list_all };
        let reply: ListContainersReply = self.call(paths::CONTAINER_LIST, &req, timeouts::CONTAINER_OP).await?;
        Ok(reply.containers.into_iter().map(|c| c.info).collect())
    }

    async fn create_container(&self, req: &CreateContainerRequest) -> ServiceResult<CreateContainerReply> {
        self.call(paths::CONTAINER_CREATE, req, timeouts::CONTAINER_OP).await
    }

    async fn start_containers(&self, ids: &ContainerIdList) -> ServiceResult<ContainerBatchReply> {
        self.call(paths::CONTAINER_START, ids, timeouts::CONTAINER_OP).await
    }

    async fn stop_containers(&self, ids: &ContainerIdList) -> ServiceResult<ContainerBatchReply> {
        self.call(paths::CONTAINER_STOP, ids, timeouts::CONTAINER_OP).await
    }

    async fn kill_containers(&self, ids: &ContainerIdList) -> ServiceResult<ContainerBatchReply> {
        self.call(paths::CONTAINER_KILL, ids, timeouts::CONTAINER_OP).await
    }

    async fn restart_containers(&self, ids: &ContainerIdList) -> ServiceResult<ContainerBatchReply> {
        self.call(paths::CONTAINER_RESTART, ids, timeouts::CONTAINER_OP).await
    }

    async fn remove_containers(&self, ids: &ContainerIdList) -> ServiceResult<ContainerBatchReply> {
        self.call(paths::CONTAINER_REMOVE, ids, timeouts::CONTAINER_OP).await
    }

    async fn inspect_container(&self, container_id: &str) -> ServiceResult<ContainerConfigs> {
        let req = InspectContainerRequest {
            node_id: 0,
            container_id: container_id.to_owned(),
        };
        let reply: InspectContainerReply = self.call(paths::CONTAINER_INSPECT, &req, timeouts::CONTAINER_OP).await?;
        Ok(reply.configs)
    }

    async fn update_container(&self, req: &UpdateContainerRequest) -> ServiceResult<()> {
        let _: Empty = self.call(paths::CONTAINER_UPDATE, req, timeouts::CONTAINER_OP).await?;
        Ok(())
    }

    async fn monitor_history(&self, req: &MonitorHistoryRequest) -> ServiceResult<MonitorHistoryReply> {
        self.call(paths::CONTAINER_MONITOR_HISTORY, req, timeouts::CONTAINER_OP).await
    }

    async fn add_backup_job(&self, req: &AddBackupJobRequest) -> ServiceResult<()> {
        let _: Empty = self.call(paths::BACKUP_JOB_ADD, req, timeouts::CONTAINER_OP).await?;
        Ok(())
    }

    async fn get_backup_job(&self, id: i64) -> ServiceResult<BackupJob> {
        self.call(paths::BACKUP_JOB_GET, &IdRequest { id }, timeouts::BACKUP_POLL).await
    }

    async fn del_backup_job(&self, id: i64) -> ServiceResult<()> {
        let _: Empty = self.call(paths::BACKUP_JOB_DEL, &IdRequest { id }, timeouts::BACKUP_POLL).await?;
        Ok(())
    }

    async fn remove_backup(&self, image_ref: &str) -> ServiceResult<()> {
        let req = AgentRemoveBackupRequest {
            image_ref: image_ref.to_owned(),
        };
        let _: Empty = self.call(paths::BACKUP_REMOVE, &req, timeouts::CONTAINER_OP).await?;
        Ok(())
    }

    async fn resume_backup(&self, req: &AgentResumeBackupRequest) -> ServiceResult<String> {
        let reply: ResumeBackupReply = self.call(paths::BACKUP_RESUME, req, timeouts::CONTAINER_OP).await?;
        Ok(reply.container_id)
    }

    async fn node_status(&self, timeout: Duration) -> ServiceResult<NodeStatus> {
        self.call(paths::NODE_STATUS, &Empty {}, timeout).await
    }

    async fn list_images(&self) -> ServiceResult<Vec<NodeImage>> {
        let reply: NodeImagesReply = self.call(paths::IMAGE_LIST, &Empty {}, timeouts::IMAGE_SYNC).await?;
        Ok(reply.images)
    }

    async fn sync_images(&self, req: &AgentSyncRequest) -> ServiceResult<()> {
        let _: Empty = self.call(paths::IMAGE_SYNC, req, timeouts::IMAGE_SYNC).await?;
        Ok(())
    }

    async fn list_networks(&self) -> ServiceResult<Vec<BridgeNetwork>> {
        let reply: ListNetworksReply = self.call(paths::NETWORK_LIST, &Empty {}, timeouts::CONTAINER_OP).await?;
        Ok(reply.bridges)
    }

    async fn connect_network(&self, network: &NetworkConfig) -> ServiceResult<()> {
        let _: Empty = self.call(paths::NETWORK_CONNECT, network, timeouts::CONTAINER_OP).await?;
        Ok(())
    }

    async fn disconnect_network(&self, interface: &str, container_id: &str) -> ServiceResult<()> {
        let req = DisconnectNetworkRequest {
            node_id: 0,
            interface: interface.to_owned(),
            container_id: container_id.to_owned(),
        };
        let _: Empty = self.call(paths::NETWORK_DISCONNECT, &req, timeouts::CONTAINER_OP).await?;
        Ok(())
    }

    async fn update_file_protection(&self, req: &UpdateFileProtectionRequest) -> ServiceResult<()> {
        let _: Empty = self.call(paths::SECURITY_FILE_PROTECTION, req, timeouts::CONTAINER_OP).await?;
        Ok(())
    }

    async fn update_proc_protection(&self, req: &UpdateProcProtectionRequest) -> ServiceResult<()> {
        let _: Empty = self.call(paths::SECURITY_PROC_PROTECTION, req, timeouts::CONTAINER_OP).await?;
        Ok(())
    }

    async fn load_security_config(&self, req: &LoadSecurityConfigRequest) -> ServiceResult<()> {
        let _: Empty = self.call(paths::SECURITY_LOAD, req, timeouts::CONTAINER_OP).await?;
        Ok(())
    }
}
