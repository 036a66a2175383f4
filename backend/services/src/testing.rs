//! In-memory stand-ins for agents used by the controller tests.

use async_trait::async_trait;
use fleetwarden_shared::rpc::*;
use fleetwarden_shared::{
    BackupJob, BridgeNetwork, ContainerConfigs, ContainerFailInfo, ContainerIdList, ContainerInfo,
    NetworkConfig, NodeImage, NodeState, NodeStatus,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::agent_client::AgentApi;
use crate::agent_pool::AgentConnector;
use crate::error::{ServiceError, ServiceResult};
use crate::registry_client::ImageRegistry;

#[derive(Default)]
pub struct FakeState {
    pub containers: Vec<ContainerInfo>,
    pub configs: HashMap<String, ContainerConfigs>,
    /// Container ids whose batch operations fail with the given error.
    pub failing: HashMap<String, ServiceError>,
    pub create_reply: Option<ServiceResult<CreateContainerReply>>,
    pub created: Vec<CreateContainerRequest>,
    pub updates: Vec<UpdateContainerRequest>,
    pub stopped: Vec<String>,
    pub removed: Vec<ContainerIdList>,
    pub jobs: HashMap<i64, BackupJob>,
    pub added_jobs: Vec<AddBackupJobRequest>,
    pub add_job_error: Option<ServiceError>,
    pub deleted_jobs: Vec<i64>,
    pub removed_backups: Vec<String>,
    pub resumed: Vec<AgentResumeBackupRequest>,
    pub images: Vec<NodeImage>,
    pub syncs: Vec<AgentSyncRequest>,
    pub file_updates: Vec<UpdateFileProtectionRequest>,
    pub proc_updates: Vec<UpdateProcProtectionRequest>,
    pub loads: Vec<LoadSecurityConfigRequest>,
    pub status: Option<NodeStatus>,
}

#[derive(Default)]
pub struct FakeAgent {
    down: AtomicBool,
    pub state: Mutex<FakeState>,
}

impl FakeAgent {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn with_container(self, id: &str, image: &str, state: &str) -> Self {
        self.put_container(id, image, state);
        self
    }

    pub fn put_container(&self, id: &str, image: &str, state: &str) {
        let mut s = self.state.lock().unwrap();
        s.containers.push(ContainerInfo {
            id: id.into(),
            name: format!("name-{}", id),
            image: image.into(),
            state: state.into(),
            ..Default::default()
        });
        s.configs.insert(
            id.into(),
            ContainerConfigs {
                container_id: id.into(),
                name: format!("name-{}", id),
                image: image.into(),
                status: state.into(),
                ..Default::default()
            },
        );
    }

    pub fn fail_on(&self, id: &str, err: ServiceError) {
        self.state.lock().unwrap().failing.insert(id.into(), err);
    }

    fn check(&self) -> ServiceResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ServiceError::internal("agent unreachable"));
        }
        Ok(())
    }

    fn batch(&self, ids: &ContainerIdList, next_state: Option<&str>) -> ServiceResult<ContainerBatchReply> {
        self.check()?;
        let mut s = self.state.lock().unwrap();
        let mut reply = ContainerBatchReply::default();
        for id in &ids.container_ids {
            if let Some(err) = s.failing.get(id) {
                reply.fail_infos.push(ContainerFailInfo {
                    container_id: id.clone(),
                    fail_reason: err.to_string(),
                    fail_code: err.kind().code(),
                    ..Default::default()
                });
                continue;
            }
            match next_state {
                Some(state) => {
                    for c in s.containers.iter_mut().filter(|c| &c.id == id) {
                        c.state = state.into();
                    }
                }
                None => s.containers.retain(|c| &c.id != id),
            }
            reply.ok_ids.push(id.clone());
        }
        Ok(reply)
    }
}

#[async_trait]
impl AgentApi for FakeAgent {
    async fn list_containers(&self, list_all: bool) -> ServiceResult<Vec<ContainerInfo>> {
        self.check()?;
        let s = self.state.lock().unwrap();
        Ok(s.containers
            .iter()
            .filter(|c| list_all || c.is_running())
            .cloned()
            .collect())
    }

    async fn create_container(&self, req: &CreateContainerRequest) -> ServiceResult<CreateContainerReply> {
        self.check()?;
        let mut s = self.state.lock().unwrap();
        s.created.push(req.clone());
        if let Some(reply) = s.create_reply.clone() {
            return reply;
        }
        let id = format!("c{}", s.created.len());
        s.containers.push(ContainerInfo {
            id: id.clone(),
            name: req.configs.name.clone(),
            image: req.configs.image.clone(),
            state: "created".into(),
            ..Default::default()
        });
        let mut conf = req.configs.clone();
        conf.container_id = id.clone();
        s.configs.insert(id.clone(), conf);
        Ok(CreateContainerReply {
            container_id: id,
            error: None,
        })
    }

    async fn start_containers(&self, ids: &ContainerIdList) -> ServiceResult<ContainerBatchReply> {
        self.batch(ids, Some("running"))
    }

    async fn stop_containers(&self, ids: &ContainerIdList) -> ServiceResult<ContainerBatchReply> {
        let reply = self.batch(ids, Some("exited"))?;
        self.state
            .lock()
            .unwrap()
            .stopped
            .extend(reply.ok_ids.iter().cloned());
        Ok(reply)
    }

    async fn kill_containers(&self, ids: &ContainerIdList) -> ServiceResult<ContainerBatchReply> {
        self.batch(ids, Some("exited"))
    }

    async fn restart_containers(&self, ids: &ContainerIdList) -> ServiceResult<ContainerBatchReply> {
        self.batch(ids, Some("running"))
    }

    async fn remove_containers(&self, ids: &ContainerIdList) -> ServiceResult<ContainerBatchReply> {
        self.state.lock().unwrap().removed.push(ids.clone());
        self.batch(ids, None)
    }

    async fn inspect_container(&self, container_id: &str) -> ServiceResult<ContainerConfigs> {
        self.check()?;
        self.state
            .lock()
            .unwrap()
            .configs
            .get(container_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(container_id.into()))
    }

    async fn update_container(&self, req: &UpdateContainerRequest) -> ServiceResult<()> {
        self.check()?;
        self.state.lock().unwrap().updates.push(req.clone());
        Ok(())
    }

    async fn monitor_history(&self, _req: &MonitorHistoryRequest) -> ServiceResult<MonitorHistoryReply> {
        self.check()?;
        Ok(MonitorHistoryReply::default())
    }

    async fn add_backup_job(&self, req: &AddBackupJobRequest) -> ServiceResult<()> {
        self.check()?;
        let mut s = self.state.lock().unwrap();
        if let Some(err) = s.add_job_error.clone() {
            return Err(err);
        }
        s.added_jobs.push(req.clone());
        s.jobs.insert(
            req.id,
            BackupJob {
                id: req.id,
                container_id: req.container_id.clone(),
                backup_name: req.backup_name.clone(),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn get_backup_job(&self, id: i64) -> ServiceResult<BackupJob> {
        self.check()?;
        self.state
            .lock()
            .unwrap()
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("backup job {}", id)))
    }

    async fn del_backup_job(&self, id: i64) -> ServiceResult<()> {
        self.check()?;
        let mut s = self.state.lock().unwrap();
        s.jobs.remove(&id);
        s.deleted_jobs.push(id);
        Ok(())
    }

    async fn remove_backup(&self, image_ref: &str) -> ServiceResult<()> {
        self.check()?;
        self.state
            .lock()
            .unwrap()
            .removed_backups
            .push(image_ref.into());
        Ok(())
    }

    async fn resume_backup(&self, req: &AgentResumeBackupRequest) -> ServiceResult<String> {
        self.check()?;
        let mut s = self.state.lock().unwrap();
        s.resumed.push(req.clone());
        Ok(format!("{}-resumed", req.container_id))
    }

    async fn node_status(&self, _timeout: Duration) -> ServiceResult<NodeStatus> {
        self.check()?;
        let s = self.state.lock().unwrap();
        Ok(s.status.clone().unwrap_or(NodeStatus {
            state: NodeState::Online,
            ..Default::default()
        }))
    }

    async fn list_images(&self) -> ServiceResult<Vec<NodeImage>> {
        self.check()?;
        Ok(self.state.lock().unwrap().images.clone())
    }

    async fn sync_images(&self, req: &AgentSyncRequest) -> ServiceResult<()> {
        self.check()?;
        self.state.lock().unwrap().syncs.push(req.clone());
        Ok(())
    }

    async fn list_networks(&self) -> ServiceResult<Vec<BridgeNetwork>> {
        self.check()?;
        Ok(Vec::new())
    }

    async fn connect_network(&self, _network: &NetworkConfig) -> ServiceResult<()> {
        self.check()
    }

    async fn disconnect_network(&self, _interface: &str, _container_id: &str) -> ServiceResult<()> {
        self.check()
    }

    async fn update_file_protection(&self, req: &UpdateFileProtectionRequest) -> ServiceResult<()> {
        self.check()?;
        self.state.lock().unwrap().file_updates.push(req.clone());
        Ok(())
    }

    async fn update_proc_protection(&self, req: &UpdateProcProtectionRequest) -> ServiceResult<()> {
        self.check()?;
        self.state.lock().unwrap().proc_updates.push(req.clone());
        Ok(())
    }

    async fn load_security_config(&self, req: &LoadSecurityConfigRequest) -> ServiceResult<()> {
        self.check()?;
        self.state.lock().unwrap().loads.push(req.clone());
        Ok(())
    }
}

/// Resolves addresses to registered fakes; unknown addresses fail to dial.
#[derive(Default)]
pub struct FakeConnector {
    agents: Mutex<HashMap<String, Arc<FakeAgent>>>,
    pub dials: AtomicUsize,
}

impl FakeConnector {
    pub fn add(&self, address: &str, agent: FakeAgent) -> Arc<FakeAgent> {
        let agent = Arc::new(agent);
        self.agents
            .lock()
            .unwrap()
            .insert(address.into(), Arc::clone(&agent));
        agent
    }
}

#[async_trait]
impl AgentConnector for FakeConnector {
    async fn connect(&self, address: &str) -> ServiceResult<Arc<dyn AgentApi>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let agent = self.agents.lock().unwrap().get(address).cloned();
        match agent {
            Some(agent) => Ok(agent as Arc<dyn AgentApi>),
            None => Err(ServiceError::internal(format!("dial {} failed", address))),
        }
    }
}

/// Registry stand-in holding a fixed set of published references.
#[derive(Default)]
pub struct FakeRegistry {
    pub published: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
}

#[async_trait]
impl ImageRegistry for FakeRegistry {
    async fn has_image(&self, reference: &str) -> ServiceResult<bool> {
        Ok(self.published.lock().unwrap().iter().any(|r| r == reference))
    }

    async fn remove_image(&self, reference: &str) -> ServiceResult<()> {
        self.published.lock().unwrap().retain(|r| r != reference);
        self.removed.lock().unwrap().push(reference.into());
        Ok(())
    }

    fn pull_reference(&self, reference: &str) -> String {
        format!("registry.test/{}", reference)
    }
}
