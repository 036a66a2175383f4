//! The agent's container runtime driver. Implements [`AgentApi`] in process,
//! so the agent's HTTP handlers and the controller's client share one
//! contract.

use async_trait::async_trait;
use fleetwarden_shared::rpc::*;
use fleetwarden_shared::{
    BackupJob, BackupStatus, BridgeNetwork, ContainerConfigs, ContainerFailInfo, ContainerIdList,
    ContainerInfo, CpuStat, DiskStat, MemoryStat, Mount, NetworkConfig, NodeImage, NodeStatus,
    ProcProtection, ResourceLimit, ResourceStat, RestartPolicy,
};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::backup_jobs::{BackupJobStore, backup_reference};
use super::engine::*;
use super::graphic;
use super::metrics::{HOST_SERIES, MetricsSource, validate_window};
use super::network::{bridge_networks, resolve_networks};
use super::node_status::{CpuUsage, host_cpus, memory_stat, node_status};
use super::resources::{MEGABYTE, engine_resources, parse_megabytes, resource_limit, storage_size};
use super::security::{Enforcer, UUID_ENV};
use crate::agent_client::AgentApi;
use crate::database::unix_now;
use crate::error::{ServiceError, ServiceResult};
use crate::registry_client::ImageRegistry;
use crate::validation::is_valid_container_name;

pub const LABEL_DESC: &str = "FW_DESC";
pub const LABEL_UUID: &str = "FW_UUID";
pub const LABEL_GRAPHIC: &str = "FW_GRAPHIC";
pub const LABEL_DISK_LIMIT: &str = "FW_DISK_LIMIT";

/// Grace period, in seconds, for bulk stop and restart.
const BULK_TIMEOUT: i64 = 1;

pub struct AgentRuntime {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<dyn ImageRegistry>,
    enforcer: Arc<Enforcer>,
    jobs: Arc<BackupJobStore>,
    metrics: Arc<dyn MetricsSource>,
    cpu: Arc<CpuUsage>,
    graphic_basedir: PathBuf,
    security_loaded: Mutex<bool>,
}

/// A create whose container could not be cleaned up after a late failure.
struct Leftover {
    container_id: String,
    error: ServiceError,
}

impl From<ServiceError> for Leftover {
    fn from(error: ServiceError) -> Self {
        Self {
            container_id: String::new(),
            error,
        }
    }
}

fn fail_info(container_id: &str, err: &ServiceError) -> ContainerFailInfo {
    ContainerFailInfo {
        container_id: container_id.to_owned(),
        fail_reason: err.to_string(),
        fail_code: err.kind().code(),
        ..Default::default()
    }
}

fn check_batch(ids: &ContainerIdList) -> ServiceResult<()> {
    if ids.container_ids.is_empty() {
        return Err(ServiceError::invalid("no container ids"));
    }
    if !ids.backup_image_ids.is_empty() {
        log::debug!("keeping backup images {:?}", ids.backup_image_ids);
    }
    Ok(())
}

fn endpoint(network: &NetworkConfig) -> EngineEndpoint {
    EngineEndpoint {
        network: network.interface.clone(),
        ipam_address: network.ip_address.clone(),
        ip_address: network.ip_address.clone(),
        ip_prefix_len: network.ip_prefix_len,
        mac_address: network.mac_address.clone(),
        gateway: network.gateway.clone(),
    }
}

fn restart_policy(policy: &RestartPolicy) -> EngineRestartPolicy {
    EngineRestartPolicy {
        name: policy.name.clone(),
        max_retry: policy.max_retry,
    }
}

/// Maps an engine inspect back into a container config. For a backup the
/// address the user asked for wins over the one the engine assigned.
pub fn configs_from_inspect(info: &EngineInspect, for_backup: bool) -> ContainerConfigs {
    let label = |key: &str| info.labels.get(key).cloned().unwrap_or_default();

    let envs: BTreeMap<String, String> = info
        .env
        .iter()
        .filter_map(|e| e.split_once('='))
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();

    let networks = info
        .networks
        .iter()
        .filter(|n| n.network != "bridge")
        .map(|n| {
            let ip_address = if !for_backup && !n.ip_address.is_empty() {
                n.ip_address.clone()
            } else {
                n.ipam_address.clone()
            };
            NetworkConfig {
                interface: n.network.clone(),
                container_id: info.id.clone(),
                ip_address,
                ip_prefix_len: n.ip_prefix_len,
                mac_address: n.mac_address.clone(),
                gateway: n.gateway.clone(),
            }
        })
        .collect();

    ContainerConfigs {
        container_id: info.id.clone(),
        name: info.name.clone(),
        image: info.image.clone(),
        status: info.status.clone(),
        desc: label(LABEL_DESC),
        uuid: label(LABEL_UUID),
        envs,
        mounts: info
            .mounts
            .iter()
            .map(|m| Mount {
                kind: m.kind.clone(),
                source: m.source.clone(),
                target: m.target.clone(),
                read_only: m.read_only,
            })
            .collect(),
        networks,
        resource_limit: Some(
            info.resources
                .as_ref()
                .map(|r| resource_limit(r, &info.storage_opt))
                .unwrap_or_default(),
        ),
        restart_policy: info.restart.as_ref().map(|p| RestartPolicy {
            name: p.name.clone(),
            max_retry: p.max_retry,
        }),
        enable_graphic: label(LABEL_GRAPHIC) == "1",
        security_config: None,
    }
}

impl AgentRuntime {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<dyn ImageRegistry>,
        enforcer: Arc<Enforcer>,
        jobs: Arc<BackupJobStore>,
        metrics: Arc<dyn MetricsSource>,
        graphic_basedir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine,
            registry,
            enforcer,
            jobs,
            metrics,
            cpu: Arc::new(CpuUsage::new()),
            graphic_basedir: graphic_basedir.into(),
            security_loaded: Mutex::new(false),
        }
    }

    /// Sampler loop keeping the host CPU usage fresh.
    pub fn cpu_sampler(&self) -> Arc<CpuUsage> {
        self.cpu.clone()
    }

    /// Makes `reference` available locally: already present, or published
    /// in the registry and pulled from there. Nothing is ever built.
    pub async fn ensure_image(&self, reference: &str) -> ServiceResult<()> {
        ensure_image_with(self.engine.as_ref(), self.registry.as_ref(), reference).await
    }

    async fn inspect(&self, id: &str, for_backup: bool) -> ServiceResult<ContainerConfigs> {
        let info = self.engine.inspect_container(id).await?;
        Ok(configs_from_inspect(&info, for_backup))
    }

    async fn create(&self, mut configs: ContainerConfigs) -> Result<String, Leftover> {
        if configs.image.is_empty() {
            return Err(ServiceError::invalid("image is required").into());
        } else if !is_valid_container_name(&configs.name) {
            return Err(ServiceError::invalid(format!("container name {}", configs.name)).into());
        }

        self.ensure_image(&configs.image).await?;

        let mut env: Vec<String> = configs
            .envs
            .iter()
            .filter(|(k, _)| k.as_str() != UUID_ENV)
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.push(format!("{}={}", UUID_ENV, configs.uuid));

        let mut labels = HashMap::from([
            (LABEL_DESC.to_string(), configs.desc.clone()),
            (LABEL_UUID.to_string(), configs.uuid.clone()),
        ]);

        let mut mounts: Vec<EngineMount> = configs
            .mounts
            .iter()
            .map(|m| EngineMount {
                kind: m.kind.clone(),
                source: m.source.clone(),
                target: m.target.clone(),
                read_only: m.read_only,
            })
            .collect();

        if configs.enable_graphic {
            graphic::setup(&self.graphic_basedir, &configs.name, &mut env, &mut mounts)
                .await
                .map_err(|e| {
                    log::info!("graphic setup for {}: {:#}", configs.name, e);
                    ServiceError::from(e)
                })?;
            labels.insert(LABEL_GRAPHIC.to_string(), "1".to_string());
        }

        let mut spec = EngineSpec {
            name: configs.name.clone(),
            image: configs.image.clone(),
            env,
            labels,
            mounts,
            restart: configs.restart_policy.as_ref().map(restart_policy),
            tty: true,
            open_stdin: true,
            privileged: false,
            ..Default::default()
        };

        if let Some(limit) = &configs.resource_limit {
            spec.resources = Some(engine_resources(limit, host_cpus()));
            if limit.disk_limit > 0.0 {
                spec.labels
                    .insert(LABEL_DISK_LIMIT.to_string(), format!("{:.6}", limit.disk_limit));
                spec.storage_opt
                    .insert("size".to_string(), storage_size(limit.disk_limit));
            }
        }

        resolve_networks(self.engine.as_ref(), "", &mut configs.networks).await?;
        spec.network = configs.networks.first().map(endpoint);

        let id = self.engine.create_container(&spec).await?;

        for network in configs.networks.iter().skip(1) {
            if let Err(e) = self.engine.connect_network(&id, &endpoint(network)).await {
                log::warn!("connect {} to {}: {}", id, network.interface, e);
            }
        }

        let applied = match &configs.security_config {
            Some(sec) => {
                self.enforcer
                    .apply(&id, &configs.uuid, &configs.name, 0, false, sec)
                    .await
            }
            None => Ok(()),
        };
        if let Err(error) = applied {
            log::warn!("apply security config to {}: {}", id, error);
            if let Err(e) = self.remove(&id, true).await {
                log::warn!("remove {} after security failure: {}", id, e);
                return Err(Leftover {
                    container_id: id,
                    error,
                });
            }
            return Err(error.into());
        }

        log::info!("container {} ({}) created", configs.name, id);
        Ok(id)
    }

    async fn remove(&self, id: &str, force: bool) -> ServiceResult<()> {
        let info = self.engine.inspect_container(id).await?;
        if !force && info.running {
            return Err(ServiceError::RemoveContainerWhenRunning);
        }
        self.engine.remove_container(id, force).await?;

        self.enforcer.cleanup(id, &info.name).await;
        if let Err(e) = graphic::remove(&self.graphic_basedir, &info.name).await {
            log::warn!("remove graphic dirs of {}: {:#}", info.name, e);
        }
        Ok(())
    }

    async fn start_one(&self, id: &str) -> ServiceResult<()> {
        self.engine.start_container(id).await?;
        // Rule files outlive the namespace they were loaded into.
        match self.engine.inspect_container(id).await {
            Ok(info) => {
                if let Err(e) = self.enforcer.restore_network_rules(id, &info.name, info.pid).await {
                    log::warn!("restore network rules of {}: {:#}", id, e);
                }
            }
            Err(e) => log::warn!("inspect {} after start: {}", id, e),
        }
        Ok(())
    }

    async fn container_info(&self, c: EngineContainer) -> ContainerInfo {
        let mut info = ContainerInfo {
            id: c.id,
            name: c.name,
            image: c.image,
            image_id: c.image_id,
            command: c.command,
            state: c.state,
            created: c.created,
            ..Default::default()
        };

        if info.state != "created" {
            match self.engine.inspect_container(&info.id).await {
                Ok(detail) => info.started = detail.started_at,
                Err(e) => log::warn!("inspect {}: {}", info.id, e),
            }
        }

        let mut stat = ResourceStat {
            disk_stat: Some(DiskStat {
                used: c.size_root_fs as f64 / 1e6,
                limit: c
                    .labels
                    .get(LABEL_DISK_LIMIT)
                    .and_then(|v| parse_megabytes(v))
                    .unwrap_or(0.0),
                ..Default::default()
            }),
            ..Default::default()
        };

        if info.is_running() {
            stat.cpu_stat = Some(CpuStat::default());
            stat.mem_stat = Some(MemoryStat::default());
            match self.engine.container_stats(&info.id).await {
                Ok(s) => {
                    stat.cpu_stat = Some(CpuStat {
                        total: s.online_cpus,
                        used: s.cpu_cores,
                        used_percentage: if s.online_cpus > 0.0 {
                            s.cpu_cores / s.online_cpus * 100.0
                        } else {
                            0.0
                        },
                    });
                    let used = s.memory_usage as f64;
                    let total = s.memory_limit as f64;
                    stat.mem_stat = Some(MemoryStat {
                        total: total / MEGABYTE,
                        used: used / MEGABYTE,
                        free: (total - used).max(0.0) / MEGABYTE,
                        used_percentage: if total > 0.0 { used / total * 100.0 } else { 0.0 },
                    });
                }
                Err(e) => log::warn!("stats of {}: {}", info.id, e),
            }
        }

        info.resource_stat = Some(stat);
        info
    }

    async fn reconcile_networks(&self, id: &str, current: &[EngineEndpoint], requested: &[NetworkConfig]) -> ServiceResult<()> {
        for existing in current {
            if super::network::is_builtin(&existing.network) {
                continue;
            }
            if !requested.iter().any(|n| n.interface == existing.network) {
                if let Err(e) = self.engine.disconnect_network(id, &existing.network).await {
                    log::warn!("disconnect {} from {}: {}", id, existing.network, e);
                }
            }
        }

        for network in requested {
            if let Some(existing) = current.iter().find(|e| e.network == network.interface) {
                if existing.ip_address == network.ip_address {
                    continue;
                }
                if let Err(e) = self.engine.disconnect_network(id, &network.interface).await {
                    log::warn!("disconnect {} from {}: {}", id, network.interface, e);
                }
            }
            self.engine
                .connect_network(id, &endpoint(network))
                .await
                .map_err(|e| {
                    log::warn!("connect {} to {}: {}", id, network.interface, e);
                    e
                })?;
        }
        Ok(())
    }

    async fn container_uuid(&self, id: &str) -> ServiceResult<String> {
        let info = self.engine.inspect_container(id).await?;
        Ok(info.labels.get(LABEL_UUID).cloned().unwrap_or_default())
    }
}

/// Commits the container and records the outcome in the job store.
async fn run_backup_job(engine: Arc<dyn ContainerEngine>, jobs: Arc<BackupJobStore>, mut job: BackupJob) {
    let result = async {
        let info = engine.inspect_container(&job.container_id).await?;
        job.image_ref = backup_reference(&info.image, &job.backup_name);
        let image_id = engine.commit_container(&job.container_id, &job.image_ref).await?;
        job.image_id = image_id.trim_start_matches("sha256:").to_owned();
        match engine.inspect_image(&image_id).await {
            Ok(image) => job.image_size = image.size,
            Err(e) => log::warn!("inspect backup image {}: {}", image_id, e),
        }
        Ok::<(), ServiceError>(())
    }
    .await;

    job.status = match result {
        Ok(()) => {
            log::info!("backup job {} finished as {}", job.id, job.image_ref);
            BackupStatus::Succeeded
        }
        Err(e) => {
            log::warn!("backup job {} of {} failed: {}", job.id, job.container_id, e);
            BackupStatus::Failed
        }
    };
    if let Err(e) = jobs.update(job).await {
        log::warn!("store backup job outcome: {}", e);
    }
}

#[async_trait]
impl AgentApi for AgentRuntime {
    async fn list_containers(&self, list_all: bool) -> ServiceResult<Vec<ContainerInfo>> {
        let containers = self.engine.list_containers(list_all).await?;
        Ok(join_all(containers.into_iter().map(|c| self.container_info(c))).await)
    }

    async fn create_container(&self, req: &CreateContainerRequest) -> ServiceResult<CreateContainerReply> {
        match self.create(req.configs.clone()).await {
            Ok(container_id) => Ok(CreateContainerReply {
                container_id,
                error: None,
            }),
            Err(Leftover { container_id, error }) if container_id.is_empty() => Err(error),
            Err(Leftover { container_id, error }) => Ok(CreateContainerReply {
                container_id,
                error: Some(error.to_rpc()),
            }),
        }
    }

    async fn start_containers(&self, ids: &ContainerIdList) -> ServiceResult<ContainerBatchReply> {
        check_batch(ids)?;
        let mut reply = ContainerBatchReply::default();
        for id in &ids.container_ids {
            match self.start_one(id).await {
                Ok(()) => reply.ok_ids.push(id.clone()),
                Err(e) => {
                    log::warn!("start {}: {}", id, e);
                    reply.fail_infos.push(fail_info(id, &e));
                }
            }
        }
        Ok(reply)
    }

    async fn stop_containers(&self, ids: &ContainerIdList) -> ServiceResult<ContainerBatchReply> {
        check_batch(ids)?;
        let results = join_all(
            ids.container_ids
                .iter()
                .map(|id| self.engine.stop_container(id, BULK_TIMEOUT)),
        )
        .await;
        Ok(collect_batch(&ids.container_ids, results, "stop"))
    }

    async fn kill_containers(&self, ids: &ContainerIdList) -> ServiceResult<ContainerBatchReply> {
        check_batch(ids)?;
        let mut reply = ContainerBatchReply::default();
        for id in &ids.container_ids {
            match self.engine.kill_container(id).await {
                Ok(()) => reply.ok_ids.push(id.clone()),
                Err(e) => {
                    log::warn!("kill {}: {}", id, e);
                    reply.fail_infos.push(fail_info(id, &e));
                }
            }
        }
        Ok(reply)
    }

    async fn restart_containers(&self, ids: &ContainerIdList) -> ServiceResult<ContainerBatchReply> {
        check_batch(ids)?;
        let results = join_all(
            ids.container_ids
                .iter()
                .map(|id| self.engine.restart_container(id, BULK_TIMEOUT)),
        )
        .await;
        Ok(collect_batch(&ids.container_ids, results, "restart"))
    }

    async fn remove_containers(&self, ids: &ContainerIdList) -> ServiceResult<ContainerBatchReply> {
        check_batch(ids)?;
        let mut reply = ContainerBatchReply::default();
        for id in &ids.container_ids {
            match self.remove(id, false).await {
                Ok(()) => reply.ok_ids.push(id.clone()),
                Err(e) => {
                    log::warn!("remove {}: {}", id, e);
                    reply.fail_infos.push(fail_info(id, &e));
                }
            }
        }
        Ok(reply)
    }

    async fn inspect_container(&self, container_id: &str) -> ServiceResult<ContainerConfigs> {
        self.inspect(container_id, false).await
    }

    async fn update_container(&self, req: &UpdateContainerRequest) -> ServiceResult<()> {
        if req.container_id.is_empty() || req.is_empty() {
            return Err(ServiceError::invalid("nothing to update"));
        }

        let mut networks = req.networks.clone();
        if let Some(networks) = networks.as_mut() {
            resolve_networks(self.engine.as_ref(), &req.container_id, networks).await?;
        }

        let current = self.engine.inspect_container(&req.container_id).await?;

        if req.resource_limit.is_some() || req.restart_policy.is_some() {
            let resources = req
                .resource_limit
                .as_ref()
                .map(|l| engine_resources(l, host_cpus()));
            let restart = req.restart_policy.as_ref().map(restart_policy);
            self.engine
                .update_container(&req.container_id, resources.as_ref(), restart.as_ref())
                .await?;
        }

        if let Some(networks) = &networks {
            self.reconcile_networks(&req.container_id, &current.networks, networks)
                .await?;
        }

        if let Some(sec) = &req.security_config {
            let uuid = current.labels.get(LABEL_UUID).cloned().unwrap_or_default();
            self.enforcer
                .apply(&req.container_id, &uuid, &current.name, current.pid, true, sec)
                .await?;
        }
        Ok(())
    }

    async fn monitor_history(&self, req: &MonitorHistoryRequest) -> ServiceResult<MonitorHistoryReply> {
        validate_window(req.start_time, req.end_time, req.interval, unix_now())?;

        let mut limit = ResourceLimit {
            cpu_limit: host_cpus() as f64,
            memory_limit: memory_stat().total,
            ..Default::default()
        };
        let mut series = HOST_SERIES.to_string();

        if !req.container_id.is_empty() {
            let info = self.engine.inspect_container(&req.container_id).await?;
            series = info.name.clone();
            if let Some(r) = &info.resources {
                if r.nano_cpus > 0 {
                    limit.cpu_limit = r.nano_cpus as f64 / 1e9;
                }
                if r.memory > 0 {
                    limit.memory_limit = r.memory as f64 / MEGABYTE;
                }
                if r.memory_reservation > 0 {
                    limit.memory_soft_limit = r.memory_reservation as f64 / MEGABYTE;
                }
            }
        }

        let mut reply = self
            .metrics
            .history(req.start_time, req.end_time, req.interval, &series)
            .await?;
        reply.rsc_limit = limit;
        Ok(reply)
    }

    async fn add_backup_job(&self, req: &AddBackupJobRequest) -> ServiceResult<()> {
        if req.id <= 0 || req.container_id.is_empty() || req.backup_name.is_empty() {
            return Err(ServiceError::invalid("backup job id, container and name are required"));
        }
        let job = self.jobs.add(req.id, &req.container_id, &req.backup_name).await?;
        tokio::spawn(run_backup_job(self.engine.clone(), self.jobs.clone(), job));
        Ok(())
    }

    async fn get_backup_job(&self, id: i64) -> ServiceResult<BackupJob> {
        if id <= 0 {
            return Err(ServiceError::invalid("backup job id"));
        }
        self.jobs.get(id).await
    }

    async fn del_backup_job(&self, id: i64) -> ServiceResult<()> {
        if id <= 0 {
            return Err(ServiceError::invalid("backup job id"));
        }
        self.jobs.del(id).await
    }

    async fn remove_backup(&self, image_ref: &str) -> ServiceResult<()> {
        if image_ref.is_empty() {
            return Err(ServiceError::invalid("backup image reference"));
        }
        self.engine.remove_image(image_ref).await.map_err(|e| {
            log::warn!("remove backup image {}: {}", image_ref, e);
            e
        })
    }

    async fn resume_backup(&self, req: &AgentResumeBackupRequest) -> ServiceResult<String> {
        if req.container_id.is_empty() || req.image_ref.is_empty() {
            return Err(ServiceError::invalid("container id and image are required"));
        }
        let mut configs = self.inspect(&req.container_id, true).await?;
        self.remove(&req.container_id, true).await?;

        configs.image = req.image_ref.clone();
        configs.security_config = req.security_config.clone();
        match self.create(configs).await {
            Ok(id) => Ok(id),
            Err(Leftover { container_id, error }) => {
                log::warn!("resume {} from {}: {}", req.container_id, req.image_ref, error);
                if !container_id.is_empty() {
                    log::warn!("container {} left behind", container_id);
                }
                Err(error)
            }
        }
    }

    async fn node_status(&self, _timeout: Duration) -> ServiceResult<NodeStatus> {
        Ok(node_status(self.engine.as_ref(), &self.cpu).await)
    }

    async fn list_images(&self) -> ServiceResult<Vec<NodeImage>> {
        let images = self.engine.list_images().await?;
        Ok(images
            .into_iter()
            .flat_map(|i| {
                let (id, size, created) = (i.id, i.size, i.created);
                i.repo_tags
                    .into_iter()
                    .filter(|t| t != "<none>:<none>")
                    .map(move |name| NodeImage {
                        id: id.clone(),
                        name,
                        size,
                        created,
                    })
            })
            .collect())
    }

    async fn sync_images(&self, req: &AgentSyncRequest) -> ServiceResult<()> {
        if req.to_remove.is_empty() && req.to_pull.is_empty() {
            return Err(ServiceError::invalid("nothing to sync"));
        }
        let engine = self.engine.clone();
        let registry = self.registry.clone();
        let req = req.clone();
        tokio::spawn(async move {
            for image in &req.to_remove {
                if let Err(e) = engine.remove_image(image).await {
                    log::info!("sync: remove image {}: {}", image, e);
                }
            }
            for image in &req.to_pull {
                if let Err(e) = ensure_image_with(engine.as_ref(), registry.as_ref(), image).await {
                    log::info!("sync: pull image {}: {}", image, e);
                }
            }
        });
        Ok(())
    }

    async fn list_networks(&self) -> ServiceResult<Vec<BridgeNetwork>> {
        Ok(bridge_networks(&self.engine.list_networks().await?))
    }

    async fn connect_network(&self, network: &NetworkConfig) -> ServiceResult<()> {
        if network.container_id.is_empty() || network.interface.is_empty() {
            return Err(ServiceError::invalid("container id and network are required"));
        }
        let mut requested = [network.clone()];
        resolve_networks(self.engine.as_ref(), &network.container_id, &mut requested).await?;
        self.engine
            .connect_network(&network.container_id, &endpoint(&requested[0]))
            .await
    }

    async fn disconnect_network(&self, interface: &str, container_id: &str) -> ServiceResult<()> {
        if interface.is_empty() || container_id.is_empty() {
            return Err(ServiceError::invalid("container id and network are required"));
        }
        self.engine.disconnect_network(container_id, interface).await
    }

    async fn update_file_protection(&self, req: &UpdateFileProtectionRequest) -> ServiceResult<()> {
        if req.container_id.is_empty() {
            return Err(ServiceError::invalid("container id is required"));
        }
        self.enforcer
            .update_file_access(&req.container_id, req.is_on, &req.to_append, &req.to_remove)
            .await
            .map_err(|e| {
                log::warn!("update file access {}: {:#}", req.container_id, e);
                ServiceError::ContainerFileProtection(e.to_string())
            })
    }

    async fn update_proc_protection(&self, req: &UpdateProcProtectionRequest) -> ServiceResult<()> {
        if req.node_id <= 0 || req.container_id.is_empty() {
            return Err(ServiceError::invalid("node id and container id are required"));
        }
        let id = &req.container_id;
        match req.protection_type {
            ProcProtectionType::Exec => {
                let result = if req.is_on {
                    self.enforcer
                        .update_whitelist(id, true, &req.to_append, &req.to_remove)
                        .await
                } else {
                    self.enforcer.clean_whitelist(id).await
                };
                result.map_err(|e| {
                    log::warn!("update whitelist {}: {:#}", id, e);
                    ServiceError::ContainerProcProtection(e.to_string())
                })
            }
            ProcProtectionType::Net => {
                if !req.is_on {
                    self.enforcer.remove_opensnitch_rule(id).await;
                    return Ok(());
                }
                let uuid = self.container_uuid(id).await?;
                let rule = ProcProtection {
                    is_on: true,
                    exe_list: req.to_append.clone(),
                };
                self.enforcer
                    .save_opensnitch_rule(id, &uuid, &rule)
                    .await
                    .map_err(|e| {
                        log::warn!("save opensnitch rule {}: {:#}", id, e);
                        ServiceError::ContainerNprocProtection(e.to_string())
                    })
            }
        }
    }

    async fn load_security_config(&self, req: &LoadSecurityConfigRequest) -> ServiceResult<()> {
        let mut loaded = self.security_loaded.lock().await;
        if *loaded {
            return Ok(());
        }
        log::debug!("loading security config for {} containers", req.configs.len());
        for state in &req.configs {
            let id = &state.container_id;
            if let Some(file) = &state.file_protection {
                if let Err(e) = self
                    .enforcer
                    .update_file_access(id, file.is_on, &file.file_list, &[])
                    .await
                {
                    log::warn!("load file access {}: {:#}", id, e);
                }
            }
            if let Some(proc) = &state.proc_protection {
                if let Err(e) = self
                    .enforcer
                    .update_whitelist(id, proc.is_on, &proc.exe_list, &[])
                    .await
                {
                    log::warn!("load whitelist {}: {:#}", id, e);
                }
            }
        }
        *loaded = true;
        Ok(())
    }
}

fn collect_batch(ids: &[String], results: Vec<ServiceResult<()>>, op: &str) -> ContainerBatchReply {
    let mut reply = ContainerBatchReply::default();
    for (id, result) in ids.iter().zip(results) {
        match result {
            Ok(()) => reply.ok_ids.push(id.clone()),
            Err(e) => {
                log::warn!("{} {}: {}", op, id, e);
                reply.fail_infos.push(fail_info(id, &e));
            }
        }
    }
    reply
}

async fn ensure_image_with(
    engine: &dyn ContainerEngine,
    registry: &dyn ImageRegistry,
    reference: &str,
) -> ServiceResult<()> {
    match engine.list_images().await {
        Ok(images) => {
            if images
                .iter()
                .any(|i| i.id == reference || i.repo_tags.iter().any(|t| t == reference))
            {
                return Ok(());
            }
        }
        Err(e) => log::warn!("list images: {}", e),
    }

    if !registry.has_image(reference).await? {
        return Err(ServiceError::NotFound(format!("image {} is not in the registry", reference)));
    }
    let source = registry.pull_reference(reference);
    engine.pull_image(&source).await.map_err(|e| {
        log::error!("pull image {}: {}", source, e);
        e
    })?;
    // Keep the plain reference so running containers match the approved names.
    engine.tag_image(&source, reference).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::security::tests::enforcer;
    use crate::testing::FakeRegistry;
    use fleetwarden_shared::rpc::ContainerSecurityState;
    use fleetwarden_shared::{ErrorKind, FileProtection, SecurityConfig};
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct EngineState {
        containers: BTreeMap<String, (EngineSpec, EngineInspect)>,
        images: Vec<EngineImage>,
        networks: Vec<EngineNetwork>,
        pulled: Vec<String>,
        tagged: Vec<(String, String)>,
        removed_images: Vec<String>,
        connected: Vec<(String, String)>,
        disconnected: Vec<(String, String)>,
    }

    #[derive(Default)]
    struct FakeEngine {
        state: StdMutex<EngineState>,
        next_id: AtomicUsize,
    }

    impl FakeEngine {
        fn with_image(reference: &str) -> Self {
            let engine = Self::default();
            engine.state.lock().unwrap().images.push(EngineImage {
                id: "sha256:base".to_string(),
                repo_tags: vec![reference.to_string()],
                size: 10,
                created: 1,
            });
            engine
        }

        fn set_running(&self, id: &str, running: bool) {
            let mut state = self.state.lock().unwrap();
            if let Some((_, inspect)) = state.containers.get_mut(id) {
                inspect.running = running;
                inspect.status = if running { "running" } else { "exited" }.to_string();
            }
        }

        fn spec(&self, id: &str) -> EngineSpec {
            self.state.lock().unwrap().containers[id].0.clone()
        }

        fn missing(id: &str) -> ServiceError {
            ServiceError::NotFound(format!("container {}", id))
        }
    }

    #[async_trait]
    impl ContainerEngine for FakeEngine {
        async fn info(&self) -> ServiceResult<EngineInfo> {
            let state = self.state.lock().unwrap();
            Ok(EngineInfo {
                containers: state.containers.len() as i64,
                containers_running: state.containers.values().filter(|(_, i)| i.running).count() as i64,
            })
        }

        async fn list_containers(&self, _all: bool) -> ServiceResult<Vec<EngineContainer>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .containers
                .values()
                .map(|(spec, inspect)| EngineContainer {
                    id: inspect.id.clone(),
                    name: inspect.name.clone(),
                    image: inspect.image.clone(),
                    state: inspect.status.clone(),
                    labels: inspect.labels.clone(),
                    size_root_fs: 2_000_000,
                    networks: inspect
                        .networks
                        .iter()
                        .map(|n| (n.network.clone(), n.ip_address.clone()))
                        .collect(),
                    command: spec.image.clone(),
                    ..Default::default()
                })
                .collect())
        }

        async fn create_container(&self, spec: &EngineSpec) -> ServiceResult<String> {
            let id = format!("c{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
            let inspect = EngineInspect {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                status: "created".to_string(),
                labels: spec.labels.clone(),
                env: spec.env.clone(),
                mounts: spec.mounts.clone(),
                restart: spec.restart.clone(),
                resources: spec.resources.clone(),
                storage_opt: spec.storage_opt.clone(),
                networks: spec.network.iter().cloned().collect(),
                ..Default::default()
            };
            self.state
                .lock()
                .unwrap()
                .containers
                .insert(id.clone(), (spec.clone(), inspect));
            Ok(id)
        }

        async fn start_container(&self, id: &str) -> ServiceResult<()> {
            if !self.state.lock().unwrap().containers.contains_key(id) {
                return Err(Self::missing(id));
            }
            self.set_running(id, true);
            Ok(())
        }

        async fn stop_container(&self, id: &str, _timeout: i64) -> ServiceResult<()> {
            if !self.state.lock().unwrap().containers.contains_key(id) {
                return Err(Self::missing(id));
            }
            self.set_running(id, false);
            Ok(())
        }

        async fn kill_container(&self, id: &str) -> ServiceResult<()> {
            self.stop_container(id, 0).await
        }

        async fn restart_container(&self, id: &str, _timeout: i64) -> ServiceResult<()> {
            self.start_container(id).await
        }

        async fn remove_container(&self, id: &str, _force: bool) -> ServiceResult<()> {
            self.state
                .lock()
                .unwrap()
                .containers
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| Self::missing(id))
        }

        async fn inspect_container(&self, id: &str) -> ServiceResult<EngineInspect> {
            self.state
                .lock()
                .unwrap()
                .containers
                .get(id)
                .map(|(_, i)| i.clone())
                .ok_or_else(|| Self::missing(id))
        }

        async fn update_container(
            &self,
            id: &str,
            resources: Option<&EngineResources>,
            restart: Option<&EngineRestartPolicy>,
        ) -> ServiceResult<()> {
            let mut state = self.state.lock().unwrap();
            let (_, inspect) = state.containers.get_mut(id).ok_or_else(|| Self::missing(id))?;
            if let Some(r) = resources {
                inspect.resources = Some(r.clone());
            }
            if let Some(p) = restart {
                inspect.restart = Some(p.clone());
            }
            Ok(())
        }

        async fn container_stats(&self, _id: &str) -> ServiceResult<EngineStats> {
            Ok(EngineStats {
                cpu_cores: 0.5,
                online_cpus: 2.0,
                memory_usage: 256 << 20,
                memory_limit: 1024 << 20,
            })
        }

        async fn commit_container(&self, id: &str, reference: &str) -> ServiceResult<String> {
            self.inspect_container(id).await?;
            self.state.lock().unwrap().images.push(EngineImage {
                id: "sha256:backup".to_string(),
                repo_tags: vec![reference.to_string()],
                size: 4096,
                created: 2,
            });
            Ok("sha256:backup".to_string())
        }

        async fn list_images(&self) -> ServiceResult<Vec<EngineImage>> {
            Ok(self.state.lock().unwrap().images.clone())
        }

        async fn inspect_image(&self, reference: &str) -> ServiceResult<EngineImage> {
            self.state
                .lock()
                .unwrap()
                .images
                .iter()
                .find(|i| i.id == reference || i.repo_tags.iter().any(|t| t == reference))
                .cloned()
                .ok_or_else(|| ServiceError::NotFound(reference.to_string()))
        }

        async fn pull_image(&self, reference: &str) -> ServiceResult<()> {
            let mut state = self.state.lock().unwrap();
            state.pulled.push(reference.to_string());
            state.images.push(EngineImage {
                id: format!("sha256:{}", reference),
                repo_tags: vec![reference.to_string()],
                ..Default::default()
            });
            Ok(())
        }

        async fn tag_image(&self, source: &str, reference: &str) -> ServiceResult<()> {
            let mut state = self.state.lock().unwrap();
            state.tagged.push((source.to_string(), reference.to_string()));
            if let Some(image) = state
                .images
                .iter_mut()
                .find(|i| i.repo_tags.iter().any(|t| t == source))
            {
                image.repo_tags.push(reference.to_string());
            }
            Ok(())
        }

        async fn remove_image(&self, reference: &str) -> ServiceResult<()> {
            let mut state = self.state.lock().unwrap();
            state.removed_images.push(reference.to_string());
            state.images.retain(|i| !i.repo_tags.iter().any(|t| t == reference));
            Ok(())
        }

        async fn list_networks(&self) -> ServiceResult<Vec<EngineNetwork>> {
            Ok(self.state.lock().unwrap().networks.clone())
        }

        async fn connect_network(&self, container_id: &str, endpoint: &EngineEndpoint) -> ServiceResult<()> {
            let mut state = self.state.lock().unwrap();
            state
                .connected
                .push((container_id.to_string(), endpoint.network.clone()));
            if let Some((_, inspect)) = state.containers.get_mut(container_id) {
                inspect.networks.retain(|n| n.network != endpoint.network);
                inspect.networks.push(endpoint.clone());
            }
            Ok(())
        }

        async fn disconnect_network(&self, container_id: &str, network: &str) -> ServiceResult<()> {
            let mut state = self.state.lock().unwrap();
            state
                .disconnected
                .push((container_id.to_string(), network.to_string()));
            if let Some((_, inspect)) = state.containers.get_mut(container_id) {
                inspect.networks.retain(|n| n.network != network);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeMetrics {
        queried: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl MetricsSource for FakeMetrics {
        async fn history(&self, _start: i64, _end: i64, _interval: i64, name: &str) -> ServiceResult<MonitorHistoryReply> {
            self.queried.lock().unwrap().push(name.to_string());
            Ok(MonitorHistoryReply::default())
        }
    }

    struct Harness {
        runtime: AgentRuntime,
        engine: Arc<FakeEngine>,
        registry: Arc<FakeRegistry>,
        metrics: Arc<FakeMetrics>,
        kernel: Arc<crate::agent::security::tests::RecordingKernel>,
        dir: tempfile::TempDir,
    }

    fn harness(engine: FakeEngine) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let (enforcer, kernel) = enforcer(dir.path());
        let engine = Arc::new(engine);
        let registry = Arc::new(FakeRegistry::default());
        let metrics = Arc::new(FakeMetrics::default());
        let runtime = AgentRuntime::new(
            engine.clone(),
            registry.clone(),
            Arc::new(enforcer),
            Arc::new(BackupJobStore::new(dir.path().join("jobs.json"))),
            metrics.clone(),
            dir.path().join("graphic"),
        );
        Harness {
            runtime,
            engine,
            registry,
            metrics,
            kernel,
            dir,
        }
    }

    fn configs(name: &str, image: &str) -> ContainerConfigs {
        ContainerConfigs {
            name: name.to_string(),
            image: image.to_string(),
            desc: "web frontend".to_string(),
            uuid: "u-1".to_string(),
            ..Default::default()
        }
    }

    async fn create(h: &Harness, configs: ContainerConfigs) -> ServiceResult<CreateContainerReply> {
        h.runtime
            .create_container(&CreateContainerRequest { node_id: 1, configs })
            .await
    }

    fn ids(ids: &[&str]) -> ContainerIdList {
        ContainerIdList {
            node_id: 1,
            container_ids: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_pulls_from_the_registry_and_labels_the_container() {
        let h = harness(FakeEngine::default());
        h.registry.published.lock().unwrap().push("web:1.0".to_string());

        let mut conf = configs("web1", "web:1.0");
        conf.envs.insert("A".to_string(), "1".to_string());
        conf.envs.insert(UUID_ENV.to_string(), "forged".to_string());
        conf.resource_limit = Some(ResourceLimit {
            cpu_limit: 1.5,
            memory_limit: 512.0,
            disk_limit: 512.0,
            ..Default::default()
        });

        let reply = create(&h, conf).await.unwrap();
        assert!(reply.error.is_none());

        {
            let state = h.engine.state.lock().unwrap();
            assert_eq!(state.pulled, vec!["registry.test/web:1.0".to_string()]);
            assert_eq!(
                state.tagged,
                vec![("registry.test/web:1.0".to_string(), "web:1.0".to_string())]
            );
        }

        let spec = h.engine.spec(&reply.container_id);
        assert_eq!(spec.labels[LABEL_DESC], "web frontend");
        assert_eq!(spec.labels[LABEL_UUID], "u-1");
        assert_eq!(spec.labels[LABEL_DISK_LIMIT], "512.000000");
        assert_eq!(spec.storage_opt["size"], "512.000000M");
        assert!(spec.env.contains(&"A=1".to_string()));
        assert!(spec.env.contains(&"FW_UUID=u-1".to_string()));
        assert!(!spec.env.contains(&"FW_UUID=forged".to_string()));
        assert_eq!(spec.resources.unwrap().nano_cpus, 1_500_000_000);
    }

    #[tokio::test]
    async fn create_refuses_unknown_images_and_bad_names() {
        let h = harness(FakeEngine::default());
        let err = create(&h, configs("web1", "ghost:1.0")).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));

        let err = create(&h, configs("-bad name", "ghost:1.0")).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));
        assert!(h.engine.state.lock().unwrap().containers.is_empty());
    }

    #[tokio::test]
    async fn failed_security_step_removes_the_new_container() {
        let h = harness(FakeEngine::with_image("web:1.0"));
        let mut conf = configs("web1", "web:1.0");
        conf.uuid = String::new();
        conf.security_config = Some(SecurityConfig {
            nproc_protection: Some(ProcProtection {
                is_on: true,
                exe_list: vec!["/usr/bin/curl".to_string()],
            }),
            ..Default::default()
        });

        let err = create(&h, conf).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContainerNprocProtection);
        assert!(h.engine.state.lock().unwrap().containers.is_empty());
    }

    #[tokio::test]
    async fn security_config_is_applied_on_create() {
        let h = harness(FakeEngine::with_image("web:1.0"));
        let mut conf = configs("web1", "web:1.0");
        conf.security_config = Some(SecurityConfig {
            file_protection: Some(FileProtection {
                is_on: true,
                file_list: vec!["/etc/passwd".to_string()],
            }),
            ..Default::default()
        });

        create(&h, conf).await.unwrap();
        let sent = h.kernel.sent.lock().unwrap();
        assert!(sent.iter().any(|m| m.data == "/etc/passwd"));
    }

    #[tokio::test]
    async fn graphic_containers_get_display_env_and_label() {
        let h = harness(FakeEngine::with_image("web:1.0"));
        let mut conf = configs("desk", "web:1.0");
        conf.enable_graphic = true;

        let reply = create(&h, conf).await.unwrap();
        let spec = h.engine.spec(&reply.container_id);
        assert_eq!(spec.labels[LABEL_GRAPHIC], "1");
        assert!(spec.env.iter().any(|e| e.starts_with("DISPLAY=")));

        let inspected = h.runtime.inspect_container(&reply.container_id).await.unwrap();
        assert!(inspected.enable_graphic);
    }

    #[tokio::test]
    async fn batch_operations_report_each_container() {
        let h = harness(FakeEngine::with_image("web:1.0"));
        let a = create(&h, configs("app-a", "web:1.0")).await.unwrap().container_id;
        let b = create(&h, configs("app-b", "web:1.0")).await.unwrap().container_id;

        let reply = h.runtime.start_containers(&ids(&[&a, "ghost"])).await.unwrap();
        assert_eq!(reply.ok_ids, vec![a.clone()]);
        assert_eq!(reply.fail_infos[0].container_id, "ghost");
        assert_eq!(reply.fail_infos[0].fail_code, ErrorKind::NotFound.code());

        let reply = h.runtime.remove_containers(&ids(&[&a, &b])).await.unwrap();
        assert_eq!(reply.ok_ids, vec![b.clone()]);
        assert_eq!(
            reply.fail_infos[0].fail_code,
            ErrorKind::RemoveContainerWhenRunning.code()
        );

        let reply = h.runtime.stop_containers(&ids(&[&a])).await.unwrap();
        assert_eq!(reply.ok_ids, vec![a.clone()]);
        let reply = h.runtime.remove_containers(&ids(&[&a])).await.unwrap();
        assert_eq!(reply.ok_ids, vec![a]);

        let err = h.runtime.kill_containers(&ids(&[])).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn listing_reports_usage_of_running_containers() {
        let h = harness(FakeEngine::with_image("web:1.0"));
        let mut conf = configs("app-a", "web:1.0");
        conf.resource_limit = Some(ResourceLimit {
            disk_limit: 100.0,
            ..Default::default()
        });
        let a = create(&h, conf).await.unwrap().container_id;
        create(&h, configs("app-b", "web:1.0")).await.unwrap();
        h.runtime.start_containers(&ids(&[&a])).await.unwrap();

        let list = h.runtime.list_containers(true).await.unwrap();
        assert_eq!(list.len(), 2);
        let running = list.iter().find(|c| c.id == a).unwrap();
        let stat = running.resource_stat.as_ref().unwrap();
        assert_eq!(stat.cpu_stat.as_ref().unwrap().used_percentage, 25.0);
        assert_eq!(stat.mem_stat.as_ref().unwrap().used, 256.0);
        assert_eq!(stat.disk_stat.as_ref().unwrap().limit, 100.0);
        assert_eq!(stat.disk_stat.as_ref().unwrap().used, 2.0);

        let idle = list.iter().find(|c| c.id != a).unwrap();
        assert!(idle.resource_stat.as_ref().unwrap().cpu_stat.is_none());
    }

    #[tokio::test]
    async fn inspect_maps_engine_state_back() {
        let engine = FakeEngine::with_image("web:1.0");
        engine.state.lock().unwrap().networks.push(EngineNetwork {
            name: "net1".to_string(),
            driver: "bridge".to_string(),
            subnet: "172.20.0.0/16".to_string(),
            ip_range: String::new(),
            gateway: "172.20.0.1".to_string(),
        });
        let h = harness(engine);

        let mut conf = configs("app-a", "web:1.0");
        conf.restart_policy = Some(RestartPolicy {
            name: "on-failure".to_string(),
            max_retry: 3,
        });
        conf.networks = vec![NetworkConfig {
            interface: "net1".to_string(),
            ..Default::default()
        }];
        conf.resource_limit = Some(ResourceLimit {
            cpu_limit: 2.0,
            cpu_prio: 10,
            memory_limit: 256.0,
            disk_limit: 64.0,
            ..Default::default()
        });
        let id = create(&h, conf).await.unwrap().container_id;

        let got = h.runtime.inspect_container(&id).await.unwrap();
        assert_eq!(got.desc, "web frontend");
        assert_eq!(got.uuid, "u-1");
        assert_eq!(got.envs[UUID_ENV], "u-1");
        assert_eq!(got.restart_policy.unwrap().max_retry, 3);
        assert_eq!(got.networks.len(), 1);
        assert_eq!(got.networks[0].ip_address, "172.20.0.2");
        let limit = got.resource_limit.unwrap();
        assert_eq!(limit.cpu_limit, 2.0);
        assert_eq!(limit.cpu_prio, 10);
        assert_eq!(limit.memory_limit, 256.0);
        assert_eq!(limit.disk_limit, 64.0);
    }

    #[test]
    fn backups_keep_the_requested_address() {
        let info = EngineInspect {
            id: "c1".to_string(),
            networks: vec![
                EngineEndpoint {
                    network: "bridge".to_string(),
                    ip_address: "172.17.0.2".to_string(),
                    ..Default::default()
                },
                EngineEndpoint {
                    network: "net1".to_string(),
                    ipam_address: String::new(),
                    ip_address: "172.20.0.7".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let live = configs_from_inspect(&info, false);
        assert_eq!(live.networks.len(), 1);
        assert_eq!(live.networks[0].ip_address, "172.20.0.7");

        let backup = configs_from_inspect(&info, true);
        assert_eq!(backup.networks[0].ip_address, "");
    }

    #[tokio::test]
    async fn update_reconciles_networks_and_limits() {
        let engine = FakeEngine::with_image("web:1.0");
        for (name, subnet) in [("net1", "172.20.0.0/16"), ("net2", "172.21.0.0/16")] {
            engine.state.lock().unwrap().networks.push(EngineNetwork {
                name: name.to_string(),
                driver: "bridge".to_string(),
                subnet: subnet.to_string(),
                ip_range: String::new(),
                gateway: String::new(),
            });
        }
        let h = harness(engine);
        let mut conf = configs("app-a", "web:1.0");
        conf.networks = vec![NetworkConfig {
            interface: "net1".to_string(),
            ..Default::default()
        }];
        let id = create(&h, conf).await.unwrap().container_id;

        let err = h
            .runtime
            .update_container(&UpdateContainerRequest {
                container_id: id.clone(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));

        h.runtime
            .update_container(&UpdateContainerRequest {
                container_id: id.clone(),
                resource_limit: Some(ResourceLimit {
                    memory_limit: 128.0,
                    ..Default::default()
                }),
                networks: Some(vec![NetworkConfig {
                    interface: "net2".to_string(),
                    ip_address: "172.21.0.9".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            })
            .await
            .unwrap();

        let state = h.engine.state.lock().unwrap();
        assert!(state.disconnected.contains(&(id.clone(), "net1".to_string())));
        assert!(state.connected.contains(&(id.clone(), "net2".to_string())));
        let inspect = &state.containers[&id].1;
        assert_eq!(inspect.resources.as_ref().unwrap().memory, 128 << 20);
        assert_eq!(inspect.networks[0].ip_address, "172.21.0.9");
    }

    #[tokio::test]
    async fn backup_job_commits_and_records_the_image() {
        let h = harness(FakeEngine::with_image("web:1.0"));
        let id = create(&h, configs("app-a", "web:1.0")).await.unwrap().container_id;

        h.runtime
            .add_backup_job(&AddBackupJobRequest {
                id: 7,
                container_id: id.clone(),
                backup_name: "b1".to_string(),
            })
            .await
            .unwrap();

        let mut job = h.runtime.get_backup_job(7).await.unwrap();
        for _ in 0..50 {
            if job.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            job = h.runtime.get_backup_job(7).await.unwrap();
        }
        assert_eq!(job.status, BackupStatus::Succeeded);
        assert_eq!(job.image_ref, "web:b1");
        assert_eq!(job.image_id, "backup");
        assert_eq!(job.image_size, 4096);

        h.runtime.del_backup_job(7).await.unwrap();
        assert!(h.runtime.get_backup_job(7).await.is_err());
    }

    #[tokio::test]
    async fn backup_of_a_missing_container_fails_the_job() {
        let h = harness(FakeEngine::default());
        h.runtime
            .add_backup_job(&AddBackupJobRequest {
                id: 1,
                container_id: "ghost".to_string(),
                backup_name: "b1".to_string(),
            })
            .await
            .unwrap();

        let mut job = h.runtime.get_backup_job(1).await.unwrap();
        for _ in 0..50 {
            if job.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            job = h.runtime.get_backup_job(1).await.unwrap();
        }
        assert_eq!(job.status, BackupStatus::Failed);
    }

    #[tokio::test]
    async fn resume_recreates_from_the_backup_image() {
        let h = harness(FakeEngine::with_image("web:1.0"));
        h.engine.state.lock().unwrap().images.push(EngineImage {
            id: "sha256:b1".to_string(),
            repo_tags: vec!["web:b1".to_string()],
            ..Default::default()
        });
        let old = create(&h, configs("app-a", "web:1.0")).await.unwrap().container_id;
        h.runtime.start_containers(&ids(&[&old])).await.unwrap();

        let new = h
            .runtime
            .resume_backup(&AgentResumeBackupRequest {
                container_id: old.clone(),
                image_ref: "web:b1".to_string(),
                security_config: None,
            })
            .await
            .unwrap();
        assert_ne!(new, old);

        let state = h.engine.state.lock().unwrap();
        assert!(!state.containers.contains_key(&old));
        let (spec, _) = &state.containers[&new];
        assert_eq!(spec.image, "web:b1");
        assert_eq!(spec.name, "app-a");
        assert_eq!(spec.labels[LABEL_UUID], "u-1");
    }

    #[tokio::test]
    async fn node_images_skip_untagged_layers() {
        let engine = FakeEngine::with_image("web:1.0");
        engine.state.lock().unwrap().images.push(EngineImage {
            id: "sha256:dangling".to_string(),
            repo_tags: vec!["<none>:<none>".to_string()],
            ..Default::default()
        });
        let h = harness(engine);
        let images = h.runtime.list_images().await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].name, "web:1.0");
    }

    #[tokio::test]
    async fn sync_removes_then_pulls_in_the_background() {
        let h = harness(FakeEngine::with_image("old:1.0"));
        h.registry.published.lock().unwrap().push("new:1.0".to_string());
        assert!(h.runtime.sync_images(&AgentSyncRequest::default()).await.is_err());

        h.runtime
            .sync_images(&AgentSyncRequest {
                to_remove: vec!["old:1.0".to_string()],
                to_pull: vec!["new:1.0".to_string()],
            })
            .await
            .unwrap();

        for _ in 0..50 {
            if !h.engine.state.lock().unwrap().tagged.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let names: Vec<String> = h
            .runtime
            .list_images()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert!(names.contains(&"new:1.0".to_string()));
        assert!(!names.contains(&"old:1.0".to_string()));
    }

    #[tokio::test]
    async fn net_protection_uses_the_container_uuid() {
        let h = harness(FakeEngine::with_image("web:1.0"));
        let id = create(&h, configs("app-a", "web:1.0")).await.unwrap().container_id;

        let req = UpdateProcProtectionRequest {
            node_id: 1,
            container_id: id.clone(),
            protection_type: ProcProtectionType::Net,
            is_on: true,
            to_append: vec!["/usr/bin/curl".to_string()],
            ..Default::default()
        };
        h.runtime.update_proc_protection(&req).await.unwrap();
        let allow = h.dir.path().join("opensnitch").join(format!("0002-{}-allow.json", id));
        let rule = std::fs::read_to_string(&allow).unwrap();
        assert!(rule.contains("u-1"));

        h.runtime
            .update_proc_protection(&UpdateProcProtectionRequest { is_on: false, ..req.clone() })
            .await
            .unwrap();
        assert!(!allow.exists());

        let err = h
            .runtime
            .update_proc_protection(&UpdateProcProtectionRequest { node_id: 0, ..req })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn security_state_loads_once_per_process() {
        let h = harness(FakeEngine::default());
        let req = LoadSecurityConfigRequest {
            configs: vec![ContainerSecurityState {
                container_id: "c1".to_string(),
                file_protection: Some(FileProtection {
                    is_on: true,
                    file_list: vec!["/etc/shadow".to_string()],
                }),
                proc_protection: None,
            }],
        };
        h.runtime.load_security_config(&req).await.unwrap();
        let first = h.kernel.sent.lock().unwrap().len();
        assert!(first > 0);

        h.runtime.load_security_config(&req).await.unwrap();
        assert_eq!(h.kernel.sent.lock().unwrap().len(), first);
    }

    #[tokio::test]
    async fn container_history_uses_its_name_and_limits() {
        let h = harness(FakeEngine::with_image("web:1.0"));
        let mut conf = configs("app-a", "web:1.0");
        conf.resource_limit = Some(ResourceLimit {
            cpu_limit: 0.5,
            memory_limit: 64.0,
            ..Default::default()
        });
        let id = create(&h, conf).await.unwrap().container_id;

        let now = unix_now();
        let reply = h
            .runtime
            .monitor_history(&MonitorHistoryRequest {
                node_id: 1,
                container_id: id,
                start_time: now - 600,
                end_time: now,
                interval: 1,
            })
            .await
            .unwrap();
        assert_eq!(reply.rsc_limit.cpu_limit, 0.5);
        assert_eq!(reply.rsc_limit.memory_limit, 64.0);

        h.runtime
            .monitor_history(&MonitorHistoryRequest {
                node_id: 1,
                start_time: now - 600,
                end_time: now,
                interval: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(
            *h.metrics.queried.lock().unwrap(),
            vec!["app-a".to_string(), HOST_SERIES.to_string()]
        );
    }
}
