//! Controller side container orchestration: fan-out to agents, partial
//! failure aggregation and the container metadata kept in the database.

mod backup;
mod template;

use fleetwarden_shared::rpc::{
    ContainerBatchReply, ContainerBatchRequest, CreateContainerRequest, ListContainersReply,
    ListContainersRequest, MonitorHistoryReply, MonitorHistoryRequest, UpdateContainerRequest,
};
use fleetwarden_shared::{
    ContainerConfigs, ContainerFailInfo, ContainerIdList, ErrorKind, NodeContainer, SecurityConfig,
};
use futures::future::join_all;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    Set,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::agent_client::AgentApi;
use crate::config_diff::ConfigComparator;
use crate::database::unix_now;
use crate::entity::{container_backups, container_configs, node_infos};
use crate::error::{ServiceError, ServiceResult};
use crate::node_registry::NodeRegistry;
use crate::permission::{Caller, PERMISSION_CONTAINER_CONF_BASIC, PERMISSION_CONTAINER_CONF_SEC};
use crate::validation::{is_valid_container_name, is_valid_desc, unique_strings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOp {
    Start,
    Stop,
    Kill,
    Restart,
    Remove,
}

impl BatchOp {
    pub fn name(self) -> &'static str {
        match self {
            BatchOp::Start => "start",
            BatchOp::Stop => "stop",
            BatchOp::Kill => "kill",
            BatchOp::Restart => "restart",
            BatchOp::Remove => "remove",
        }
    }

    async fn dispatch(
        self,
        agent: &dyn AgentApi,
        ids: &ContainerIdList,
    ) -> ServiceResult<ContainerBatchReply> {
        match self {
            BatchOp::Start => agent.start_containers(ids).await,
            BatchOp::Stop => agent.stop_containers(ids).await,
            BatchOp::Kill => agent.kill_containers(ids).await,
            BatchOp::Restart => agent.restart_containers(ids).await,
            BatchOp::Remove => agent.remove_containers(ids).await,
        }
    }
}

pub struct ContainerService {
    db: DatabaseConnection,
    registry: Arc<NodeRegistry>,
}

impl ContainerService {
    pub fn new(db: DatabaseConnection, registry: Arc<NodeRegistry>) -> Self {
        Self { db, registry }
    }

    /// Lists containers across the requested nodes. A node that cannot be
    /// reached lands in `fail_nodes`; the others still report.
    pub async fn list(&self, req: &ListContainersRequest) -> ServiceResult<ListContainersReply> {
        let targets = self.resolve_nodes(req.node_ids.as_deref()).await?;
        let reply = Arc::new(Mutex::new(ListContainersReply::default()));

        let mut handles = Vec::with_capacity(targets.len());
        for node in targets {
            let pool = Arc::clone(self.registry.pool());
            let reply = Arc::clone(&reply);
            let list_all = req.list_all;
            let address = node.address.clone();
            let handle = tokio::spawn(async move {
                let result = match pool.get(&node.address).await {
                    Ok(agent) => agent.list_containers(list_all).await,
                    Err(e) => Err(e),
                };

                let mut reply = reply.lock().await;
                match result {
                    Ok(infos) => reply.containers.extend(infos.into_iter().map(|info| {
                        NodeContainer {
                            node_id: node.id,
                            node_address: node.address.clone(),
                            info,
                        }
                    })),
                    Err(e) => {
                        log::warn!(
                            "list containers node id={} address={}: {}",
                            node.id,
                            node.address,
                            e
                        );
                        reply.fail_nodes.push(node.address.clone());
                    }
                }
            });
            handles.push((address, handle));
        }

        let (addresses, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        let joined = join_all(handles).await;

        let mut reply = reply.lock().await.clone();
        for (address, result) in addresses.into_iter().zip(joined) {
            if let Err(e) = result {
                log::error!("list task for {} aborted: {}", address, e);
                reply.fail_nodes.push(address);
            }
        }
        Ok(reply)
    }

    /// Registers the container record first, then asks the agent to build it.
    /// The record is dropped again when the agent produced nothing.
    pub async fn create(&self, caller: &Caller, req: &CreateContainerRequest) -> ServiceResult<String> {
        let conf = &req.configs;
        if req.node_id <= 0 || conf.image.is_empty() {
            return Err(ServiceError::invalid("node id and image are required"));
        } else if !is_valid_container_name(&conf.name) {
            return Err(ServiceError::invalid("container name"));
        } else if !is_valid_desc(&conf.desc) {
            return Err(ServiceError::invalid("container description"));
        }

        let security = conf.security_config.clone().unwrap_or_default();
        if !ConfigComparator::is_unrestricted(&security) && !caller.has(PERMISSION_CONTAINER_CONF_SEC) {
            return Err(ServiceError::ContainerSecurityConfigNoPerm);
        }

        let (node, agent) = self.registry.connect(req.node_id).await?;

        let now = unix_now();
        let uuid = Uuid::new_v4().to_string();
        let row = container_configs::ActiveModel {
            node_id: Set(node.id),
            uuid: Set(uuid.clone()),
            container_id: Set(String::new()),
            container_name: Set(conf.name.clone()),
            security_config: Set(serde_json::to_string(&security)?),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&self.db)
        .await?;

        let mut agent_req = req.clone();
        agent_req.configs.uuid = uuid;

        let reply = match agent.create_container(&agent_req).await {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("create container on {}: {}", node.address, e);
                self.drop_config_row(row.id).await;
                return Err(e);
            }
        };

        if reply.container_id.is_empty() {
            self.drop_config_row(row.id).await;
            return Err(reply
                .error
                .map(ServiceError::from)
                .unwrap_or_else(|| ServiceError::internal("agent returned no container id")));
        }

        let container_id = reply.container_id.clone();
        let row_id = row.id;
        let mut active = row.into_active_model();
        active.container_id = Set(container_id.clone());
        active.updated_at = Set(unix_now());
        if let Err(e) = active.update(&self.db).await {
            log::warn!("store container id {}: {}", container_id, e);
            // undo the create so no untracked container is left on the node
            let ids = ContainerIdList {
                node_id: node.id,
                container_ids: vec![container_id.clone()],
                backup_image_ids: vec![],
            };
            if let Err(rm) = agent.remove_containers(&ids).await {
                log::warn!("roll back container {} on {}: {}", container_id, node.address, rm);
            }
            self.drop_config_row(row_id).await;
            return Err(e.into());
        }

        if let Some(err) = reply.error {
            return Err(err.into());
        }
        log::info!("container {} created on {}", container_id, node.address);
        Ok(container_id)
    }

    pub async fn start(&self, req: &ContainerBatchRequest) -> ServiceResult<ContainerBatchReply> {
        self.batch(BatchOp::Start, req).await
    }

    pub async fn stop(&self, req: &ContainerBatchRequest) -> ServiceResult<ContainerBatchReply> {
        self.batch(BatchOp::Stop, req).await
    }

    pub async fn kill(&self, req: &ContainerBatchRequest) -> ServiceResult<ContainerBatchReply> {
        self.batch(BatchOp::Kill, req).await
    }

    pub async fn restart(&self, req: &ContainerBatchRequest) -> ServiceResult<ContainerBatchReply> {
        self.batch(BatchOp::Restart, req).await
    }

    /// Removal also drops the container's config and backup rows, but only
    /// for the ids the agent actually removed.
    pub async fn remove(&self, req: &ContainerBatchRequest) -> ServiceResult<ContainerBatchReply> {
        self.batch(BatchOp::Remove, req).await
    }

    /// Runs `op` group by group. Failures are collected per container; only a
    /// request naming a single container turns its failure into an error.
    pub async fn batch(&self, op: BatchOp, req: &ContainerBatchRequest) -> ServiceResult<ContainerBatchReply> {
        let groups: Vec<(i64, Vec<String>)> = req
            .ids
            .iter()
            .map(|g| (g.node_id, unique_strings(&g.container_ids)))
            .filter(|(_, ids)| !ids.is_empty())
            .collect();
        let targets: usize = groups.iter().map(|(_, ids)| ids.len()).sum();
        if targets == 0 {
            return Err(ServiceError::invalid("no container ids"));
        }

        let nodes = self.registry.node_map().await?;
        let mut reply = ContainerBatchReply::default();

        for (node_id, ids) in groups {
            let Some(node) = nodes.get(&node_id) else {
                log::warn!("{} containers: node id={} not found", op.name(), node_id);
                let err = ServiceError::NotFound(format!("node {}", node_id));
                push_failures(&mut reply, node_id, "", &ids, &err);
                continue;
            };

            match self.run_group(op, node, &ids).await {
                Ok(sub) => {
                    reply.ok_ids.extend(sub.ok_ids);
                    reply.fail_infos.extend(sub.fail_infos.into_iter().map(|mut f| {
                        f.node_id = node.id;
                        f.node_info = node.address.clone();
                        f
                    }));
                }
                Err(e) => {
                    log::warn!("{} containers on {}: {}", op.name(), node.address, e);
                    push_failures(&mut reply, node.id, &node.address, &ids, &e);
                }
            }
        }

        if targets == 1 {
            if let Some(fail) = reply.fail_infos.first() {
                let kind = ErrorKind::from_code(fail.fail_code).unwrap_or(ErrorKind::Internal);
                return Err(ServiceError::from_kind(kind, fail.fail_reason.clone()));
            }
        }
        Ok(reply)
    }

    async fn run_group(
        &self,
        op: BatchOp,
        node: &node_infos::Model,
        ids: &[String],
    ) -> ServiceResult<ContainerBatchReply> {
        let agent = self.registry.pool().get(&node.address).await?;
        let mut list = ContainerIdList {
            node_id: node.id,
            container_ids: ids.to_vec(),
            backup_image_ids: Vec::new(),
        };

        if op != BatchOp::Remove {
            return op.dispatch(agent.as_ref(), &list).await;
        }

        let configs = container_configs::Entity::find()
            .filter(container_configs::Column::NodeId.eq(node.id))
            .filter(container_configs::Column::ContainerId.is_in(ids.to_vec()))
            .all(&self.db)
            .await?;
        let uuids: Vec<String> = configs.iter().map(|c| c.uuid.clone()).collect();
        if !uuids.is_empty() {
            list.backup_image_ids = container_backups::Entity::find()
                .filter(container_backups::Column::Uuid.is_in(uuids))
                .all(&self.db)
                .await?
                .into_iter()
                .map(|b| b.image_id)
                .filter(|id| !id.is_empty())
                .collect();
        }

        let sub = op.dispatch(agent.as_ref(), &list).await?;

        let removed: HashSet<&str> = sub.ok_ids.iter().map(String::as_str).collect();
        let gone: Vec<&container_configs::Model> = configs
            .iter()
            .filter(|c| removed.contains(c.container_id.as_str()))
            .collect();
        if !gone.is_empty() {
            let uuids: Vec<String> = gone.iter().map(|c| c.uuid.clone()).collect();
            let ids: Vec<i64> = gone.iter().map(|c| c.id).collect();
            if let Err(e) = container_configs::Entity::delete_many()
                .filter(container_configs::Column::Id.is_in(ids))
                .exec(&self.db)
                .await
            {
                log::warn!("remove container configs on {}: {}", node.address, e);
            }
            if let Err(e) = container_backups::Entity::delete_many()
                .filter(container_backups::Column::Uuid.is_in(uuids))
                .exec(&self.db)
                .await
            {
                log::warn!("remove container backups on {}: {}", node.address, e);
            }
        }
        Ok(sub)
    }

    /// The agent's view of the container with the stored security config.
    pub async fn inspect(&self, node_id: i64, container_id: &str) -> ServiceResult<ContainerConfigs> {
        if node_id <= 0 || container_id.is_empty() {
            return Err(ServiceError::invalid("node id and container id are required"));
        }
        let (_, agent) = self.registry.connect(node_id).await?;
        let mut configs = agent.inspect_container(container_id).await?;

        match self.find_config(node_id, container_id).await {
            Ok(row) => configs.security_config = Some(parse_security(&row.security_config)),
            Err(e) => log::info!("no stored config for container {}: {}", container_id, e),
        }
        Ok(configs)
    }

    pub async fn update(&self, caller: &Caller, req: &UpdateContainerRequest) -> ServiceResult<()> {
        if req.node_id <= 0 || req.container_id.is_empty() {
            return Err(ServiceError::invalid("node id and container id are required"));
        } else if req.is_empty() {
            return Err(ServiceError::invalid("nothing to update"));
        }

        let (_, agent) = self.registry.connect(req.node_id).await?;

        if caller.enforced() {
            let current = agent.inspect_container(&req.container_id).await?;
            if ConfigComparator::basic_changed(&current, req)
                && !caller.has(PERMISSION_CONTAINER_CONF_BASIC)
            {
                log::info!("no permission to update basic config of {}", req.container_id);
                return Err(ServiceError::ContainerBasicConfigNoPerm);
            }

            let stored = self
                .find_config(req.node_id, &req.container_id)
                .await
                .map(|row| parse_security(&row.security_config))
                .unwrap_or_default();
            if ConfigComparator::security_changed(&stored, req.security_config.as_ref())
                && !caller.has(PERMISSION_CONTAINER_CONF_SEC)
            {
                log::info!("no permission to update security config of {}", req.container_id);
                return Err(ServiceError::ContainerSecurityConfigNoPerm);
            }
        }

        agent.update_container(req).await?;

        if let Some(security) = &req.security_config {
            let row = self.find_config(req.node_id, &req.container_id).await?;
            let mut active = row.into_active_model();
            active.security_config = Set(serde_json::to_string(security)?);
            active.updated_at = Set(unix_now());
            active.update(&self.db).await?;
        }
        Ok(())
    }

    pub async fn monitor_history(&self, req: &MonitorHistoryRequest) -> ServiceResult<MonitorHistoryReply> {
        let (_, agent) = self.registry.connect(req.node_id).await?;
        agent.monitor_history(req).await
    }

    pub(crate) async fn find_config(
        &self,
        node_id: i64,
        container_id: &str,
    ) -> ServiceResult<container_configs::Model> {
        container_configs::Entity::find()
            .filter(container_configs::Column::NodeId.eq(node_id))
            .filter(container_configs::Column::ContainerId.eq(container_id))
            .one(&self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("container {}", container_id)))
    }

    async fn resolve_nodes(&self, ids: Option<&[i64]>) -> ServiceResult<Vec<node_infos::Model>> {
        let ids = match ids {
            Some(ids) if !ids.is_empty() => ids,
            _ => return self.registry.live_nodes().await,
        };

        let mut nodes = self.registry.node_map().await?;
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for id in ids.iter().filter(|id| seen.insert(**id)) {
            match nodes.remove(id) {
                Some(node) => targets.push(node),
                None => {
                    log::info!("node id={} not found", id);
                    return Err(ServiceError::NotFound(format!("node {}", id)));
                }
            }
        }
        Ok(targets)
    }

    async fn drop_config_row(&self, id: i64) {
        if let Err(e) = container_configs::Entity::delete_by_id(id).exec(&self.db).await {
            log::warn!("drop container config row {}: {}", id, e);
        }
    }
}

fn push_failures(
    reply: &mut ContainerBatchReply,
    node_id: i64,
    node_info: &str,
    ids: &[String],
    err: &ServiceError,
) {
    reply.fail_infos.extend(ids.iter().map(|id| ContainerFailInfo {
        node_id,
        node_info: node_info.to_owned(),
        container_id: id.clone(),
        fail_reason: err.to_string(),
        fail_code: err.kind().code(),
    }));
}

/// Stored security JSON; an empty or unreadable blob means no restriction.
pub(crate) fn parse_security(raw: &str) -> SecurityConfig {
    if raw.is_empty() {
        return SecurityConfig::default();
    }
    serde_json::from_str(raw).unwrap_or_else(|e| {
        log::info!("unreadable security config: {}", e);
        SecurityConfig::default()
    })
}
