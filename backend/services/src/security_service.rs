use fleetwarden_shared::rpc::{
    ContainerSecurityState, ListProtectionRequest, LoadSecurityConfigRequest, ProcProtectionType,
    UpdateFileProtectionRequest, UpdateProcProtectionRequest,
};
use fleetwarden_shared::{FileProtection, ProcProtection, SecurityConfig};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, Set,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::container_service::parse_security;
use crate::database::unix_now;
use crate::entity::container_configs;
use crate::error::{ServiceError, ServiceResult};
use crate::node_registry::NodeRegistry;

/// Controller side of per-container process and file protection.
///
/// The stored JSON blob is the source of truth; agents only receive deltas,
/// plus a full reload from [`SecurityService::reload_all`].
pub struct SecurityService {
    db: DatabaseConnection,
    registry: Arc<NodeRegistry>,
}

impl SecurityService {
    pub fn new(db: DatabaseConnection, registry: Arc<NodeRegistry>) -> Self {
        Self { db, registry }
    }

    pub async fn update_file_protection(&self, req: &UpdateFileProtectionRequest) -> ServiceResult<()> {
        validate_target(req.node_id, &req.container_id)?;
        let row = self.find_config(req.node_id, &req.container_id).await?;
        let before = parse_security(&row.security_config);

        let old = before
            .file_protection
            .as_ref()
            .map(|p| p.file_list.clone())
            .unwrap_or_default();
        let mut after = before.clone();
        after.file_protection = Some(FileProtection {
            is_on: req.is_on,
            file_list: difference(&union(&req.to_append, &old), &req.to_remove),
        });
        if after == before {
            log::debug!("file protection of {} unchanged", req.container_id);
            return Ok(());
        }

        let push = UpdateFileProtectionRequest {
            to_append: difference(&difference(&req.to_append, &old), &req.to_remove),
            ..req.clone()
        };
        let (_, agent) = self.registry.connect(req.node_id).await?;
        agent.update_file_protection(&push).await?;

        self.store(row, &after).await
    }

    pub async fn update_proc_protection(&self, req: &UpdateProcProtectionRequest) -> ServiceResult<()> {
        validate_target(req.node_id, &req.container_id)?;
        let row = self.find_config(req.node_id, &req.container_id).await?;
        let before = parse_security(&row.security_config);

        let slot = |cfg: &SecurityConfig| match req.protection_type {
            ProcProtectionType::Exec => cfg.proc_protection.clone(),
            ProcProtectionType::Net => cfg.nproc_protection.clone(),
        };
        let old = slot(&before).map(|p| p.exe_list).unwrap_or_default();
        let merged = ProcProtection {
            is_on: req.is_on,
            exe_list: difference(&union(&req.to_append, &old), &req.to_remove),
        };

        let mut after = before.clone();
        let push = match req.protection_type {
            ProcProtectionType::Exec => {
                after.proc_protection = Some(merged);
                UpdateProcProtectionRequest {
                    to_append: difference(&difference(&req.to_append, &old), &req.to_remove),
                    ..req.clone()
                }
            }
            // the network rule file is rewritten whole on every change
            ProcProtectionType::Net => {
                let full = merged.exe_list.clone();
                after.nproc_protection = Some(merged);
                UpdateProcProtectionRequest {
                    to_append: full,
                    to_remove: Vec::new(),
                    ..req.clone()
                }
            }
        };
        if after == before {
            log::debug!("process protection of {} unchanged", req.container_id);
            return Ok(());
        }

        let (_, agent) = self.registry.connect(req.node_id).await?;
        agent.update_proc_protection(&push).await?;

        self.store(row, &after).await
    }

    pub async fn list_file_protection(&self, req: &ListProtectionRequest) -> ServiceResult<FileProtection> {
        validate_target(req.node_id, &req.container_id)?;
        let row = self.find_config(req.node_id, &req.container_id).await?;
        if row.security_config.is_empty() {
            return Ok(FileProtection::default());
        }
        parse_security(&row.security_config)
            .file_protection
            .ok_or_else(|| ServiceError::NotFound(format!("file protection of {}", req.container_id)))
    }

    pub async fn list_proc_protection(&self, req: &ListProtectionRequest) -> ServiceResult<ProcProtection> {
        validate_target(req.node_id, &req.container_id)?;
        let row = self.find_config(req.node_id, &req.container_id).await?;
        if row.security_config.is_empty() {
            return Ok(ProcProtection::default());
        }
        let cfg = parse_security(&row.security_config);
        let found = match req.protection_type {
            ProcProtectionType::Exec => cfg.proc_protection,
            ProcProtectionType::Net => cfg.nproc_protection,
        };
        found.ok_or_else(|| ServiceError::NotFound(format!("process protection of {}", req.container_id)))
    }

    /// Pushes every stored process and file protection to its node. Agents
    /// apply the first load they receive after starting and ignore the rest.
    pub async fn reload_all(&self) -> ServiceResult<()> {
        let rows = container_configs::Entity::find()
            .filter(container_configs::Column::ContainerId.ne(""))
            .order_by_asc(container_configs::Column::Id)
            .all(&self.db)
            .await?;

        let mut per_node: BTreeMap<i64, Vec<ContainerSecurityState>> = BTreeMap::new();
        for row in rows {
            if row.security_config.is_empty() {
                continue;
            }
            let cfg = parse_security(&row.security_config);
            let proc_protection = cfg.proc_protection.filter(|p| *p != ProcProtection::default());
            let file_protection = cfg.file_protection.filter(|p| *p != FileProtection::default());
            if proc_protection.is_none() && file_protection.is_none() {
                continue;
            }
            per_node.entry(row.node_id).or_default().push(ContainerSecurityState {
                container_id: row.container_id,
                proc_protection,
                file_protection,
            });
        }

        for (node_id, configs) in per_node {
            let (node, agent) = match self.registry.connect(node_id).await {
                Ok(found) => found,
                Err(e) => {
                    log::debug!("skip security reload for node id={}: {}", node_id, e);
                    continue;
                }
            };
            let count = configs.len();
            match agent.load_security_config(&LoadSecurityConfigRequest { configs }).await {
                Ok(()) => log::debug!("pushed {} security configs to {}", count, node.address),
                Err(e) => log::warn!("load security config on {}: {}", node.address, e),
            }
        }
        Ok(())
    }

    async fn find_config(&self, node_id: i64, container_id: &str) -> ServiceResult<container_configs::Model> {
        container_configs::Entity::find()
            .filter(container_configs::Column::NodeId.eq(node_id))
            .filter(container_configs::Column::ContainerId.eq(container_id))
            .one(&self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("container {}", container_id)))
    }

    async fn store(&self, row: container_configs::Model, cfg: &SecurityConfig) -> ServiceResult<()> {
        let mut active = row.into_active_model();
        active.security_config = Set(serde_json::to_string(cfg)?);
        active.updated_at = Set(unix_now());
        active.update(&self.db).await?;
        Ok(())
    }
}

fn validate_target(node_id: i64, container_id: &str) -> ServiceResult<()> {
    if node_id <= 0 || container_id.is_empty() {
        return Err(ServiceError::invalid("node id and container id are required"));
    }
    Ok(())
}

/// Items of `a` followed by the items of `b` not already present, without
/// duplicates.
fn union(a: &[String], b: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    a.iter()
        .chain(b.iter())
        .filter(|s| seen.insert(s.as_str()))
        .cloned()
        .collect()
}

fn difference(a: &[String], b: &[String]) -> Vec<String> {
    let drop: HashSet<&str> = b.iter().map(String::as_str).collect();
    a.iter().filter(|s| !drop.contains(s.as_str())).cloned().collect()
}
