use fleetwarden_shared::rpc::{CreateNodeRequest, UpdateNodeRequest};
use fleetwarden_shared::{NodeInfo, NodeResourceLimit, NodeStatus};
use futures::future::join_all;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, Set,
};
use sea_orm::sea_query::Expr;
use std::collections::HashMap;
use std::sync::Arc;

use crate::agent_client::{AgentApi, timeouts};
use crate::agent_pool::AgentPool;
use crate::database::unix_now;
use crate::entity::node_infos;
use crate::error::{ServiceError, ServiceResult};
use crate::validation::{is_valid_node_addr, is_valid_node_comment, is_valid_node_name};

/// Authoritative list of managed nodes.
pub struct NodeRegistry {
    db: DatabaseConnection,
    pool: Arc<AgentPool>,
}

impl NodeRegistry {
    pub fn new(db: DatabaseConnection, pool: Arc<AgentPool>) -> Self {
        Self { db, pool }
    }

    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.pool
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// All nodes that are not soft-deleted, oldest first.
    pub async fn live_nodes(&self) -> ServiceResult<Vec<node_infos::Model>> {
        let nodes = node_infos::Entity::find()
            .filter(node_infos::Column::Deleted.eq(false))
            .order_by_asc(node_infos::Column::Id)
            .all(&self.db)
            .await?;
        Ok(nodes)
    }

    pub async fn find(&self, id: i64) -> ServiceResult<node_infos::Model> {
        node_infos::Entity::find_by_id(id)
            .filter(node_infos::Column::Deleted.eq(false))
            .one(&self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("node {}", id)))
    }

    /// Lookup map for resolving many node ids at once.
    pub async fn node_map(&self) -> ServiceResult<HashMap<i64, node_infos::Model>> {
        Ok(self
            .live_nodes()
            .await?
            .into_iter()
            .map(|n| (n.id, n))
            .collect())
    }

    /// Resolves a node id to its record and a channel to its agent.
    pub async fn connect(&self, id: i64) -> ServiceResult<(node_infos::Model, Arc<dyn AgentApi>)> {
        let node = self.find(id).await?;
        let agent = self.pool.get(&node.address).await?;
        Ok((node, agent))
    }

    pub async fn list(&self) -> ServiceResult<Vec<NodeInfo>> {
        let nodes = self.live_nodes().await?;
        let statuses = join_all(nodes.iter().map(|n| self.fetch_status(n))).await;

        Ok(nodes
            .iter()
            .zip(statuses)
            .map(|(n, status)| {
                let mut info = to_node_info(n);
                info.status = status.ok();
                info
            })
            .collect())
    }

    pub async fn create(&self, req: CreateNodeRequest) -> ServiceResult<()> {
        if !is_valid_node_addr(&req.address) {
            return Err(ServiceError::invalid("node address"));
        } else if !is_valid_node_name(&req.name) {
            return Err(ServiceError::invalid("node name"));
        } else if !is_valid_node_comment(&req.comment) {
            return Err(ServiceError::invalid("node comment"));
        }

        let agent = self.pool.get(&req.address).await?;
        if let Err(e) = agent.node_status(timeouts::NODE_CHECK).await {
            log::warn!("reach agent {} failed: {}", req.address, e);
            return Err(ServiceError::internal(format!(
                "node {} is not reachable",
                req.address
            )));
        }

        let existing = node_infos::Entity::find()
            .filter(node_infos::Column::Address.eq(req.address.as_str()))
            .order_by_asc(node_infos::Column::Id)
            .all(&self.db)
            .await?;

        if existing.iter().any(|n| !n.deleted) {
            return Err(ServiceError::AlreadyExists(format!("node {}", req.address)));
        }

        let now = unix_now();
        match existing.into_iter().next() {
            Some(row) => {
                log::info!("revive node id={} address={}", row.id, row.address);
                let mut active = row.into_active_model();
                active.name = Set(req.name);
                active.comment = Set(req.comment);
                active.deleted = Set(false);
                active.updated_at = Set(now);
                active.update(&self.db).await?;
            }
            None => {
                node_infos::ActiveModel {
                    name: Set(req.name),
                    address: Set(req.address),
                    comment: Set(req.comment),
                    cpu_limit: Set(0.0),
                    memory_limit: Set(0.0),
                    disk_limit: Set(0.0),
                    unread_warn: Set(0),
                    deleted: Set(false),
                    created_at: Set(now),
                    updated_at: Set(now),
                    ..Default::default()
                }
                .insert(&self.db)
                .await?;
            }
        }
        Ok(())
    }

    pub async fn remove(&self, ids: &[i64]) -> ServiceResult<()> {
        if ids.is_empty() {
            return Err(ServiceError::invalid("empty node id list"));
        }
        node_infos::Entity::update_many()
            .col_expr(node_infos::Column::Deleted, Expr::value(true))
            .col_expr(node_infos::Column::UpdatedAt, Expr::value(unix_now()))
            .filter(node_infos::Column::Id.is_in(ids.to_vec()))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn update(&self, req: UpdateNodeRequest) -> ServiceResult<()> {
        if !is_valid_node_name(&req.name) {
            return Err(ServiceError::invalid("node name length must be 1-50"));
        } else if !is_valid_node_comment(&req.comment) {
            return Err(ServiceError::invalid("node comment length must be 0-200"));
        }

        let node = self.find(req.node_id).await?;
        let mut active = node.into_active_model();
        active.name = Set(req.name);
        if !req.comment.is_empty() {
            active.comment = Set(req.comment);
        }
        if let Some(limit) = req.rsc_limit {
            active.cpu_limit = Set(limit.cpu_limit);
            active.memory_limit = Set(limit.memory_limit);
            active.disk_limit = Set(limit.disk_limit);
        }
        active.updated_at = Set(unix_now());
        active.update(&self.db).await?;
        Ok(())
    }

    /// Live status per node. An unreachable agent is reported as offline.
    pub async fn status(&self, node_ids: &[i64]) -> ServiceResult<Vec<NodeStatus>> {
        let targets = if node_ids.is_empty() {
            self.live_nodes().await?
        } else {
            let mut map = self.node_map().await?;
            let mut targets = Vec::with_capacity(node_ids.len());
            for id in node_ids {
                match map.remove(id) {
                    Some(n) => targets.push(n),
                    None => {
                        log::warn!("node id={} not found", id);
                        return Err(ServiceError::NotFound(format!("node {}", id)));
                    }
                }
            }
            targets
        };

        let results = join_all(targets.iter().map(|n| self.fetch_status(n))).await;
        Ok(targets
            .iter()
            .zip(results)
            .map(|(n, r)| r.unwrap_or_else(|_| NodeStatus::offline(n.id)))
            .collect())
    }

    async fn fetch_status(&self, node: &node_infos::Model) -> ServiceResult<NodeStatus> {
        let agent = self.pool.get(&node.address).await?;
        let mut status = agent.node_status(timeouts::NODE_STATUS).await.map_err(|e| {
            log::debug!("node {} status: {}", node.address, e);
            e
        })?;
        status.node_id = node.id;
        Ok(status)
    }
}

pub fn to_node_info(n: &node_infos::Model) -> NodeInfo {
    NodeInfo {
        id: n.id,
        name: n.name.clone(),
        address: n.address.clone(),
        comment: n.comment.clone(),
        unread_warn: n.unread_warn,
        rsc_limit: NodeResourceLimit {
            cpu_limit: n.cpu_limit,
            memory_limit: n.memory_limit,
            disk_limit: n.disk_limit,
        },
        status: None,
    }
}
