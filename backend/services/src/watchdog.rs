//! Background reconciliation loops run by the controller.
//!
//! Each loop ticks on its own interval and does nothing unless this
//! controller currently owns the virtual IP.

use fleetwarden_shared::{
    ContainerIdList, EventModule, NodeInfo, NodeState, NodeStatus, WarnEvent, WarnLog,
};
use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::container_service::ContainerService;
use crate::error::ServiceResult;
use crate::image_service::{ImageService, ImageSource};
use crate::log_service::LogService;
use crate::node_registry::NodeRegistry;
use crate::security_service::SecurityService;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Master election by virtual IP ownership. Without a configured VIP every
/// controller is master.
#[derive(Debug, Clone, Default)]
pub struct MasterGate {
    virtual_if: String,
    virtual_ip: String,
}

impl MasterGate {
    pub fn new(virtual_if: &str, virtual_ip: &str) -> Self {
        Self {
            virtual_if: virtual_if.to_owned(),
            virtual_ip: virtual_ip.to_owned(),
        }
    }

    pub fn is_master(&self) -> bool {
        if self.virtual_if.is_empty() || self.virtual_ip.is_empty() {
            return true;
        }
        let vip: IpAddr = match self.virtual_ip.parse() {
            Ok(ip) => ip,
            Err(e) => {
                log::warn!("virtual ip {} is invalid: {}", self.virtual_ip, e);
                return false;
            }
        };

        let addrs = match nix::ifaddrs::getifaddrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                log::warn!("list interface addresses: {}", e);
                return false;
            }
        };
        addrs
            .filter(|a| a.interface_name == self.virtual_if)
            .filter_map(|a| a.address)
            .any(|addr| {
                let ip = if let Some(v4) = addr.as_sockaddr_in() {
                    IpAddr::V4(v4.ip())
                } else if let Some(v6) = addr.as_sockaddr_in6() {
                    IpAddr::V6(v6.ip())
                } else {
                    return false;
                };
                ip == vip
            })
    }
}

pub struct Watchdog {
    gate: MasterGate,
    interval: Duration,
    nodes: Arc<NodeRegistry>,
    containers: Arc<ContainerService>,
    images: ImageService,
    security: Arc<SecurityService>,
    logs: LogService,
}

impl Watchdog {
    pub fn new(
        gate: MasterGate,
        nodes: Arc<NodeRegistry>,
        containers: Arc<ContainerService>,
        images: ImageService,
        security: Arc<SecurityService>,
        logs: LogService,
    ) -> Self {
        Self {
            gate,
            interval: DEFAULT_INTERVAL,
            nodes,
            containers,
            images,
            security,
            logs,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs every loop until one of them exits, which only happens when the
    /// runtime shuts down.
    pub async fn run(&self) {
        log::info!("watchdog starting, interval {:?}", self.interval);

        tokio::select! {
            _ = self.every("node health", || self.check_nodes()) => log::error!("node health loop exited"),
            _ = self.every("illegal containers", || self.detect_illegal_containers()) => log::error!("illegal container loop exited"),
            _ = self.every("backup jobs", || self.containers.reconcile_backup_jobs()) => log::error!("backup job loop exited"),
            _ = self.every("image sync", || self.images.sync_all()) => log::error!("image sync loop exited"),
            _ = self.every("security reload", || self.security.reload_all()) => log::error!("security reload loop exited"),
        }
    }

    async fn every<'a, F, Fut, T>(&'a self, name: &str, task: F)
    where
        F: Fn() -> Fut + 'a,
        Fut: Future<Output = ServiceResult<T>> + 'a,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if !self.gate.is_master() {
                log::debug!("{}: not master, skipping", name);
                continue;
            }
            if let Err(e) = task().await {
                log::warn!("{} check failed: {}", name, e);
            }
        }
    }

    /// Writes warnings for offline or abnormal nodes and for usage above the
    /// node's configured limits.
    pub async fn check_nodes(&self) -> ServiceResult<usize> {
        let nodes = self.nodes.list().await?;
        let warns: Vec<WarnLog> = nodes
            .iter()
            .flat_map(|n| node_warnings(n, n.status.as_ref()))
            .collect();
        let count = warns.len();
        self.logs.create_warn_logs(warns).await?;
        Ok(count)
    }

    /// Stops every running container whose image is neither approved nor a
    /// backup, recording a warning for each.
    pub async fn detect_illegal_containers(&self) -> ServiceResult<usize> {
        let valid = self.images.valid_images().await?;
        let mut warns = Vec::new();
        for node in self.nodes.live_nodes().await? {
            let agent = match self.nodes.pool().get(&node.address).await {
                Ok(agent) => agent,
                Err(e) => {
                    log::warn!("illegal container scan: connect {}: {}", node.address, e);
                    continue;
                }
            };
            let containers = match agent.list_containers(false).await {
                Ok(list) => list,
                Err(e) => {
                    log::warn!("illegal container scan: list on {}: {}", node.address, e);
                    continue;
                }
            };

            for c in containers.iter().filter(|c| c.is_running() && !is_permitted(&valid, &c.image)) {
                log::info!("stop illegal container {} ({}) on {}", c.name, c.image, node.address);
                let ids = ContainerIdList {
                    node_id: node.id,
                    container_ids: vec![c.id.clone()],
                    backup_image_ids: Vec::new(),
                };
                if let Err(e) = agent.stop_containers(&ids).await {
                    log::info!("stop container {}: {}", c.id, e);
                }
                warns.push(WarnLog {
                    node_id: node.id,
                    node_info: node_label(&node.name, &node.address),
                    event_type: WarnEvent::IllegalContainer.as_i64(),
                    event_module: EventModule::Container.as_i64(),
                    container_id: c.id.clone(),
                    container_name: c.name.clone(),
                    detail: "illegal image".into(),
                    ..Default::default()
                });
            }
        }

        let count = warns.len();
        self.logs.create_warn_logs(warns).await?;
        Ok(count)
    }
}

fn is_permitted(valid: &HashMap<String, ImageSource>, image: &str) -> bool {
    valid.contains_key(image)
}

fn node_label(name: &str, address: &str) -> String {
    format!("{} ({})", name, address)
}

/// Warnings for one node given its fetched status; `None` means unreachable.
pub fn node_warnings(node: &NodeInfo, status: Option<&NodeStatus>) -> Vec<WarnLog> {
    let warn = |event: WarnEvent, detail: String| WarnLog {
        node_id: node.id,
        node_info: node_label(&node.name, &node.address),
        event_type: event.as_i64(),
        event_module: EventModule::Node.as_i64(),
        detail,
        ..Default::default()
    };

    let Some(status) = status else {
        return vec![warn(WarnEvent::NodeOffline, "node offline".into())];
    };

    let mut warns = Vec::new();
    if status.state != NodeState::Online {
        warns.push(warn(WarnEvent::NodeAbnormal, format!("node state {:?}", status.state)));
    }

    let limit = &node.rsc_limit;
    if let Some(cpu) = status.cpu_stat.as_ref().filter(|_| limit.cpu_limit > 0.0) {
        if cpu.used_percentage / 100.0 > limit.cpu_limit {
            warns.push(warn(WarnEvent::ResourceUsage, format!("cpu usage {:.2}%", cpu.used_percentage)));
        }
    }
    if let Some(mem) = status.mem_stat.as_ref().filter(|_| limit.memory_limit > 0.0) {
        if mem.used > limit.memory_limit {
            warns.push(warn(WarnEvent::ResourceUsage, format!("memory usage {:.0}MB", mem.used)));
        }
    }
    if let Some(disk) = status.disk_stat.as_ref().filter(|_| limit.disk_limit > 0.0) {
        if disk.used > limit.disk_limit {
            warns.push(warn(WarnEvent::ResourceUsage, format!("disk usage {:.0}MB", disk.used)));
        }
    }
    warns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container_service::tests::{fixture, node_id};
    use crate::entity::image_infos;
    use crate::testing::{FakeAgent, FakeConnector, FakeRegistry};
    use fleetwarden_shared::rpc::ListWarnRequest;
    use fleetwarden_shared::{ApprovalStatus, CpuStat, MemoryStat, NodeResourceLimit, VerifyStatus};
    use sea_orm::{ActiveModelTrait, Set};

    fn limited_node() -> NodeInfo {
        NodeInfo {
            id: 3,
            name: "edge".into(),
            address: "10.0.0.3".into(),
            rsc_limit: NodeResourceLimit {
                cpu_limit: 0.5,
                memory_limit: 1024.0,
                disk_limit: 0.0,
            },
            ..Default::default()
        }
    }

    #[test]
    fn unreachable_node_is_offline() {
        let warns = node_warnings(&limited_node(), None);
        assert_eq!(warns.len(), 1);
        assert_eq!(warns[0].event_type, WarnEvent::NodeOffline.as_i64());
        assert_eq!(warns[0].node_info, "edge (10.0.0.3)");
    }

    #[test]
    fn usage_over_limits_is_reported() {
        let status = NodeStatus {
            node_id: 3,
            state: NodeState::Online,
            cpu_stat: Some(CpuStat {
                total: 4.0,
                used: 3.0,
                used_percentage: 75.0,
            }),
            mem_stat: Some(MemoryStat {
                used: 512.0,
                ..Default::default()
            }),
            ..Default::default()
        };
        let warns = node_warnings(&limited_node(), Some(&status));
        assert_eq!(warns.len(), 1);
        assert_eq!(warns[0].event_type, WarnEvent::ResourceUsage.as_i64());
        assert_eq!(warns[0].detail, "cpu usage 75.00%");
    }

    #[test]
    fn gate_without_vip_is_master() {
        assert!(MasterGate::default().is_master());
        assert!(!MasterGate::new("no-such-if0", "10.9.9.9").is_master());
    }

    async fn watchdog(connector: Arc<FakeConnector>, addrs: &[&str]) -> (Watchdog, sea_orm::DatabaseConnection) {
        let fx = fixture(connector, addrs).await;
        let (logs, _writer) = LogService::new(fx.db.clone());
        let images = ImageService::new(fx.db.clone(), fx.registry.clone(), Arc::new(FakeRegistry::default()));
        let security = Arc::new(SecurityService::new(fx.db.clone(), fx.registry.clone()));
        let dog = Watchdog::new(
            MasterGate::default(),
            fx.registry.clone(),
            Arc::new(fx.service),
            images,
            security,
            logs,
        );
        (dog, fx.db)
    }

    #[tokio::test]
    async fn illegal_containers_are_stopped_and_reported() {
        let connector = Arc::new(FakeConnector::default());
        let agent = connector.add(
            "10.0.0.1",
            FakeAgent::default()
                .with_container("ok", "web:1.0", "running")
                .with_container("bad", "miner:latest", "running")
                .with_container("idle", "miner:latest", "exited"),
        );
        let (dog, db) = watchdog(connector, &["10.0.0.1"]).await;
        image_infos::ActiveModel {
            name: Set("web".into()),
            version: Set("1.0".into()),
            description: Set(String::new()),
            file_size: Set(0),
            image_id: Set(String::new()),
            reject_reason: Set(String::new()),
            approval_status: Set(ApprovalStatus::Pass.as_i16()),
            verify_status: Set(VerifyStatus::Pass.as_i16()),
            created_at: Set(0),
            updated_at: Set(0),
            ..Default::default()
        }
        .insert(&db)
        .await
        .unwrap();

        assert_eq!(dog.detect_illegal_containers().await.unwrap(), 1);
        assert_eq!(agent.state.lock().unwrap().stopped, vec!["bad".to_string()]);

        let warns = dog.logs.list_warn(&ListWarnRequest::default()).await.unwrap();
        assert_eq!(warns.logs.len(), 1);
        assert_eq!(warns.logs[0].container_name, "name-bad");
        assert_eq!(warns.logs[0].event_type, WarnEvent::IllegalContainer.as_i64());
    }

    #[tokio::test]
    async fn offline_nodes_raise_warnings_and_unread_counters() {
        let connector = Arc::new(FakeConnector::default());
        let agent = connector.add("10.0.0.1", FakeAgent::default());
        let (dog, _) = watchdog(connector, &["10.0.0.1"]).await;
        agent.set_down(true);

        assert_eq!(dog.check_nodes().await.unwrap(), 1);
        let id = node_id(&dog.nodes, "10.0.0.1").await;
        let node = dog.nodes.find(id).await.unwrap();
        assert_eq!(node.unread_warn, 1);
    }
}
