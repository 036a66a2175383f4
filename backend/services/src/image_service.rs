use fleetwarden_shared::rpc::{AgentSyncRequest, ApproveImageRequest, ListImagesReply, PageRequest};
use fleetwarden_shared::{ApprovalStatus, ImageInfo, VerifyStatus};
use futures::future::join_all;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, Set,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::database::unix_now;
use crate::entity::{container_backups, image_infos, node_infos};
use crate::error::{ServiceError, ServiceResult};
use crate::pagination::fetch_page;
use crate::node_registry::NodeRegistry;
use crate::registry_client::ImageRegistry;

const NOTIFY_ATTEMPTS: usize = 3;

/// Where a permitted image reference comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    Upload,
    Backup,
}

#[derive(Clone)]
pub struct ImageService {
    db: DatabaseConnection,
    nodes: Arc<NodeRegistry>,
    registry: Arc<dyn ImageRegistry>,
}

impl ImageService {
    pub fn new(db: DatabaseConnection, nodes: Arc<NodeRegistry>, registry: Arc<dyn ImageRegistry>) -> Self {
        Self { db, nodes, registry }
    }

    pub async fn list(&self, req: &PageRequest) -> ServiceResult<ListImagesReply> {
        let select = image_infos::Entity::find().order_by_asc(image_infos::Column::Id);
        let (pager, rows) = fetch_page(&self.db, select, req.page_size, req.page_no).await?;
        Ok(ListImagesReply {
            page: pager.info(),
            images: rows.into_iter().map(to_image_info).collect(),
        })
    }

    /// Approves or rejects an uploaded image. Approval tells every node to
    /// pull it in the background.
    pub async fn approve(&self, req: &ApproveImageRequest) -> ServiceResult<()> {
        let row = image_infos::Entity::find_by_id(req.image_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("image {}", req.image_id)))?;

        let verified = VerifyStatus::from_i16(row.verify_status) == VerifyStatus::Pass;
        let status = if req.approve {
            if !verified {
                return Err(ServiceError::invalid("image failed verification and cannot be approved"));
            }
            ApprovalStatus::Pass
        } else {
            if req.reject_reason.is_empty() && verified {
                return Err(ServiceError::invalid("reject reason is required"));
            }
            ApprovalStatus::Reject
        };

        let reference = format!("{}:{}", row.name, row.version);
        let mut active = row.into_active_model();
        active.approval_status = Set(status.as_i16());
        active.reject_reason = Set(req.reject_reason.clone());
        active.updated_at = Set(unix_now());
        active.update(&self.db).await?;
        log::info!("image {} {:?}", reference, status);

        if req.approve {
            let this = self.clone();
            tokio::spawn(async move {
                this.notify_agents(AgentSyncRequest {
                    to_remove: Vec::new(),
                    to_pull: vec![reference],
                })
                .await;
            });
        }
        Ok(())
    }

    /// Drops the records, then removes the manifests from the registry and
    /// the local copies on every node in the background.
    pub async fn remove(&self, ids: &[i64]) -> ServiceResult<()> {
        if ids.is_empty() {
            return Err(ServiceError::invalid("empty image id list"));
        }
        let rows = image_infos::Entity::find()
            .filter(image_infos::Column::Id.is_in(ids.to_vec()))
            .all(&self.db)
            .await?;
        image_infos::Entity::delete_many()
            .filter(image_infos::Column::Id.is_in(ids.to_vec()))
            .exec(&self.db)
            .await?;

        let references: Vec<String> = rows.iter().map(|r| format!("{}:{}", r.name, r.version)).collect();
        if references.is_empty() {
            return Ok(());
        }
        let this = self.clone();
        tokio::spawn(async move {
            for reference in &references {
                if let Err(e) = this.registry.remove_image(reference).await {
                    log::info!("registry remove image {}: {}", reference, e);
                }
            }
            this.notify_agents(AgentSyncRequest {
                to_remove: references,
                to_pull: Vec::new(),
            })
            .await;
        });
        Ok(())
    }

    /// Sends `req` to every live node, retrying each a few times.
    pub async fn notify_agents(&self, req: AgentSyncRequest) {
        let nodes = match self.nodes.live_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                log::warn!("notify image sync: list nodes: {}", e);
                return;
            }
        };

        for node in nodes {
            let agent = match self.nodes.pool().get(&node.address).await {
                Ok(agent) => agent,
                Err(e) => {
                    log::warn!("notify image sync: connect {}: {}", node.address, e);
                    continue;
                }
            };
            for attempt in 1..=NOTIFY_ATTEMPTS {
                match agent.sync_images(&req).await {
                    Ok(()) => {
                        log::debug!("image sync {:?} sent to {}", req, node.address);
                        break;
                    }
                    Err(e) => log::info!(
                        "image sync on {} attempt {}/{}: {}",
                        node.address,
                        attempt,
                        NOTIFY_ATTEMPTS,
                        e
                    ),
                }
            }
        }
    }

    /// Every image reference a container may legitimately run: approved
    /// uploads plus the images produced by backups.
    pub async fn valid_images(&self) -> ServiceResult<HashMap<String, ImageSource>> {
        let approved = image_infos::Entity::find()
            .filter(image_infos::Column::ApprovalStatus.eq(ApprovalStatus::Pass.as_i16()))
            .all(&self.db)
            .await?;
        let backups = container_backups::Entity::find()
            .filter(container_backups::Column::ImageRef.ne(""))
            .all(&self.db)
            .await?;

        let mut valid = HashMap::with_capacity(approved.len() + backups.len());
        for image in approved {
            valid.insert(format!("{}:{}", image.name, image.version), ImageSource::Upload);
        }
        for backup in backups {
            valid.insert(backup.image_ref, ImageSource::Backup);
        }
        Ok(valid)
    }

    /// Queues approved images missing from each node for pulling. Nothing is
    /// ever removed here since backup images cannot be told apart safely.
    pub async fn sync_all(&self) -> ServiceResult<()> {
        let valid = self.valid_images().await?;
        let nodes = self.nodes.live_nodes().await?;
        join_all(nodes.iter().map(|n| self.sync_node(n, &valid))).await;
        Ok(())
    }

    async fn sync_node(&self, node: &node_infos::Model, valid: &HashMap<String, ImageSource>) {
        let agent = match self.nodes.pool().get(&node.address).await {
            Ok(agent) => agent,
            Err(e) => {
                log::warn!("image sync: connect {}: {}", node.address, e);
                return;
            }
        };
        let present: HashSet<String> = match agent.list_images().await {
            Ok(images) => images.into_iter().map(|i| i.name).collect(),
            Err(e) => {
                log::warn!("image list on {}: {}", node.address, e);
                return;
            }
        };

        let mut to_pull: Vec<String> = valid
            .iter()
            .filter(|(reference, source)| **source == ImageSource::Upload && !present.contains(*reference))
            .map(|(reference, _)| reference.clone())
            .collect();
        if to_pull.is_empty() {
            return;
        }
        to_pull.sort();

        let req = AgentSyncRequest {
            to_remove: Vec::new(),
            to_pull,
        };
        if let Err(e) = agent.sync_images(&req).await {
            log::warn!("image sync on {}: {}", node.address, e);
        }
    }
}

fn to_image_info(m: image_infos::Model) -> ImageInfo {
    ImageInfo {
        id: m.id,
        name: m.name,
        version: m.version,
        description: m.description,
        file_size: m.file_size,
        image_id: m.image_id,
        reject_reason: m.reject_reason,
        approval_status: ApprovalStatus::from_i16(m.approval_status),
        verify_status: VerifyStatus::from_i16(m.verify_status),
        created_at: m.created_at,
        updated_at: m.updated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container_service::tests::fixture;
    use crate::testing::{FakeAgent, FakeConnector, FakeRegistry};
    use fleetwarden_shared::{ErrorKind, NodeImage};

    async fn seed_image(db: &DatabaseConnection, name: &str, approval: ApprovalStatus, verify: VerifyStatus) -> i64 {
        let now = unix_now();
        image_infos::ActiveModel {
            name: Set(name.into()),
            version: Set("1.0".into()),
            description: Set(String::new()),
            file_size: Set(1024),
            image_id: Set(format!("sha256:{}", name)),
            reject_reason: Set(String::new()),
            approval_status: Set(approval.as_i16()),
            verify_status: Set(verify.as_i16()),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(db)
        .await
        .unwrap()
        .id
    }

    async fn service(connector: Arc<FakeConnector>, addrs: &[&str]) -> (ImageService, DatabaseConnection) {
        let fx = fixture(connector, addrs).await;
        let svc = ImageService::new(fx.db.clone(), fx.registry.clone(), Arc::new(FakeRegistry::default()));
        (svc, fx.db)
    }

    #[tokio::test]
    async fn approval_rules() {
        let (svc, db) = service(Arc::new(FakeConnector::default()), &[]).await;
        let unverified = seed_image(&db, "bad", ApprovalStatus::Wait, VerifyStatus::Fail).await;
        let verified = seed_image(&db, "good", ApprovalStatus::Wait, VerifyStatus::Pass).await;

        let approve = |image_id| ApproveImageRequest {
            image_id,
            approve: true,
            reject_reason: String::new(),
        };
        let reject = |image_id| ApproveImageRequest {
            image_id,
            approve: false,
            reject_reason: String::new(),
        };

        assert_eq!(svc.approve(&approve(unverified)).await.unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(svc.approve(&reject(verified)).await.unwrap_err().kind(), ErrorKind::InvalidArgument);
        svc.approve(&reject(unverified)).await.unwrap();
        svc.approve(&approve(verified)).await.unwrap();
        assert_eq!(svc.approve(&approve(999)).await.unwrap_err().kind(), ErrorKind::NotFound);

        let page = svc.list(&PageRequest::default()).await.unwrap();
        let status: Vec<ApprovalStatus> = page.images.iter().map(|i| i.approval_status).collect();
        assert_eq!(status, vec![ApprovalStatus::Reject, ApprovalStatus::Pass]);
    }

    #[tokio::test]
    async fn valid_images_cover_uploads_and_backups() {
        let (svc, db) = service(Arc::new(FakeConnector::default()), &[]).await;
        seed_image(&db, "web", ApprovalStatus::Pass, VerifyStatus::Pass).await;
        seed_image(&db, "pending", ApprovalStatus::Wait, VerifyStatus::Pass).await;
        container_backups::ActiveModel {
            node_id: Set(1),
            uuid: Set("u-1".into()),
            backup_name: Set("b".into()),
            backup_desc: Set(String::new()),
            image_ref: Set("backup/u-1:b".into()),
            image_id: Set(String::new()),
            image_size: Set(0),
            status: Set(1),
            created_at: Set(0),
            updated_at: Set(0),
            ..Default::default()
        }
        .insert(&db)
        .await
        .unwrap();

        let valid = svc.valid_images().await.unwrap();
        assert_eq!(valid.len(), 2);
        assert_eq!(valid.get("web:1.0"), Some(&ImageSource::Upload));
        assert_eq!(valid.get("backup/u-1:b"), Some(&ImageSource::Backup));
    }

    #[tokio::test]
    async fn sync_pulls_only_missing_uploads() {
        let connector = Arc::new(FakeConnector::default());
        let a = connector.add("10.0.0.1", FakeAgent::default());
        let b = connector.add("10.0.0.2", FakeAgent::default());
        b.state.lock().unwrap().images.push(NodeImage {
            name: "web:1.0".into(),
            ..Default::default()
        });
        let (svc, db) = service(connector, &["10.0.0.1", "10.0.0.2"]).await;
        seed_image(&db, "web", ApprovalStatus::Pass, VerifyStatus::Pass).await;

        svc.sync_all().await.unwrap();

        let syncs = a.state.lock().unwrap().syncs.clone();
        assert_eq!(syncs.len(), 1);
        assert_eq!(syncs[0].to_pull, vec!["web:1.0".to_string()]);
        assert!(syncs[0].to_remove.is_empty());
        assert!(b.state.lock().unwrap().syncs.is_empty());
    }

    #[tokio::test]
    async fn notify_skips_unreachable_nodes() {
        let connector = Arc::new(FakeConnector::default());
        let up = connector.add("10.0.0.1", FakeAgent::default());
        let down = connector.add("10.0.0.2", FakeAgent::default());
        let (svc, _) = service(connector, &["10.0.0.1", "10.0.0.2"]).await;
        down.set_down(true);

        svc.notify_agents(AgentSyncRequest {
            to_remove: vec![],
            to_pull: vec!["web:1.0".into()],
        })
        .await;

        assert_eq!(up.state.lock().unwrap().syncs.len(), 1);
        assert!(down.state.lock().unwrap().syncs.is_empty());
    }

    #[tokio::test]
    async fn remove_requires_ids_and_drops_rows() {
        let (svc, db) = service(Arc::new(FakeConnector::default()), &[]).await;
        let id = seed_image(&db, "web", ApprovalStatus::Pass, VerifyStatus::Pass).await;
        assert_eq!(svc.remove(&[]).await.unwrap_err().kind(), ErrorKind::InvalidArgument);
        svc.remove(&[id]).await.unwrap();
        assert!(svc.list(&PageRequest::default()).await.unwrap().images.is_empty());
    }
}
