use chrono::{DateTime, Local};
use fleetwarden_shared::rpc::{
    AddBackupJobRequest, AgentResumeBackupRequest, CreateBackupRequest, ResumeBackupRequest,
    UpdateBackupRequest,
};
use fleetwarden_shared::{BackupJob, BackupStatus, ContainerBackup};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, IntoActiveModel, QueryFilter, QueryOrder, Set};

use super::{ContainerService, parse_security};
use crate::database::unix_now;
use crate::entity::{container_backups, container_configs};
use crate::error::{ServiceError, ServiceResult};
use crate::validation::is_valid_desc;

/// A job that has not reached a terminal state after this long is abandoned.
pub const BACKUP_JOB_DEADLINE_SECS: i64 = 5 * 60;

/// `YYYYMMDDHHMMSS` followed by the zero-padded milliseconds of `now`.
pub fn backup_name(now: DateTime<Local>) -> String {
    format!("{}{:03}", now.format("%Y%m%d%H%M%S"), now.timestamp_subsec_millis())
}

impl ContainerService {
    /// Records a pending backup and hands the commit to the agent. The
    /// outcome is collected later by [`ContainerService::reconcile_backup_jobs`].
    pub async fn create_backup(&self, req: &CreateBackupRequest) -> ServiceResult<i64> {
        if req.node_id <= 0 || req.container_id.is_empty() {
            return Err(ServiceError::invalid("node id and container id are required"));
        } else if !is_valid_desc(&req.backup_desc) {
            return Err(ServiceError::invalid("backup description"));
        }

        let config = self.find_config(req.node_id, &req.container_id).await?;
        let (_, agent) = self.registry.connect(req.node_id).await?;

        let now = unix_now();
        let name = backup_name(Local::now());
        let row = container_backups::ActiveModel {
            node_id: Set(req.node_id),
            uuid: Set(config.uuid),
            backup_name: Set(name.clone()),
            backup_desc: Set(req.backup_desc.clone()),
            image_ref: Set(String::new()),
            image_id: Set(String::new()),
            image_size: Set(0),
            status: Set(BackupStatus::Pending.as_i16()),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&self.db)
        .await?;

        let job = AddBackupJobRequest {
            id: row.id,
            container_id: req.container_id.clone(),
            backup_name: name,
        };
        if let Err(e) = agent.add_backup_job(&job).await {
            log::warn!("start backup job {} failed: {}", row.id, e);
            let id = row.id;
            let mut active = row.into_active_model();
            active.status = Set(BackupStatus::Failed.as_i16());
            active.updated_at = Set(unix_now());
            if let Err(e) = active.update(&self.db).await {
                log::warn!("mark backup {} failed: {}", id, e);
            }
            return Err(ServiceError::internal(format!("start backup job: {}", e)));
        }

        log::info!("backup {} of {} queued", row.id, req.container_id);
        Ok(row.id)
    }

    pub async fn update_backup(&self, req: &UpdateBackupRequest) -> ServiceResult<()> {
        if !is_valid_desc(&req.backup_desc) {
            return Err(ServiceError::invalid("backup description"));
        }
        let row = self.find_backup(req.id).await?;
        let mut active = row.into_active_model();
        active.backup_desc = Set(req.backup_desc.clone());
        active.updated_at = Set(unix_now());
        active.update(&self.db).await?;
        Ok(())
    }

    /// Deletes the backup image on the node and then its record. Refused while
    /// the container still runs from that image.
    pub async fn remove_backup(&self, id: i64) -> ServiceResult<()> {
        let backup = self.find_backup(id).await?;
        let config = self.find_config_by_uuid(&backup.uuid).await?;
        if config.node_id != backup.node_id {
            return Err(ServiceError::internal(format!(
                "backup {} and its container live on different nodes",
                id
            )));
        }

        let (_, agent) = self.registry.connect(backup.node_id).await?;

        if !backup.image_ref.is_empty() {
            match agent.inspect_container(&config.container_id).await {
                Ok(current) if current.image == backup.image_ref => {
                    return Err(ServiceError::RemoveContainerBackupWhenRunning);
                }
                Ok(_) => {}
                Err(ServiceError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            agent.remove_backup(&backup.image_ref).await?;
        }

        container_backups::Entity::delete_by_id(backup.id)
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Recreates the container from a finished backup, keeping its uuid and
    /// stored security config. Returns the new runtime id.
    pub async fn resume_backup(&self, req: &ResumeBackupRequest) -> ServiceResult<String> {
        let backup = self.find_backup(req.backup_id).await?;
        if BackupStatus::from_i16(backup.status) != BackupStatus::Succeeded {
            log::info!("backup {} is not usable, status={}", backup.id, backup.status);
            return Err(ServiceError::invalid("backup has not succeeded"));
        }

        let config = self.find_config_by_uuid(&backup.uuid).await?;
        let (_, agent) = self.registry.connect(backup.node_id).await?;

        let container_id = if req.container_id.is_empty() {
            config.container_id.clone()
        } else {
            req.container_id.clone()
        };

        let new_id = agent
            .resume_backup(&AgentResumeBackupRequest {
                container_id,
                image_ref: backup.image_ref.clone(),
                security_config: Some(parse_security(&config.security_config)),
            })
            .await?;

        let mut active = config.into_active_model();
        active.container_id = Set(new_id.clone());
        active.updated_at = Set(unix_now());
        if let Err(e) = active.update(&self.db).await {
            log::warn!("store resumed container id {}: {}", new_id, e);
        }
        Ok(new_id)
    }

    pub async fn list_backups(&self, node_id: i64, container_id: &str) -> ServiceResult<Vec<ContainerBackup>> {
        let config = self.find_config(node_id, container_id).await?;
        let rows = container_backups::Entity::find()
            .filter(container_backups::Column::Uuid.eq(config.uuid))
            .order_by_asc(container_backups::Column::Id)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(to_backup).collect())
    }

    /// Polls the agent for every pending backup. Terminal or abandoned jobs
    /// are copied into the record and released on the agent.
    pub async fn reconcile_backup_jobs(&self) -> ServiceResult<()> {
        let pending = container_backups::Entity::find()
            .filter(container_backups::Column::Status.eq(BackupStatus::Pending.as_i16()))
            .order_by_asc(container_backups::Column::Id)
            .all(&self.db)
            .await?;

        for backup in pending {
            let agent = match self.registry.connect(backup.node_id).await {
                Ok((_, agent)) => agent,
                Err(e) => {
                    log::warn!("backup {}: node {} unavailable: {}", backup.id, backup.node_id, e);
                    continue;
                }
            };

            let job = match agent.get_backup_job(backup.id).await {
                Ok(job) => job,
                Err(e) => {
                    log::warn!("get backup job {}: {}", backup.id, e);
                    continue;
                }
            };

            let Some(status) = settled_status(&job, unix_now()) else {
                continue;
            };

            let id = backup.id;
            let mut active = backup.into_active_model();
            active.image_ref = Set(job.image_ref);
            active.image_id = Set(job.image_id);
            active.image_size = Set(job.image_size);
            active.status = Set(status.as_i16());
            active.updated_at = Set(unix_now());
            if let Err(e) = active.update(&self.db).await {
                log::warn!("update backup {}: {}", id, e);
                continue;
            }
            log::info!("backup {} settled as {:?}", id, status);

            if let Err(e) = agent.del_backup_job(id).await {
                log::warn!("release backup job {}: {}", id, e);
            }
        }
        Ok(())
    }

    async fn find_backup(&self, id: i64) -> ServiceResult<container_backups::Model> {
        container_backups::Entity::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("backup {}", id)))
    }

    async fn find_config_by_uuid(&self, uuid: &str) -> ServiceResult<container_configs::Model> {
        container_configs::Entity::find()
            .filter(container_configs::Column::Uuid.eq(uuid))
            .one(&self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("container uuid {}", uuid)))
    }
}

/// Final status of a job, or `None` while it may still finish.
fn settled_status(job: &BackupJob, now: i64) -> Option<BackupStatus> {
    if job.status.is_terminal() {
        Some(job.status)
    } else if now - job.updated_at > BACKUP_JOB_DEADLINE_SECS {
        Some(BackupStatus::Failed)
    } else {
        None
    }
}

fn to_backup(b: container_backups::Model) -> ContainerBackup {
    ContainerBackup {
        id: b.id,
        node_id: b.node_id,
        uuid: b.uuid,
        backup_name: b.backup_name,
        backup_desc: b.backup_desc,
        image_ref: b.image_ref,
        image_id: b.image_id,
        image_size: b.image_size,
        status: BackupStatus::from_i16(b.status),
        created_at: b.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{fixture, node_id};
    use super::*;
    use crate::permission::Caller;
    use crate::testing::{FakeAgent, FakeConnector};
    use chrono::TimeZone;
    use fleetwarden_shared::rpc::CreateContainerRequest;
    use fleetwarden_shared::{ContainerConfigs, ErrorKind};
    use std::sync::Arc;

    #[test]
    fn backup_names_carry_milliseconds() {
        let t = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap()
            + chrono::Duration::milliseconds(42);
        assert_eq!(backup_name(t), "20240309070501042");
    }

    #[test]
    fn stale_jobs_settle_as_failed() {
        let mut job = BackupJob {
            updated_at: 1_000,
            ..Default::default()
        };
        assert_eq!(settled_status(&job, 1_000 + 60), None);
        assert_eq!(
            settled_status(&job, 1_000 + BACKUP_JOB_DEADLINE_SECS + 1),
            Some(BackupStatus::Failed)
        );
        job.status = BackupStatus::Succeeded;
        assert_eq!(settled_status(&job, 1_000), Some(BackupStatus::Succeeded));
    }

    async fn setup() -> (super::super::tests::Fixture, Arc<FakeAgent>, i64, String) {
        let connector = Arc::new(FakeConnector::default());
        let agent = connector.add("10.0.0.1", FakeAgent::default());
        let fx = fixture(connector, &["10.0.0.1"]).await;
        let node = node_id(&fx.registry, "10.0.0.1").await;
        let id = fx
            .service
            .create(
                &Caller::system(),
                &CreateContainerRequest {
                    node_id: node,
                    configs: ContainerConfigs {
                        name: "db".into(),
                        image: "postgres:16".into(),
                        ..Default::default()
                    },
                },
            )
            .await
            .unwrap();
        (fx, agent, node, id)
    }

    #[tokio::test]
    async fn abandoned_job_is_failed_and_released_once() {
        let (fx, agent, node, cid) = setup().await;
        let backup_id = fx
            .service
            .create_backup(&CreateBackupRequest {
                node_id: node,
                container_id: cid.clone(),
                backup_desc: "nightly".into(),
            })
            .await
            .unwrap();

        // job still running and fresh
        agent.state.lock().unwrap().jobs.get_mut(&backup_id).unwrap().updated_at = unix_now();
        fx.service.reconcile_backup_jobs().await.unwrap();
        assert!(agent.state.lock().unwrap().deleted_jobs.is_empty());

        agent.state.lock().unwrap().jobs.get_mut(&backup_id).unwrap().updated_at =
            unix_now() - BACKUP_JOB_DEADLINE_SECS - 10;
        fx.service.reconcile_backup_jobs().await.unwrap();
        fx.service.reconcile_backup_jobs().await.unwrap();

        assert_eq!(agent.state.lock().unwrap().deleted_jobs, vec![backup_id]);
        let list = fx.service.list_backups(node, &cid).await.unwrap();
        assert_eq!(list[0].status, BackupStatus::Failed);
    }

    #[tokio::test]
    async fn finished_job_enables_resume() {
        let (fx, agent, node, cid) = setup().await;
        let backup_id = fx
            .service
            .create_backup(&CreateBackupRequest {
                node_id: node,
                container_id: cid.clone(),
                backup_desc: String::new(),
            })
            .await
            .unwrap();

        let resume = ResumeBackupRequest {
            node_id: node,
            container_id: cid.clone(),
            backup_id,
        };
        let err = fx.service.resume_backup(&resume).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        {
            let mut s = agent.state.lock().unwrap();
            let job = s.jobs.get_mut(&backup_id).unwrap();
            job.status = BackupStatus::Succeeded;
            job.image_ref = "postgres:20240309070501".into();
            job.image_id = "abc".into();
        }
        fx.service.reconcile_backup_jobs().await.unwrap();

        let new_id = fx.service.resume_backup(&resume).await.unwrap();
        assert_eq!(new_id, format!("{}-resumed", cid));
        assert!(fx.service.find_config(node, &new_id).await.is_ok());
        let resumed = agent.state.lock().unwrap().resumed[0].clone();
        assert_eq!(resumed.image_ref, "postgres:20240309070501");
    }

    #[tokio::test]
    async fn backup_in_use_cannot_be_removed() {
        let (fx, agent, node, cid) = setup().await;
        let backup_id = fx
            .service
            .create_backup(&CreateBackupRequest {
                node_id: node,
                container_id: cid.clone(),
                backup_desc: String::new(),
            })
            .await
            .unwrap();
        {
            let mut s = agent.state.lock().unwrap();
            let job = s.jobs.get_mut(&backup_id).unwrap();
            job.status = BackupStatus::Succeeded;
            job.image_ref = "postgres:snap".into();
            s.configs.get_mut(&cid).unwrap().image = "postgres:snap".into();
        }
        fx.service.reconcile_backup_jobs().await.unwrap();

        let err = fx.service.remove_backup(backup_id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoveContainerBackupWhenRunning);

        agent.state.lock().unwrap().configs.get_mut(&cid).unwrap().image = "postgres:16".into();
        fx.service.remove_backup(backup_id).await.unwrap();
        assert_eq!(agent.state.lock().unwrap().removed_backups, vec!["postgres:snap".to_string()]);
        assert!(fx.service.list_backups(node, &cid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_job_marks_backup_failed() {
        let (fx, agent, node, cid) = setup().await;
        agent.state.lock().unwrap().add_job_error = Some(ServiceError::internal("disk full"));
        let err = fx
            .service
            .create_backup(&CreateBackupRequest {
                node_id: node,
                container_id: cid.clone(),
                backup_desc: String::new(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        let list = fx.service.list_backups(node, &cid).await.unwrap();
        assert_eq!(list[0].status, BackupStatus::Failed);
    }
}
