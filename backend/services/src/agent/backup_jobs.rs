//! Persistent table of asynchronous container commits, kept in a JSON file
//! so that the controller can poll the outcome after an agent restart.

use file_lock::{FileLock, FileOptions};
use fleetwarden_shared::{BackupJob, BackupStatus};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::database::unix_now;
use crate::error::{ServiceError, ServiceResult};

type Jobs = BTreeMap<i64, BackupJob>;

pub struct BackupJobStore {
    path: Arc<PathBuf>,
    guard: Mutex<()>,
}

impl BackupJobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            guard: Mutex::new(()),
        }
    }

    /// Read, mutate and write the job file as one step. The in-process mutex
    /// serialises tasks, the file lock serialises processes.
    async fn with_jobs<T, F>(&self, f: F) -> ServiceResult<T>
    where
        F: FnOnce(&mut Jobs) -> ServiceResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let _held = self.guard.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let lock_path = lock_path(&path);
            let options = FileOptions::new().write(true).create(true).read(true);
            let _lock = FileLock::lock(&lock_path, true, options).map_err(|e| {
                ServiceError::internal(format!("lock {}: {}", lock_path.display(), e))
            })?;

            let mut jobs = read_jobs(&path)?;
            let result = f(&mut jobs)?;
            write_jobs(&path, &jobs)?;
            Ok(result)
        })
        .await
        .map_err(|e| ServiceError::internal(format!("backup job store: {}", e)))?
    }

    pub async fn add(&self, id: i64, container_id: &str, backup_name: &str) -> ServiceResult<BackupJob> {
        let job = BackupJob {
            id,
            container_id: container_id.to_owned(),
            backup_name: backup_name.to_owned(),
            status: BackupStatus::Pending,
            updated_at: unix_now(),
            ..Default::default()
        };
        let stored = job.clone();
        self.with_jobs(move |jobs| {
            if jobs.contains_key(&id) {
                return Err(ServiceError::AlreadyExists(format!("backup job {}", id)));
            }
            jobs.insert(id, stored);
            Ok(())
        })
        .await?;
        Ok(job)
    }

    /// Stores the new state of a job that is still tracked. A job the
    /// controller already released is dropped, so a commit finishing late
    /// cannot bring it back.
    pub async fn update(&self, mut job: BackupJob) -> ServiceResult<()> {
        job.updated_at = unix_now();
        self.with_jobs(move |jobs| {
            match jobs.get_mut(&job.id) {
                Some(slot) => *slot = job,
                None => log::info!(
                    "backup job {} was released, dropping status {:?}",
                    job.id,
                    job.status
                ),
            }
            Ok(())
        })
        .await
    }

    pub async fn get(&self, id: i64) -> ServiceResult<BackupJob> {
        self.with_jobs(move |jobs| {
            jobs.get(&id)
                .cloned()
                .ok_or_else(|| ServiceError::NotFound(format!("backup job {}", id)))
        })
        .await
    }

    pub async fn del(&self, id: i64) -> ServiceResult<()> {
        self.with_jobs(move |jobs| {
            jobs.remove(&id);
            Ok(())
        })
        .await
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn read_jobs(path: &Path) -> ServiceResult<Jobs> {
    match std::fs::read(path) {
        Ok(data) if data.is_empty() => Ok(Jobs::new()),
        Ok(data) => serde_json::from_slice(&data).map_err(|e| {
            log::warn!("parse backup job file {}: {}", path.display(), e);
            ServiceError::from(e)
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Jobs::new()),
        Err(e) => {
            log::warn!("read backup job file {}: {}", path.display(), e);
            Err(ServiceError::internal(format!("read {}: {}", path.display(), e)))
        }
    }
}

fn write_jobs(path: &Path, jobs: &Jobs) -> ServiceResult<()> {
    let data = serde_json::to_vec_pretty(jobs)?;
    std::fs::write(path, data).map_err(|e| {
        log::warn!("write backup job file {}: {}", path.display(), e);
        ServiceError::internal(format!("write {}: {}", path.display(), e))
    })
}

/// Reference a backup of `image` is committed under: the image's repository
/// tagged with the backup name.
pub fn backup_reference(image: &str, backup_name: &str) -> String {
    let repo = match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => repo,
        _ => image,
    };
    format!("{}:{}", repo, backup_name)
}
