use fleetwarden_shared::{ErrorKind, RpcError};
use sea_orm::{DbErr, SqlErr};
use thiserror::Error;

/// Domain error shared by controller services and the agent runtime driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("no permission to change container basic config")]
    ContainerBasicConfigNoPerm,
    #[error("no permission to change container security config")]
    ContainerSecurityConfigNoPerm,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("database error: {0}")]
    DatabaseFail(String),
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("wrong password")]
    WrongPassword,
    #[error("process protection: {0}")]
    ContainerProcProtection(String),
    #[error("file protection: {0}")]
    ContainerFileProtection(String),
    #[error("network process protection: {0}")]
    ContainerNprocProtection(String),
    #[error("command operation control: {0}")]
    ContainerCmdOperation(String),
    #[error("network rule: {0}")]
    ContainerNetworkRule(String),
    #[error("container is running")]
    RemoveContainerWhenRunning,
    #[error("backup image is used by the container")]
    RemoveContainerBackupWhenRunning,
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn internal(msg: impl Into<String>) -> Self {
        ServiceError::Internal(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        ServiceError::InvalidArgument(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ServiceError::NotFound(_) => ErrorKind::NotFound,
            ServiceError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            ServiceError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            ServiceError::ContainerBasicConfigNoPerm => ErrorKind::ContainerBasicConfigNoPerm,
            ServiceError::ContainerSecurityConfigNoPerm => ErrorKind::ContainerSecurityConfigNoPerm,
            ServiceError::Internal(_) => ErrorKind::Internal,
            ServiceError::DatabaseFail(_) => ErrorKind::DatabaseFail,
            ServiceError::Unauthenticated => ErrorKind::Unauthenticated,
            ServiceError::WrongPassword => ErrorKind::WrongPassword,
            ServiceError::ContainerProcProtection(_) => ErrorKind::ContainerProcProtection,
            ServiceError::ContainerFileProtection(_) => ErrorKind::ContainerFileProtection,
            ServiceError::ContainerNprocProtection(_) => ErrorKind::ContainerNprocProtection,
            ServiceError::ContainerCmdOperation(_) => ErrorKind::ContainerCmdOperation,
            ServiceError::ContainerNetworkRule(_) => ErrorKind::ContainerNetworkRule,
            ServiceError::RemoveContainerWhenRunning => ErrorKind::RemoveContainerWhenRunning,
            ServiceError::RemoveContainerBackupWhenRunning => {
                ErrorKind::RemoveContainerBackupWhenRunning
            }
        }
    }

    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::InvalidArgument => ServiceError::InvalidArgument(message),
            ErrorKind::NotFound => ServiceError::NotFound(message),
            ErrorKind::AlreadyExists => ServiceError::AlreadyExists(message),
            ErrorKind::PermissionDenied => ServiceError::PermissionDenied(message),
            ErrorKind::ContainerBasicConfigNoPerm => ServiceError::ContainerBasicConfigNoPerm,
            ErrorKind::ContainerSecurityConfigNoPerm => ServiceError::ContainerSecurityConfigNoPerm,
            ErrorKind::Internal => ServiceError::Internal(message),
            ErrorKind::DatabaseFail => ServiceError::DatabaseFail(message),
            ErrorKind::Unauthenticated => ServiceError::Unauthenticated,
            ErrorKind::WrongPassword => ServiceError::WrongPassword,
            ErrorKind::ContainerProcProtection => ServiceError::ContainerProcProtection(message),
            ErrorKind::ContainerFileProtection => ServiceError::ContainerFileProtection(message),
            ErrorKind::ContainerNprocProtection => ServiceError::ContainerNprocProtection(message),
            ErrorKind::ContainerCmdOperation => ServiceError::ContainerCmdOperation(message),
            ErrorKind::ContainerNetworkRule => ServiceError::ContainerNetworkRule(message),
            ErrorKind::RemoveContainerWhenRunning => ServiceError::RemoveContainerWhenRunning,
            ErrorKind::RemoveContainerBackupWhenRunning => {
                ServiceError::RemoveContainerBackupWhenRunning
            }
        }
    }

    pub fn to_rpc(&self) -> RpcError {
        RpcError::new(self.kind(), self.to_string())
    }
}

impl From<RpcError> for ServiceError {
    fn from(err: RpcError) -> Self {
        ServiceError::from_kind(err.kind(), err.message)
    }
}

impl From<DbErr> for ServiceError {
    fn from(err: DbErr) -> Self {
        if let Some(SqlErr::UniqueConstraintViolation(msg)) = err.sql_err() {
            return ServiceError::AlreadyExists(msg);
        }
        match err {
            DbErr::RecordNotFound(msg) => ServiceError::NotFound(msg),
            other => {
                log::warn!("database error: {}", other);
                ServiceError::DatabaseFail(other.to_string())
            }
        }
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        ServiceError::Internal(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Internal(format!("json: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_survive_the_wire() {
        for kind in ErrorKind::ALL {
            let err = ServiceError::from_kind(kind, "detail");
            assert_eq!(err.kind(), kind);
            let back: ServiceError = err.to_rpc().into();
            assert_eq!(back.kind(), kind);
        }
    }

    #[test]
    fn record_not_found_maps_to_not_found() {
        let err: ServiceError = DbErr::RecordNotFound("node_infos".into()).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn other_db_errors_are_database_fail() {
        let err: ServiceError = DbErr::Custom("boom".into()).into();
        assert_eq!(err.kind(), ErrorKind::DatabaseFail);
    }
}
