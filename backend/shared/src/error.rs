use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of failure kinds surfaced to controller callers and carried
/// across the controller/agent hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ContainerBasicConfigNoPerm,
    ContainerSecurityConfigNoPerm,
    Internal,
    DatabaseFail,
    Unauthenticated,
    WrongPassword,
    ContainerProcProtection,
    ContainerFileProtection,
    ContainerNprocProtection,
    ContainerCmdOperation,
    ContainerNetworkRule,
    RemoveContainerWhenRunning,
    RemoveContainerBackupWhenRunning,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 17] = [
        ErrorKind::InvalidArgument,
        ErrorKind::NotFound,
        ErrorKind::AlreadyExists,
        ErrorKind::PermissionDenied,
        ErrorKind::ContainerBasicConfigNoPerm,
        ErrorKind::ContainerSecurityConfigNoPerm,
        ErrorKind::Internal,
        ErrorKind::DatabaseFail,
        ErrorKind::Unauthenticated,
        ErrorKind::WrongPassword,
        ErrorKind::ContainerProcProtection,
        ErrorKind::ContainerFileProtection,
        ErrorKind::ContainerNprocProtection,
        ErrorKind::ContainerCmdOperation,
        ErrorKind::ContainerNetworkRule,
        ErrorKind::RemoveContainerWhenRunning,
        ErrorKind::RemoveContainerBackupWhenRunning,
    ];

    /// Stable wire code. The low values follow the gRPC status numbering,
    /// product specific kinds live above 1000.
    pub fn code(self) -> u32 {
        match self {
            ErrorKind::InvalidArgument => 3,
            ErrorKind::NotFound => 5,
            ErrorKind::AlreadyExists => 6,
            ErrorKind::PermissionDenied => 7,
            ErrorKind::Internal => 13,
            ErrorKind::Unauthenticated => 16,
            ErrorKind::DatabaseFail => 1001,
            ErrorKind::WrongPassword => 1002,
            ErrorKind::ContainerBasicConfigNoPerm => 1101,
            ErrorKind::ContainerSecurityConfigNoPerm => 1102,
            ErrorKind::ContainerProcProtection => 1201,
            ErrorKind::ContainerNprocProtection => 1202,
            ErrorKind::ContainerFileProtection => 1203,
            ErrorKind::ContainerCmdOperation => 1204,
            ErrorKind::ContainerNetworkRule => 1205,
            ErrorKind::RemoveContainerWhenRunning => 1301,
            ErrorKind::RemoveContainerBackupWhenRunning => 1302,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.code() == code)
    }

    pub fn default_message(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::NotFound => "resource not found",
            ErrorKind::AlreadyExists => "resource already exists",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::ContainerBasicConfigNoPerm => "no permission to change container basic config",
            ErrorKind::ContainerSecurityConfigNoPerm => "no permission to change container security config",
            ErrorKind::Internal => "internal error",
            ErrorKind::DatabaseFail => "database operation failed",
            ErrorKind::Unauthenticated => "request not authenticated",
            ErrorKind::WrongPassword => "wrong password",
            ErrorKind::ContainerProcProtection => "failed to apply process protection",
            ErrorKind::ContainerFileProtection => "failed to apply file protection",
            ErrorKind::ContainerNprocProtection => "failed to apply network process protection",
            ErrorKind::ContainerCmdOperation => "failed to apply command operation control",
            ErrorKind::ContainerNetworkRule => "failed to apply network rules",
            ErrorKind::RemoveContainerWhenRunning => "container is running, stop it before removing",
            ErrorKind::RemoveContainerBackupWhenRunning => "backup image is in use by the container",
        }
    }

    /// Both specialised permission kinds are still permission failures.
    pub fn is_permission_denied(self) -> bool {
        matches!(
            self,
            ErrorKind::PermissionDenied
                | ErrorKind::ContainerBasicConfigNoPerm
                | ErrorKind::ContainerSecurityConfigNoPerm
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.default_message())
    }
}

/// Error body returned with every non-2xx reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: u32,
    pub message: String,
}

impl RpcError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            code: kind.code(),
            message: message.into(),
        }
    }

    /// Unknown codes collapse to `Internal`.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::from_code(self.code).unwrap_or(ErrorKind::Internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn codes_are_unique_and_reversible() {
        let codes: HashSet<u32> = ErrorKind::ALL.iter().map(|k| k.code()).collect();
        assert_eq!(codes.len(), ErrorKind::ALL.len());
        for kind in ErrorKind::ALL {
            assert_eq!(ErrorKind::from_code(kind.code()), Some(kind));
        }
    }

    #[test]
    fn unknown_code_reads_as_internal() {
        let err = RpcError {
            code: 4242,
            message: "boom".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn specialised_permission_kinds() {
        assert!(ErrorKind::ContainerBasicConfigNoPerm.is_permission_denied());
        assert!(ErrorKind::ContainerSecurityConfigNoPerm.is_permission_denied());
        assert!(!ErrorKind::NotFound.is_permission_denied());
    }
}
