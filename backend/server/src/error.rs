use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use fleetwarden_services::ServiceError;
use fleetwarden_shared::ErrorKind;
use std::fmt;

/// Reply side of a [`ServiceError`]: an HTTP status plus the taxonomy code.
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError(err)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyExists
        | ErrorKind::RemoveContainerWhenRunning
        | ErrorKind::RemoveContainerBackupWhenRunning => StatusCode::CONFLICT,
        ErrorKind::PermissionDenied
        | ErrorKind::ContainerBasicConfigNoPerm
        | ErrorKind::ContainerSecurityConfigNoPerm => StatusCode::FORBIDDEN,
        ErrorKind::Unauthenticated | ErrorKind::WrongPassword => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        status_for(self.0.kind())
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(self.0.to_rpc())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;
    use fleetwarden_shared::RpcError;

    #[actix_web::test]
    async fn error_body_carries_the_taxonomy_code() {
        let resp = ApiError(ServiceError::NotFound("node 3".into())).error_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(resp.into_body()).await.unwrap();
        let rpc: RpcError = serde_json::from_slice(&body).unwrap();
        assert_eq!(rpc.kind(), ErrorKind::NotFound);
        assert!(rpc.message.contains("node 3"));
    }

    #[test]
    fn statuses_by_kind() {
        assert_eq!(status_for(ErrorKind::ContainerSecurityConfigNoPerm), StatusCode::FORBIDDEN);
        assert_eq!(status_for(ErrorKind::RemoveContainerWhenRunning), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::Unauthenticated), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(ErrorKind::ContainerNetworkRule), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
