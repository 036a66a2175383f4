use actix_web::{HttpRequest, HttpResponse, web};
use fleetwarden_services::container_service::BatchOp;
use fleetwarden_services::{
    Caller, ContainerService, ImageService, LogService, NodeRegistry, SecurityService, ServiceError,
    ServiceResult,
};
use fleetwarden_shared::rpc::*;
use fleetwarden_shared::{EventModule, RuntimeLog};
use serde::Serialize;
use std::sync::Arc;

use crate::error::ApiResult;

pub const USER_ID_HEADER: &str = "X-User-Id";
pub const PERMISSIONS_HEADER: &str = "X-User-Permissions";

pub struct AppState {
    pub nodes: Arc<NodeRegistry>,
    pub containers: Arc<ContainerService>,
    pub images: ImageService,
    pub security: Arc<SecurityService>,
    pub logs: LogService,
    pub check_auth: bool,
    pub check_perm: bool,
}

type State = web::Data<AppState>;

/// Identity forwarded by the authentication layer in front of the controller.
fn caller(state: &AppState, req: &HttpRequest) -> Result<Caller, ServiceError> {
    let header = |name: &str| req.headers().get(name).and_then(|v| v.to_str().ok());

    let user_id = match header(USER_ID_HEADER) {
        Some(raw) => Some(
            raw.trim()
                .parse::<i64>()
                .map_err(|_| ServiceError::Unauthenticated)?,
        ),
        None => None,
    };
    if state.check_auth && user_id.is_none() {
        log::info!("request {} without caller identity", req.path());
        return Err(ServiceError::Unauthenticated);
    }

    let permissions = header(PERMISSIONS_HEADER)
        .map(Caller::parse_permissions)
        .unwrap_or_default();
    Ok(Caller::new(user_id, permissions, state.check_perm))
}

/// Queues an audit record for a mutating request.
fn audit<Req: Serialize, T>(
    state: &AppState,
    caller: &Caller,
    module: EventModule,
    target: &str,
    node_id: i64,
    req: &Req,
    result: &ServiceResult<T>,
) {
    let (status_code, error) = match result {
        Ok(_) => (0, String::new()),
        Err(e) => (i64::from(e.kind().code()), e.to_string()),
    };
    state.logs.record_runtime(RuntimeLog {
        node_id,
        user_id: caller.user_id.unwrap_or_default(),
        event_module: module.as_i64(),
        target: target.to_string(),
        detail: serde_json::to_string(req).unwrap_or_default(),
        status_code,
        error,
        ..Default::default()
    });
}

fn ok<T: Serialize>(value: T) -> ApiResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(value))
}

fn done() -> ApiResult<HttpResponse> {
    ok(Empty {})
}

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

pub async fn list_containers(state: State, http: HttpRequest, req: web::Json<ListContainersRequest>) -> ApiResult<HttpResponse> {
    caller(&state, &http)?;
    ok(state.containers.list(&req).await?)
}

pub async fn create_container(state: State, http: HttpRequest, req: web::Json<CreateContainerRequest>) -> ApiResult<HttpResponse> {
    let caller = caller(&state, &http)?;
    let result = state.containers.create(&caller, &req).await;
    audit(&state, &caller, EventModule::Container, "container/create", req.node_id, &*req, &result);
    ok(CreateContainerReply {
        container_id: result?,
        error: None,
    })
}

async fn batch(
    state: State,
    http: HttpRequest,
    req: web::Json<ContainerBatchRequest>,
    op: BatchOp,
) -> ApiResult<HttpResponse> {
    let caller = caller(&state, &http)?;
    let result = state.containers.batch(op, &req).await;
    let node_id = req.ids.first().map(|l| l.node_id).unwrap_or_default();
    let target = format!("container/{}", op.name());
    audit(&state, &caller, EventModule::Container, &target, node_id, &*req, &result);
    ok(result?)
}

pub async fn start_containers(state: State, http: HttpRequest, req: web::Json<ContainerBatchRequest>) -> ApiResult<HttpResponse> {
    batch(state, http, req, BatchOp::Start).await
}

pub async fn stop_containers(state: State, http: HttpRequest, req: web::Json<ContainerBatchRequest>) -> ApiResult<HttpResponse> {
    batch(state, http, req, BatchOp::Stop).await
}

pub async fn kill_containers(state: State, http: HttpRequest, req: web::Json<ContainerBatchRequest>) -> ApiResult<HttpResponse> {
    batch(state, http, req, BatchOp::Kill).await
}

pub async fn restart_containers(state: State, http: HttpRequest, req: web::Json<ContainerBatchRequest>) -> ApiResult<HttpResponse> {
    batch(state, http, req, BatchOp::Restart).await
}

pub async fn remove_containers(state: State, http: HttpRequest, req: web::Json<ContainerBatchRequest>) -> ApiResult<HttpResponse> {
    batch(state, http, req, BatchOp::Remove).await
}

pub async fn inspect_container(state: State, http: HttpRequest, req: web::Json<InspectContainerRequest>) -> ApiResult<HttpResponse> {
    caller(&state, &http)?;
    let configs = state.containers.inspect(req.node_id, &req.container_id).await?;
    ok(InspectContainerReply { configs })
}

pub async fn update_container(state: State, http: HttpRequest, req: web::Json<UpdateContainerRequest>) -> ApiResult<HttpResponse> {
    let caller = caller(&state, &http)?;
    let result = state.containers.update(&caller, &req).await;
    audit(&state, &caller, EventModule::Container, "container/update", req.node_id, &*req, &result);
    result?;
    done()
}

pub async fn monitor_history(state: State, http: HttpRequest, req: web::Json<MonitorHistoryRequest>) -> ApiResult<HttpResponse> {
    caller(&state, &http)?;
    ok(state.containers.monitor_history(&req).await?)
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

pub async fn list_templates(state: State, http: HttpRequest, req: web::Json<PageRequest>) -> ApiResult<HttpResponse> {
    caller(&state, &http)?;
    ok(state.containers.list_templates(&req).await?)
}

pub async fn create_template(state: State, http: HttpRequest, req: web::Json<TemplateRequest>) -> ApiResult<HttpResponse> {
    let caller = caller(&state, &http)?;
    let result = state.containers.create_template(&req).await;
    audit(&state, &caller, EventModule::Container, "template/create", req.node_id, &*req, &result);
    ok(IdRequest { id: result? })
}

pub async fn update_template(state: State, http: HttpRequest, req: web::Json<TemplateRequest>) -> ApiResult<HttpResponse> {
    let caller = caller(&state, &http)?;
    let result = state.containers.update_template(&req).await;
    audit(&state, &caller, EventModule::Container, "template/update", req.node_id, &*req, &result);
    result?;
    done()
}

pub async fn remove_templates(state: State, http: HttpRequest, req: web::Json<IdsRequest>) -> ApiResult<HttpResponse> {
    let caller = caller(&state, &http)?;
    let result = state.containers.remove_templates(&req.ids).await;
    audit(&state, &caller, EventModule::Container, "template/remove", 0, &*req, &result);
    result?;
    done()
}

pub async fn inspect_template(state: State, http: HttpRequest, req: web::Json<IdRequest>) -> ApiResult<HttpResponse> {
    caller(&state, &http)?;
    ok(state.containers.inspect_template(req.id).await?)
}

// ---------------------------------------------------------------------------
// Backups
// ---------------------------------------------------------------------------

pub async fn create_backup(state: State, http: HttpRequest, req: web::Json<CreateBackupRequest>) -> ApiResult<HttpResponse> {
    let caller = caller(&state, &http)?;
    let result = state.containers.create_backup(&req).await;
    audit(&state, &caller, EventModule::Container, "backup/create", req.node_id, &*req, &result);
    ok(IdRequest { id: result? })
}

pub async fn update_backup(state: State, http: HttpRequest, req: web::Json<UpdateBackupRequest>) -> ApiResult<HttpResponse> {
    let caller = caller(&state, &http)?;
    let result = state.containers.update_backup(&req).await;
    audit(&state, &caller, EventModule::Container, "backup/update", 0, &*req, &result);
    result?;
    done()
}

pub async fn remove_backup(state: State, http: HttpRequest, req: web::Json<IdRequest>) -> ApiResult<HttpResponse> {
    let caller = caller(&state, &http)?;
    let result = state.containers.remove_backup(req.id).await;
    audit(&state, &caller, EventModule::Container, "backup/remove", 0, &*req, &result);
    result?;
    done()
}

pub async fn resume_backup(state: State, http: HttpRequest, req: web::Json<ResumeBackupRequest>) -> ApiResult<HttpResponse> {
    let caller = caller(&state, &http)?;
    let result = state.containers.resume_backup(&req).await;
    audit(&state, &caller, EventModule::Container, "backup/resume", req.node_id, &*req, &result);
    ok(ResumeBackupReply { container_id: result? })
}

pub async fn list_backups(state: State, http: HttpRequest, req: web::Json<InspectContainerRequest>) -> ApiResult<HttpResponse> {
    caller(&state, &http)?;
    let data = state.containers.list_backups(req.node_id, &req.container_id).await?;
    ok(ListBackupReply { data })
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

pub async fn list_nodes(state: State, http: HttpRequest) -> ApiResult<HttpResponse> {
    caller(&state, &http)?;
    ok(ListNodesReply { nodes: state.nodes.list().await? })
}

pub async fn create_node(state: State, http: HttpRequest, req: web::Json<CreateNodeRequest>) -> ApiResult<HttpResponse> {
    let caller = caller(&state, &http)?;
    let result = state.nodes.create(req.0.clone()).await;
    audit(&state, &caller, EventModule::Node, "node/create", 0, &*req, &result);
    result?;
    done()
}

pub async fn remove_nodes(state: State, http: HttpRequest, req: web::Json<IdsRequest>) -> ApiResult<HttpResponse> {
    let caller = caller(&state, &http)?;
    let result = state.nodes.remove(&req.ids).await;
    audit(&state, &caller, EventModule::Node, "node/remove", 0, &*req, &result);
    result?;
    done()
}

pub async fn update_node(state: State, http: HttpRequest, req: web::Json<UpdateNodeRequest>) -> ApiResult<HttpResponse> {
    let caller = caller(&state, &http)?;
    let result = state.nodes.update(req.0.clone()).await;
    audit(&state, &caller, EventModule::Node, "node/update", req.node_id, &*req, &result);
    result?;
    done()
}

pub async fn node_status(state: State, http: HttpRequest, req: web::Json<NodeStatusRequest>) -> ApiResult<HttpResponse> {
    caller(&state, &http)?;
    ok(NodeStatusReply {
        status_list: state.nodes.status(&req.node_ids).await?,
    })
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

pub async fn list_images(state: State, http: HttpRequest, req: web::Json<PageRequest>) -> ApiResult<HttpResponse> {
    caller(&state, &http)?;
    ok(state.images.list(&req).await?)
}

pub async fn approve_image(state: State, http: HttpRequest, req: web::Json<ApproveImageRequest>) -> ApiResult<HttpResponse> {
    let caller = caller(&state, &http)?;
    let result = state.images.approve(&req).await;
    audit(&state, &caller, EventModule::Image, "image/approve", 0, &*req, &result);
    result?;
    done()
}

pub async fn remove_images(state: State, http: HttpRequest, req: web::Json<IdsRequest>) -> ApiResult<HttpResponse> {
    let caller = caller(&state, &http)?;
    let result = state.images.remove(&req.ids).await;
    audit(&state, &caller, EventModule::Image, "image/remove", 0, &*req, &result);
    result?;
    done()
}

// ---------------------------------------------------------------------------
// Networks, proxied to the node's agent
// ---------------------------------------------------------------------------

pub async fn list_networks(state: State, http: HttpRequest, req: web::Json<NodeRequest>) -> ApiResult<HttpResponse> {
    caller(&state, &http)?;
    let (_, agent) = state.nodes.connect(req.node_id).await?;
    ok(ListNetworksReply {
        bridges: agent.list_networks().await?,
    })
}

pub async fn connect_network(state: State, http: HttpRequest, req: web::Json<ConnectNetworkRequest>) -> ApiResult<HttpResponse> {
    let caller = caller(&state, &http)?;
    let result = async {
        let (_, agent) = state.nodes.connect(req.node_id).await?;
        agent.connect_network(&req.network).await
    }
    .await;
    audit(&state, &caller, EventModule::Container, "network/connect", req.node_id, &*req, &result);
    result?;
    done()
}

pub async fn disconnect_network(state: State, http: HttpRequest, req: web::Json<DisconnectNetworkRequest>) -> ApiResult<HttpResponse> {
    let caller = caller(&state, &http)?;
    let result = async {
        let (_, agent) = state.nodes.connect(req.node_id).await?;
        agent.disconnect_network(&req.interface, &req.container_id).await
    }
    .await;
    audit(&state, &caller, EventModule::Container, "network/disconnect", req.node_id, &*req, &result);
    result?;
    done()
}

// ---------------------------------------------------------------------------
// Security
// ---------------------------------------------------------------------------

pub async fn update_file_protection(
    state: State,
    http: HttpRequest,
    req: web::Json<UpdateFileProtectionRequest>,
) -> ApiResult<HttpResponse> {
    let caller = caller(&state, &http)?;
    let result = state.security.update_file_protection(&req).await;
    audit(&state, &caller, EventModule::Security, "security/file_protection/update", req.node_id, &*req, &result);
    result?;
    done()
}

pub async fn update_proc_protection(
    state: State,
    http: HttpRequest,
    req: web::Json<UpdateProcProtectionRequest>,
) -> ApiResult<HttpResponse> {
    let caller = caller(&state, &http)?;
    let result = state.security.update_proc_protection(&req).await;
    audit(&state, &caller, EventModule::Security, "security/proc_protection/update", req.node_id, &*req, &result);
    result?;
    done()
}

pub async fn list_file_protection(state: State, http: HttpRequest, req: web::Json<ListProtectionRequest>) -> ApiResult<HttpResponse> {
    caller(&state, &http)?;
    ok(state.security.list_file_protection(&req).await?)
}

pub async fn list_proc_protection(state: State, http: HttpRequest, req: web::Json<ListProtectionRequest>) -> ApiResult<HttpResponse> {
    caller(&state, &http)?;
    ok(state.security.list_proc_protection(&req).await?)
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

pub async fn list_runtime_logs(state: State, http: HttpRequest, req: web::Json<ListRuntimeRequest>) -> ApiResult<HttpResponse> {
    caller(&state, &http)?;
    ok(state.logs.list_runtime(&req).await?)
}

pub async fn list_warn_logs(state: State, http: HttpRequest, req: web::Json<ListWarnRequest>) -> ApiResult<HttpResponse> {
    caller(&state, &http)?;
    ok(state.logs.list_warn(&req).await?)
}

pub async fn read_warn_logs(state: State, http: HttpRequest, req: web::Json<IdsRequest>) -> ApiResult<HttpResponse> {
    let caller = caller(&state, &http)?;
    let result = state.logs.read_warn(&req.ids).await;
    audit(&state, &caller, EventModule::Logging, "log/warn/read", 0, &*req, &result);
    result?;
    done()
}
