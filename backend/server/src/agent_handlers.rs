//! Agent endpoints. Each one unwraps the request body and hands it to the
//! runtime driver; the controller's HTTP client mirrors this table.

use actix_web::{HttpResponse, web};
use fleetwarden_services::AgentApi;
use fleetwarden_shared::rpc::*;
use fleetwarden_shared::{ContainerIdList, NetworkConfig, NodeContainer};
use std::sync::Arc;
use std::time::Duration;

use crate::error::ApiResult;

pub struct AgentState {
    pub api: Arc<dyn AgentApi>,
}

type State = web::Data<AgentState>;

fn empty() -> HttpResponse {
    HttpResponse::Ok().json(Empty {})
}

pub async fn list_containers(state: State, req: web::Json<ListContainersRequest>) -> ApiResult<HttpResponse> {
    let containers = state.api.list_containers(req.list_all).await?;
    Ok(HttpResponse::Ok().json(ListContainersReply {
        containers: containers
            .into_iter()
            .map(|info| NodeContainer {
                info,
                ..Default::default()
            })
            .collect(),
        fail_nodes: Vec::new(),
    }))
}

pub async fn create_container(state: State, req: web::Json<CreateContainerRequest>) -> ApiResult<HttpResponse> {
    let reply = state.api.create_container(&req).await?;
    Ok(HttpResponse::Ok().json(reply))
}

pub async fn start_containers(state: State, req: web::Json<ContainerIdList>) -> ApiResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.api.start_containers(&req).await?))
}

pub async fn stop_containers(state: State, req: web::Json<ContainerIdList>) -> ApiResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.api.stop_containers(&req).await?))
}

pub async fn kill_containers(state: State, req: web::Json<ContainerIdList>) -> ApiResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.api.kill_containers(&req).await?))
}

pub async fn restart_containers(state: State, req: web::Json<ContainerIdList>) -> ApiResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.api.restart_containers(&req).await?))
}

pub async fn remove_containers(state: State, req: web::Json<ContainerIdList>) -> ApiResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.api.remove_containers(&req).await?))
}

pub async fn inspect_container(state: State, req: web::Json<InspectContainerRequest>) -> ApiResult<HttpResponse> {
    let configs = state.api.inspect_container(&req.container_id).await?;
    Ok(HttpResponse::Ok().json(InspectContainerReply { configs }))
}

pub async fn update_container(state: State, req: web::Json<UpdateContainerRequest>) -> ApiResult<HttpResponse> {
    state.api.update_container(&req).await?;
    Ok(empty())
}

pub async fn monitor_history(state: State, req: web::Json<MonitorHistoryRequest>) -> ApiResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.api.monitor_history(&req).await?))
}

pub async fn add_backup_job(state: State, req: web::Json<AddBackupJobRequest>) -> ApiResult<HttpResponse> {
    state.api.add_backup_job(&req).await?;
    Ok(empty())
}

pub async fn get_backup_job(state: State, req: web::Json<IdRequest>) -> ApiResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.api.get_backup_job(req.id).await?))
}

pub async fn del_backup_job(state: State, req: web::Json<IdRequest>) -> ApiResult<HttpResponse> {
    state.api.del_backup_job(req.id).await?;
    Ok(empty())
}

pub async fn remove_backup(state: State, req: web::Json<AgentRemoveBackupRequest>) -> ApiResult<HttpResponse> {
    state.api.remove_backup(&req.image_ref).await?;
    Ok(empty())
}

pub async fn resume_backup(state: State, req: web::Json<AgentResumeBackupRequest>) -> ApiResult<HttpResponse> {
    let container_id = state.api.resume_backup(&req).await?;
    Ok(HttpResponse::Ok().json(ResumeBackupReply { container_id }))
}

pub async fn node_status(state: State) -> ApiResult<HttpResponse> {
    let status = state.api.node_status(Duration::from_secs(2)).await?;
    Ok(HttpResponse::Ok().json(status))
}

pub async fn list_images(state: State) -> ApiResult<HttpResponse> {
    let images = state.api.list_images().await?;
    Ok(HttpResponse::Ok().json(NodeImagesReply { images }))
}

pub async fn sync_images(state: State, req: web::Json<AgentSyncRequest>) -> ApiResult<HttpResponse> {
    state.api.sync_images(&req).await?;
    Ok(empty())
}

pub async fn list_networks(state: State) -> ApiResult<HttpResponse> {
    let bridges = state.api.list_networks().await?;
    Ok(HttpResponse::Ok().json(ListNetworksReply { bridges }))
}

pub async fn connect_network(state: State, req: web::Json<NetworkConfig>) -> ApiResult<HttpResponse> {
    state.api.connect_network(&req).await?;
    Ok(empty())
}

pub async fn disconnect_network(state: State, req: web::Json<DisconnectNetworkRequest>) -> ApiResult<HttpResponse> {
    state
        .api
        .disconnect_network(&req.interface, &req.container_id)
        .await?;
    Ok(empty())
}

pub async fn update_file_protection(
    state: State,
    req: web::Json<UpdateFileProtectionRequest>,
) -> ApiResult<HttpResponse> {
    state.api.update_file_protection(&req).await?;
    Ok(empty())
}

pub async fn update_proc_protection(
    state: State,
    req: web::Json<UpdateProcProtectionRequest>,
) -> ApiResult<HttpResponse> {
    state.api.update_proc_protection(&req).await?;
    Ok(empty())
}

pub async fn load_security_config(state: State, req: web::Json<LoadSecurityConfigRequest>) -> ApiResult<HttpResponse> {
    state.api.load_security_config(&req).await?;
    Ok(empty())
}
