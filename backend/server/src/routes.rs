use crate::{agent_handlers, handlers};
use actix_web::web;
use fleetwarden_services::agent_client::paths;

pub fn configure_agent(cfg: &mut web::ServiceConfig) {
    cfg
        // Containers
        .route(paths::CONTAINER_LIST, web::post().to(agent_handlers::list_containers))
        .route(paths::CONTAINER_CREATE, web::post().to(agent_handlers::create_container))
        .route(paths::CONTAINER_START, web::post().to(agent_handlers::start_containers))
        .route(paths::CONTAINER_STOP, web::post().to(agent_handlers::stop_containers))
        .route(paths::CONTAINER_KILL, web::post().to(agent_handlers::kill_containers))
        .route(paths::CONTAINER_RESTART, web::post().to(agent_handlers::restart_containers))
        .route(paths::CONTAINER_REMOVE, web::post().to(agent_handlers::remove_containers))
        .route(paths::CONTAINER_INSPECT, web::post().to(agent_handlers::inspect_container))
        .route(paths::CONTAINER_UPDATE, web::post().to(agent_handlers::update_container))
        .route(
            paths::CONTAINER_MONITOR_HISTORY,
            web::post().to(agent_handlers::monitor_history),
        )
        // Backups
        .route(paths::BACKUP_JOB_ADD, web::post().to(agent_handlers::add_backup_job))
        .route(paths::BACKUP_JOB_GET, web::post().to(agent_handlers::get_backup_job))
        .route(paths::BACKUP_JOB_DEL, web::post().to(agent_handlers::del_backup_job))
        .route(paths::BACKUP_REMOVE, web::post().to(agent_handlers::remove_backup))
        .route(paths::BACKUP_RESUME, web::post().to(agent_handlers::resume_backup))
        // Node, images and networks
        .route(paths::NODE_STATUS, web::post().to(agent_handlers::node_status))
        .route(paths::IMAGE_LIST, web::post().to(agent_handlers::list_images))
        .route(paths::IMAGE_SYNC, web::post().to(agent_handlers::sync_images))
        .route(paths::NETWORK_LIST, web::post().to(agent_handlers::list_networks))
        .route(paths::NETWORK_CONNECT, web::post().to(agent_handlers::connect_network))
        .route(paths::NETWORK_DISCONNECT, web::post().to(agent_handlers::disconnect_network))
        // Security
        .route(
            paths::SECURITY_FILE_PROTECTION,
            web::post().to(agent_handlers::update_file_protection),
        )
        .route(
            paths::SECURITY_PROC_PROTECTION,
            web::post().to(agent_handlers::update_proc_protection),
        )
        .route(paths::SECURITY_LOAD, web::post().to(agent_handlers::load_security_config));
}

pub fn configure_controller(cfg: &mut web::ServiceConfig) {
    cfg
        // Containers
        .route("/api/container/list", web::post().to(handlers::list_containers))
        .route("/api/container/create", web::post().to(handlers::create_container))
        .route("/api/container/start", web::post().to(handlers::start_containers))
        .route("/api/container/stop", web::post().to(handlers::stop_containers))
        .route("/api/container/kill", web::post().to(handlers::kill_containers))
        .route("/api/container/restart", web::post().to(handlers::restart_containers))
        .route("/api/container/remove", web::post().to(handlers::remove_containers))
        .route("/api/container/inspect", web::post().to(handlers::inspect_container))
        .route("/api/container/update", web::post().to(handlers::update_container))
        .route("/api/container/monitor_history", web::post().to(handlers::monitor_history))
        // Templates
        .route("/api/template/list", web::post().to(handlers::list_templates))
        .route("/api/template/create", web::post().to(handlers::create_template))
        .route("/api/template/update", web::post().to(handlers::update_template))
        .route("/api/template/remove", web::post().to(handlers::remove_templates))
        .route("/api/template/inspect", web::post().to(handlers::inspect_template))
        // Backups
        .route("/api/backup/create", web::post().to(handlers::create_backup))
        .route("/api/backup/update", web::post().to(handlers::update_backup))
        .route("/api/backup/remove", web::post().to(handlers::remove_backup))
        .route("/api/backup/resume", web::post().to(handlers::resume_backup))
        .route("/api/backup/list", web::post().to(handlers::list_backups))
        // Nodes
        .route("/api/node/list", web::post().to(handlers::list_nodes))
        .route("/api/node/create", web::post().to(handlers::create_node))
        .route("/api/node/remove", web::post().to(handlers::remove_nodes))
        .route("/api/node/update", web::post().to(handlers::update_node))
        .route("/api/node/status", web::post().to(handlers::node_status))
        // Images
        .route("/api/image/list", web::post().to(handlers::list_images))
        .route("/api/image/approve", web::post().to(handlers::approve_image))
        .route("/api/image/remove", web::post().to(handlers::remove_images))
        // Networks
        .route("/api/network/list", web::post().to(handlers::list_networks))
        .route("/api/network/connect", web::post().to(handlers::connect_network))
        .route("/api/network/disconnect", web::post().to(handlers::disconnect_network))
        // Security
        .route(
            "/api/security/file_protection/update",
            web::post().to(handlers::update_file_protection),
        )
        .route(
            "/api/security/proc_protection/update",
            web::post().to(handlers::update_proc_protection),
        )
        .route(
            "/api/security/file_protection/list",
            web::post().to(handlers::list_file_protection),
        )
        .route(
            "/api/security/proc_protection/list",
            web::post().to(handlers::list_proc_protection),
        )
        // Logs
        .route("/api/log/runtime/list", web::post().to(handlers::list_runtime_logs))
        .route("/api/log/warn/list", web::post().to(handlers::list_warn_logs))
        .route("/api/log/warn/read", web::post().to(handlers::read_warn_logs));
}
