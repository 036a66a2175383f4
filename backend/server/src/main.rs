mod agent_handlers;
mod config;
mod error;
mod handlers;
mod routes;

use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use agent_handlers::AgentState;
use anyhow::{Context, Result, bail};
use config::Config;
use fleetwarden_services::agent::{
    AgentRuntime, BackupJobStore, DockerEngine, Enforcer, InfluxMetrics, LoggingKernelChannel,
    SecurityPaths,
};
use fleetwarden_services::{
    AgentPool, ContainerService, HttpConnector, ImageRegistry, ImageService, LogService,
    MasterGate, NodeRegistry, RegistryClient, SecurityService, Watchdog, create_connection,
};
use handlers::AppState;
use std::path::PathBuf;
use std::sync::Arc;

const USAGE: &str = "usage: fleetwarden <agent|controller> CONFIG_FILE";

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (role, path) = parse_args(&args)?;
    let config = Config::load(&path)?;

    env_logger::init_from_env(env_logger::Env::new().default_filter_or(config.log.level.as_str()));

    match role {
        Role::Agent => run_agent(config).await,
        Role::Controller => run_controller(config).await,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Agent,
    Controller,
}

/// Exactly a role and a config file; anything else is a usage error.
fn parse_args(args: &[String]) -> Result<(Role, PathBuf)> {
    let [role, path] = args else {
        bail!(USAGE);
    };
    let role = match role.as_str() {
        "agent" => Role::Agent,
        "controller" => Role::Controller,
        other => bail!("unknown role {}; {}", other, USAGE),
    };
    Ok((role, PathBuf::from(path)))
}

fn registry_client(config: &Config) -> Result<RegistryClient> {
    RegistryClient::new(
        &config.registry.addr,
        config.registry.secure,
        &config.registry.username,
        &config.registry.password,
    )
}

async fn run_agent(config: Config) -> Result<()> {
    let agent = &config.agent;
    log::info!("Starting agent on {}:{}", agent.host, agent.port);

    let engine = DockerEngine::connect(agent.docker_host.as_deref())
        .await
        .context("Failed to connect to the container engine")?;
    let registry = registry_client(&config)?;
    let enforcer = Enforcer::new(
        Arc::new(LoggingKernelChannel),
        SecurityPaths {
            opensnitch_rule_dir: agent.opensnitch_rule_dir.clone(),
            iptables_dir: agent.iptables_dir.clone(),
            authz_sock: agent.authz_sock.clone(),
        },
    );
    let metrics = InfluxMetrics::new(&agent.influxdb_addr)?;

    let runtime = Arc::new(AgentRuntime::new(
        Arc::new(engine),
        Arc::new(registry),
        Arc::new(enforcer),
        Arc::new(BackupJobStore::new(&agent.backup_job_file)),
        Arc::new(metrics),
        &agent.container_extra_data_basedir,
    ));
    actix_rt::spawn(runtime.cpu_sampler().run());

    let state = web::Data::new(AgentState { api: runtime });

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(routes::configure_agent)
    })
    .bind((agent.host.as_str(), agent.port))
    .with_context(|| format!("Failed to bind {}:{}", agent.host, agent.port))?
    .run()
    .await?;
    Ok(())
}

async fn run_controller(config: Config) -> Result<()> {
    let controller = &config.controller;
    log::info!("Starting controller on {}:{}", controller.host, controller.port);

    let db = create_connection(&config.database.url).await?;
    log::info!("Database connection established");
    log::info!("Note: Run migrations with 'cd migrations && cargo run -- up' if not already done");

    let pool = Arc::new(AgentPool::new(Arc::new(HttpConnector::new(controller.agent_port))));
    let nodes = Arc::new(NodeRegistry::new(db.clone(), pool));
    let containers = Arc::new(ContainerService::new(db.clone(), nodes.clone()));
    let registry: Arc<dyn ImageRegistry> = Arc::new(registry_client(&config)?);
    let images = ImageService::new(db.clone(), nodes.clone(), registry);
    let security = Arc::new(SecurityService::new(db.clone(), nodes.clone()));
    let (logs, log_writer) = LogService::new(db);
    actix_rt::spawn(log_writer.run());

    let watchdog = Watchdog::new(
        MasterGate::new(&controller.virtual_if, &controller.virtual_ip),
        nodes.clone(),
        containers.clone(),
        images.clone(),
        security.clone(),
        logs.clone(),
    );
    actix_rt::spawn(async move { watchdog.run().await });

    let state = web::Data::new(AppState {
        nodes,
        containers,
        images,
        security,
        logs,
        check_auth: controller.check_auth,
        check_perm: controller.check_perm,
    });

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_method()
            .allow_any_origin()
            .allow_any_header();

        App::new()
            .wrap(cors)
            .app_data(state.clone())
            .configure(routes::configure_controller)
    })
    .bind((controller.host.as_str(), controller.port))
    .with_context(|| format!("Failed to bind {}:{}", controller.host, controller.port))?
    .run()
    .await?;
    Ok(())
}
