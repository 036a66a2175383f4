use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::errors::Error as DockerError;
use bollard::models::{
    ContainerConfig, ContainerCreateBody, ContainerUpdateBody, EndpointIpamConfig,
    EndpointSettings, HostConfig, Mount, MountTypeEnum, NetworkConnectRequest,
    NetworkDisconnectRequest, NetworkingConfig, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CommitContainerOptionsBuilder, CreateContainerOptionsBuilder, CreateImageOptionsBuilder,
    InspectContainerOptions, KillContainerOptions, ListContainersOptions, ListImagesOptions,
    ListNetworksOptions, RemoveContainerOptionsBuilder, RemoveImageOptions,
    RestartContainerOptionsBuilder, StartContainerOptions, StatsOptions,
    StopContainerOptionsBuilder, TagImageOptionsBuilder,
};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};

use super::engine::*;
use crate::error::{ServiceError, ServiceResult};
use crate::registry_client::split_reference;

/// [`ContainerEngine`] backed by the local docker daemon.
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connects to `docker_host` when given (`unix://` or `tcp://`), else to
    /// the Docker Desktop socket or the local defaults, and pings the daemon.
    pub async fn connect(docker_host: Option<&str>) -> Result<Self> {
        let docker = if let Some(docker_host) = docker_host {
            log::info!("Using DOCKER_HOST: {}", docker_host);
            if let Some(socket_path) = docker_host.strip_prefix("unix://") {
                Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                    .context(format!("Failed to connect to Docker socket: {}", socket_path))?
            } else {
                Docker::connect_with_http(docker_host, 120, bollard::API_DEFAULT_VERSION)
                    .context(format!("Failed to connect to Docker host: {}", docker_host))?
            }
        } else if let Ok(home) = std::env::var("HOME") {
            let desktop_path = format!("{}/.docker/desktop/docker.sock", home);
            if std::path::Path::new(&desktop_path).exists() {
                log::info!("Connecting to Docker Desktop socket: {}", desktop_path);
                match Docker::connect_with_socket(&desktop_path, 120, bollard::API_DEFAULT_VERSION) {
                    Ok(d) => d,
                    Err(e) => {
                        log::warn!("Failed to connect to Docker Desktop socket ({}), trying default: {}", desktop_path, e);
                        Docker::connect_with_local_defaults()
                            .context("Failed to connect to Docker daemon")?
                    }
                }
            } else {
                log::info!("Using Docker local defaults");
                Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?
            }
        } else {
            log::info!("Using Docker local defaults");
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?
        };

        docker.ping().await.map_err(|e| {
            anyhow::anyhow!("Failed to connect to Docker daemon: {}. Make sure Docker is running and accessible.", e)
        })?;
        log::info!("Docker connection successful");

        Ok(Self { docker })
    }
}

fn engine_error(err: DockerError) -> ServiceError {
    match err {
        DockerError::DockerResponseServerError { status_code, message } => match status_code {
            400 => ServiceError::InvalidArgument(message),
            404 => ServiceError::NotFound(message),
            409 => ServiceError::AlreadyExists(message),
            _ => ServiceError::Internal(message),
        },
        other => ServiceError::internal(other.to_string()),
    }
}

fn restart_name(name: &str) -> ServiceResult<RestartPolicyNameEnum> {
    match name {
        "" => Ok(RestartPolicyNameEnum::EMPTY),
        "no" => Ok(RestartPolicyNameEnum::NO),
        "always" => Ok(RestartPolicyNameEnum::ALWAYS),
        "unless-stopped" => Ok(RestartPolicyNameEnum::UNLESS_STOPPED),
        "on-failure" => Ok(RestartPolicyNameEnum::ON_FAILURE),
        other => Err(ServiceError::invalid(format!("restart policy {}", other))),
    }
}

fn mount_type(kind: &str) -> ServiceResult<MountTypeEnum> {
    match kind {
        "" | "bind" => Ok(MountTypeEnum::BIND),
        "volume" => Ok(MountTypeEnum::VOLUME),
        "tmpfs" => Ok(MountTypeEnum::TMPFS),
        "npipe" => Ok(MountTypeEnum::NPIPE),
        other => Err(ServiceError::invalid(format!("mount type {}", other))),
    }
}

fn restart_policy(policy: &EngineRestartPolicy) -> ServiceResult<RestartPolicy> {
    Ok(RestartPolicy {
        name: Some(restart_name(&policy.name)?),
        maximum_retry_count: Some(policy.max_retry),
    })
}

fn endpoint_settings(endpoint: &EngineEndpoint) -> EndpointSettings {
    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_owned());
    EndpointSettings {
        ipam_config: non_empty(&endpoint.ipam_address).map(|ip| EndpointIpamConfig {
            ipv4_address: Some(ip),
            ..Default::default()
        }),
        ip_address: non_empty(&endpoint.ip_address),
        ip_prefix_len: (endpoint.ip_prefix_len > 0).then_some(endpoint.ip_prefix_len),
        mac_address: non_empty(&endpoint.mac_address),
        gateway: non_empty(&endpoint.gateway),
        ..Default::default()
    }
}

fn endpoint_from(network: &str, settings: &EndpointSettings) -> EngineEndpoint {
    EngineEndpoint {
        network: network.to_owned(),
        ipam_address: settings
            .ipam_config
            .as_ref()
            .and_then(|c| c.ipv4_address.clone())
            .unwrap_or_default(),
        ip_address: settings.ip_address.clone().unwrap_or_default(),
        ip_prefix_len: settings.ip_prefix_len.unwrap_or(0),
        mac_address: settings.mac_address.clone().unwrap_or_default(),
        gateway: settings.gateway.clone().unwrap_or_default(),
    }
}

fn parse_rfc3339(ts: &str) -> i64 {
    chrono::DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.timestamp())
        .unwrap_or(0)
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn info(&self) -> ServiceResult<EngineInfo> {
        let info = self.docker.info().await.map_err(engine_error)?;
        Ok(EngineInfo {
            containers: info.containers.unwrap_or(0),
            containers_running: info.containers_running.unwrap_or(0),
        })
    }

    async fn list_containers(&self, all: bool) -> ServiceResult<Vec<EngineContainer>> {
        let options = ListContainersOptions {
            all,
            size: true,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| {
                log::error!("Docker API error: {:?}", e);
                engine_error(e)
            })?;
        log::debug!("Docker API returned {} containers", containers.len());

        let mut result = Vec::with_capacity(containers.len());
        for container in containers {
            let Some(id) = container.id else {
                log::warn!("Skipping container with empty ID: names={:?}", container.names);
                continue;
            };
            // Linked containers show up under extra "/other/alias" names.
            let name = container
                .names
                .unwrap_or_default()
                .into_iter()
                .filter_map(|n| n.strip_prefix('/').map(str::to_owned))
                .find(|n| !n.contains('/'))
                .unwrap_or_default();
            let networks: BTreeMap<String, String> = container
                .network_settings
                .and_then(|s| s.networks)
                .unwrap_or_default()
                .into_iter()
                .map(|(net, settings)| {
                    let endpoint = endpoint_from(&net, &settings);
                    let ip = if endpoint.ipam_address.is_empty() {
                        endpoint.ip_address
                    } else {
                        endpoint.ipam_address
                    };
                    (net, ip)
                })
                .collect();

            result.push(EngineContainer {
                id,
                name,
                image: container.image.unwrap_or_default(),
                image_id: container.image_id.unwrap_or_default(),
                command: container.command.unwrap_or_default(),
                state: container.state.map(|s| s.to_string()).unwrap_or_default(),
                created: container.created.unwrap_or(0),
                size_root_fs: container.size_root_fs.unwrap_or(0),
                labels: container.labels.unwrap_or_default(),
                networks,
            });
        }
        Ok(result)
    }

    async fn create_container(&self, spec: &EngineSpec) -> ServiceResult<String> {
        let mounts = spec
            .mounts
            .iter()
            .map(|m| {
                Ok(Mount {
                    typ: Some(mount_type(&m.kind)?),
                    source: Some(m.source.clone()),
                    target: Some(m.target.clone()),
                    read_only: Some(m.read_only),
                    ..Default::default()
                })
            })
            .collect::<ServiceResult<Vec<_>>>()?;

        let mut host_config = HostConfig {
            privileged: Some(spec.privileged),
            mounts: (!mounts.is_empty()).then_some(mounts),
            storage_opt: (!spec.storage_opt.is_empty()).then(|| spec.storage_opt.clone()),
            ..Default::default()
        };
        if let Some(restart) = &spec.restart {
            host_config.restart_policy = Some(restart_policy(restart)?);
        }
        if let Some(r) = &spec.resources {
            host_config.nano_cpus = Some(r.nano_cpus);
            host_config.cpu_shares = Some(r.cpu_shares);
            host_config.memory = Some(r.memory);
            host_config.memory_reservation = Some(r.memory_reservation);
            host_config.memory_swap = Some(r.memory_swap);
        }

        let networking_config = spec.network.as_ref().map(|endpoint| NetworkingConfig {
            endpoints_config: Some(HashMap::from([(
                endpoint.network.clone(),
                endpoint_settings(endpoint),
            )])),
        });

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            tty: Some(spec.tty),
            open_stdin: Some(spec.open_stdin),
            attach_stdin: Some(spec.open_stdin),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        };

        let options = CreateContainerOptionsBuilder::default().name(&spec.name).build();
        let response = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| {
                log::warn!("create container {}: {}", spec.name, e);
                engine_error(e)
            })?;
        for warning in &response.warnings {
            log::info!("create container {} warning: {}", spec.name, warning);
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> ServiceResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(engine_error)
    }

    async fn stop_container(&self, id: &str, timeout: i64) -> ServiceResult<()> {
        let options = StopContainerOptionsBuilder::default().t(timeout as i32).build();
        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(engine_error)
    }

    async fn kill_container(&self, id: &str) -> ServiceResult<()> {
        self.docker
            .kill_container(id, None::<KillContainerOptions>)
            .await
            .map_err(engine_error)
    }

    async fn restart_container(&self, id: &str, timeout: i64) -> ServiceResult<()> {
        let options = RestartContainerOptionsBuilder::default().t(timeout as i32).build();
        self.docker
            .restart_container(id, Some(options))
            .await
            .map_err(engine_error)
    }

    async fn remove_container(&self, id: &str, force: bool) -> ServiceResult<()> {
        let options = RemoveContainerOptionsBuilder::default().v(true).force(force).build();
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(engine_error)
    }

    async fn inspect_container(&self, id: &str) -> ServiceResult<EngineInspect> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(engine_error)?;

        let mut result = EngineInspect {
            id: info.id.unwrap_or_default(),
            name: info.name.unwrap_or_default().trim_start_matches('/').to_owned(),
            image: info.image.unwrap_or_default(),
            ..Default::default()
        };

        if let Some(state) = info.state {
            result.status = state.status.map(|s| s.to_string()).unwrap_or_default();
            result.running = state.running.unwrap_or(false);
            result.pid = state.pid.unwrap_or(0);
            result.started_at = state.started_at.as_deref().map(parse_rfc3339).unwrap_or(0);
        }

        if let Some(config) = info.config {
            if let Some(image) = config.image {
                result.image = image;
            }
            result.labels = config.labels.unwrap_or_default();
            result.env = config.env.unwrap_or_default();
        }

        result.mounts = info
            .mounts
            .unwrap_or_default()
            .into_iter()
            .map(|m| EngineMount {
                kind: m.typ.map(|t| t.to_string()).unwrap_or_default(),
                source: m.source.unwrap_or_default(),
                target: m.destination.unwrap_or_default(),
                read_only: !m.rw.unwrap_or(true),
            })
            .collect();

        if let Some(host) = info.host_config {
            result.restart = host.restart_policy.map(|p| EngineRestartPolicy {
                name: p.name.map(|n| n.to_string()).unwrap_or_default(),
                max_retry: p.maximum_retry_count.unwrap_or(0),
            });
            result.resources = Some(EngineResources {
                nano_cpus: host.nano_cpus.unwrap_or(0),
                cpu_shares: host.cpu_shares.unwrap_or(0),
                memory: host.memory.unwrap_or(0),
                memory_reservation: host.memory_reservation.unwrap_or(0),
                memory_swap: host.memory_swap.unwrap_or(0),
            });
            result.storage_opt = host.storage_opt.unwrap_or_default();
        }

        let mut networks: Vec<EngineEndpoint> = info
            .network_settings
            .and_then(|s| s.networks)
            .unwrap_or_default()
            .iter()
            .map(|(name, settings)| endpoint_from(name, settings))
            .collect();
        networks.sort_by(|a, b| a.network.cmp(&b.network));
        result.networks = networks;

        Ok(result)
    }

    async fn update_container(
        &self,
        id: &str,
        resources: Option<&EngineResources>,
        restart: Option<&EngineRestartPolicy>,
    ) -> ServiceResult<()> {
        let mut body = ContainerUpdateBody::default();
        if let Some(r) = resources {
            body.nano_cpus = Some(r.nano_cpus);
            body.cpu_shares = Some(r.cpu_shares);
            body.memory = Some(r.memory);
            body.memory_reservation = Some(r.memory_reservation);
            body.memory_swap = Some(r.memory_swap);
        }
        if let Some(p) = restart {
            body.restart_policy = Some(restart_policy(p)?);
        }
        self.docker
            .update_container(id, body)
            .await
            .map_err(engine_error)?;
        log::debug!("container {} updated", id);
        Ok(())
    }

    async fn container_stats(&self, id: &str) -> ServiceResult<EngineStats> {
        let options = StatsOptions {
            stream: false,
            ..Default::default()
        };
        let stats = self
            .docker
            .stats(id, Some(options))
            .next()
            .await
            .ok_or_else(|| ServiceError::internal(format!("no stats for {}", id)))?
            .map_err(engine_error)?;

        let cpu_stats = stats.cpu_stats.as_ref();
        let precpu_stats = stats.precpu_stats.as_ref();

        let cpu_delta = cpu_stats
            .and_then(|c| c.cpu_usage.as_ref())
            .and_then(|cu| cu.total_usage)
            .and_then(|tu| {
                precpu_stats
                    .and_then(|pc| pc.cpu_usage.as_ref())
                    .and_then(|pcu| pcu.total_usage)
                    .map(|ptu| tu.saturating_sub(ptu))
            })
            .unwrap_or(0);
        let system_delta = cpu_stats
            .and_then(|c| c.system_cpu_usage)
            .and_then(|scu| {
                precpu_stats
                    .and_then(|pc| pc.system_cpu_usage)
                    .map(|pscu| scu.saturating_sub(pscu))
            })
            .unwrap_or(0);
        let online_cpus = cpu_stats.and_then(|c| c.online_cpus).unwrap_or(1) as f64;

        let cpu_cores = if system_delta > 0 && cpu_delta > 0 {
            cpu_delta as f64 / system_delta as f64 * online_cpus
        } else {
            0.0
        };

        let memory_stats = stats.memory_stats.as_ref();
        Ok(EngineStats {
            cpu_cores,
            online_cpus,
            memory_usage: memory_stats.and_then(|m| m.usage).unwrap_or(0),
            memory_limit: memory_stats.and_then(|m| m.limit).unwrap_or(0),
        })
    }

    async fn commit_container(&self, id: &str, reference: &str) -> ServiceResult<String> {
        let (repo, tag) = split_reference(reference)?;
        let options = CommitContainerOptionsBuilder::default()
            .container(id)
            .repo(repo)
            .tag(tag)
            .pause(true)
            .build();
        let response = self
            .docker
            .commit_container(options, ContainerConfig::default())
            .await
            .map_err(engine_error)?;
        Ok(response.id)
    }

    async fn list_images(&self) -> ServiceResult<Vec<EngineImage>> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::default()))
            .await
            .map_err(engine_error)?;
        Ok(images
            .into_iter()
            .map(|i| EngineImage {
                id: i.id,
                repo_tags: i.repo_tags,
                size: i.size,
                created: i.created,
            })
            .collect())
    }

    async fn inspect_image(&self, reference: &str) -> ServiceResult<EngineImage> {
        let image = self
            .docker
            .inspect_image(reference)
            .await
            .map_err(engine_error)?;
        Ok(EngineImage {
            id: image.id.unwrap_or_default(),
            repo_tags: image.repo_tags.unwrap_or_default(),
            size: image.size.unwrap_or(0),
            created: image.created.as_deref().map(parse_rfc3339).unwrap_or(0),
        })
    }

    async fn pull_image(&self, reference: &str) -> ServiceResult<()> {
        let options = CreateImageOptionsBuilder::default().from_image(reference).build();
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let info = progress.map_err(engine_error)?;
            if let Some(status) = info.status {
                log::debug!("pull {}: {}", reference, status);
            }
        }
        Ok(())
    }

    async fn tag_image(&self, source: &str, reference: &str) -> ServiceResult<()> {
        let (repo, tag) = split_reference(reference)?;
        let options = TagImageOptionsBuilder::default().repo(repo).tag(tag).build();
        self.docker
            .tag_image(source, Some(options))
            .await
            .map_err(engine_error)
    }

    async fn remove_image(&self, reference: &str) -> ServiceResult<()> {
        self.docker
            .remove_image(reference, None::<RemoveImageOptions>, None)
            .await
            .map_err(engine_error)?;
        Ok(())
    }

    async fn list_networks(&self) -> ServiceResult<Vec<EngineNetwork>> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions>)
            .await
            .map_err(engine_error)?;
        Ok(networks
            .into_iter()
            .map(|n| {
                let ipam = n
                    .ipam
                    .and_then(|i| i.config)
                    .and_then(|c| c.into_iter().next())
                    .unwrap_or_default();
                EngineNetwork {
                    name: n.name.unwrap_or_default(),
                    driver: n.driver.unwrap_or_default(),
                    subnet: ipam.subnet.unwrap_or_default(),
                    ip_range: ipam.ip_range.unwrap_or_default(),
                    gateway: ipam.gateway.unwrap_or_default(),
                }
            })
            .collect())
    }

    async fn connect_network(&self, container_id: &str, endpoint: &EngineEndpoint) -> ServiceResult<()> {
        let request = NetworkConnectRequest {
            container: Some(container_id.to_owned()),
            endpoint_config: Some(endpoint_settings(endpoint)),
        };
        self.docker
            .connect_network(&endpoint.network, request)
            .await
            .map_err(engine_error)
    }

    async fn disconnect_network(&self, container_id: &str, network: &str) -> ServiceResult<()> {
        let request = NetworkDisconnectRequest {
            container: Some(container_id.to_owned()),
            force: Some(true),
        };
        self.docker
            .disconnect_network(network, request)
            .await
            .map_err(engine_error)
    }
}
