//! Docker engine driven through the Engine API with `bollard`.
//!
//! bollard runs on tokio; every request and stream is wrapped in
//! [`Compat`] so it can be polled from the smol executor.

use async_compat::Compat;
use async_lock::OnceCell;
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerInspectResponse, ContainerSummary, HostConfig, PortMap, PortTypeEnum,
    PortBinding as HostBinding,
};
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions};
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use super::catalog::ServiceCatalog;
use super::ports::{DESKTOP_HOST_ALIAS, LOOPBACK, check_port_bindings, map_ports};
use super::traits::{ContainerEngine, LogStream};
use super::types::{
    ContainerInfo, ContainerSpec, ContainerState, PortBinding, Protocol, StartOutcome, VolumeInfo,
};
use crate::error::{Error, Result};

pub struct DockerEngine {
    client: OnceCell<Docker>,
    host: OnceCell<String>,
    catalog: ServiceCatalog,
}

impl std::fmt::Debug for DockerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerEngine")
            .field("connected", &self.client.get().is_some())
            .field("host", &self.host.get())
            .finish()
    }
}

impl Default for DockerEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerEngine {
    /// Connects lazily through `DOCKER_HOST` or the platform's local socket.
    pub fn new() -> Self {
        Self {
            client: OnceCell::new(),
            host: OnceCell::new(),
            catalog: ServiceCatalog::new(),
        }
    }

    async fn client(&self) -> Result<&Docker> {
        self.client
            .get_or_try_init(|| async {
                Docker::connect_with_local_defaults()
                    .map_err(|e| Error::EngineUnavailable(e.to_string()))
            })
            .await
    }

    async fn ensure_exists(&self, name: &str) -> Result<ContainerState> {
        self.container_state(name)
            .await?
            .ok_or_else(|| Error::ContainerNotFound(name.to_string()))
    }

    async fn start(&self, name: &str) -> Result<()> {
        let client = self.client().await?;
        Compat::new(client.start_container(name, None::<StartContainerOptions<String>>))
            .await
            .map_err(|e| not_found_or(name, "start", e))
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let client = self.client().await?;
        match Compat::new(client.stop_container(name, None::<StopContainerOptions>)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(not_found_or(name, "stop", e)),
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<()> {
        for volume in &spec.volumes {
            let source = Path::new(&volume.source);
            if source.is_absolute() {
                async_fs::create_dir_all(source).await?;
            }
        }

        let client = self.client().await?;
        let options = || {
            Some(CreateContainerOptions {
                name: spec.name.clone(),
                platform: None,
            })
        };
        match Compat::new(client.create_container(options(), container_config(spec))).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {
                self.pull(&spec.image).await?;
                Compat::new(client.create_container(options(), container_config(spec)))
                    .await
                    .map_err(|e| engine_error("create", e))?;
            }
            Err(e) => return Err(engine_error("create", e)),
        }
        self.start(&spec.name).await
    }

    async fn pull(&self, image: &str) -> Result<()> {
        tracing::info!(image = %image, "pulling image");
        let client = self.client().await?;
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        Compat::new(client.create_image(Some(options), None, None))
            .map_err(|e| engine_error("pull", e))
            .try_for_each(|progress| {
                if let Some(status) = progress.status {
                    tracing::trace!(image = %image, "{}", status);
                }
                futures::future::ready(Ok(()))
            })
            .await
    }
}

/// Create-time configuration for `spec`.
fn container_config(spec: &ContainerSpec) -> Config<String> {
    let mut exposed_ports = HashMap::new();
    let mut port_bindings: PortMap = HashMap::new();
    for port in &spec.ports {
        let key = format!("{}/{}", port.container_port, port.protocol.as_str());
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings
            .entry(key)
            .or_insert_with(|| Some(Vec::new()))
            .get_or_insert_with(Vec::new)
            .push(HostBinding {
                host_ip: Some(bind_address(&port.host_ip)),
                host_port: Some(port.host_port.to_string()),
            });
    }
    let binds = spec
        .volumes
        .iter()
        .map(|volume| {
            let mut bind = format!("{}:{}", volume.source, volume.target);
            if volume.read_only {
                bind.push_str(":ro");
            }
            bind
        })
        .collect();

    Config {
        image: Some(spec.image.clone()),
        env: Some(
            spec.env
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect(),
        ),
        exposed_ports: Some(exposed_ports),
        host_config: Some(HostConfig {
            port_bindings: Some(port_bindings),
            binds: Some(binds),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Host-side bind address. The daemon only binds IP literals; a DNS alias
/// such as the desktop host name is reached through loopback.
fn bind_address(host_ip: &str) -> String {
    match host_ip.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => LOOPBACK.to_string(),
    }
}

/// Flatten a port map into bindings, sorted for stable output.
fn bindings_from_map(map: &PortMap) -> Vec<PortBinding> {
    let mut bindings: Vec<PortBinding> = map
        .iter()
        .flat_map(|(key, hosts)| {
            hosts
                .iter()
                .flatten()
                .filter_map(move |host| {
                    let host_port = host.host_port.as_deref().filter(|p| !p.is_empty())?;
                    let host_ip = host
                        .host_ip
                        .as_deref()
                        .filter(|ip| !ip.is_empty())
                        .unwrap_or(LOOPBACK);
                    map_ports(host_ip, host_port, key).ok()
                })
        })
        .collect();
    bindings.sort_by_key(|b| (b.container_port, b.host_port, b.host_ip.clone()));
    bindings.dedup_by_key(|b| (b.container_port, b.host_port, b.protocol));
    bindings
}

fn info_from_inspect(name: &str, inspect: ContainerInspectResponse) -> ContainerInfo {
    let status = inspect
        .state
        .as_ref()
        .and_then(|state| match (&state.status, state.running) {
            (Some(status), _) => Some(status.to_string()),
            (None, Some(true)) => Some("running".to_string()),
            _ => None,
        })
        .unwrap_or_default();

    // Live mappings only exist while running; fall back to the create-time ones.
    let live = inspect
        .network_settings
        .as_ref()
        .and_then(|settings| settings.ports.as_ref())
        .map(bindings_from_map)
        .unwrap_or_default();
    let ports = if live.is_empty() {
        inspect
            .host_config
            .as_ref()
            .and_then(|config| config.port_bindings.as_ref())
            .map(bindings_from_map)
            .unwrap_or_default()
    } else {
        live
    };

    ContainerInfo {
        id: inspect.id.unwrap_or_default(),
        name: inspect
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| name.to_string()),
        image: inspect
            .config
            .and_then(|config| config.image)
            .unwrap_or_default(),
        state: ContainerState::parse(&status),
        status,
        ports,
    }
}

fn info_from_summary(summary: ContainerSummary) -> ContainerInfo {
    let status = summary.status.unwrap_or_default();
    let state = match summary.state.as_deref() {
        Some(state) if !state.is_empty() => ContainerState::parse(state),
        _ => ContainerState::parse(status.split_whitespace().next().unwrap_or_default()),
    };
    let mut ports: Vec<PortBinding> = summary
        .ports
        .unwrap_or_default()
        .into_iter()
        .filter_map(|port| {
            Some(PortBinding {
                host_ip: port
                    .ip
                    .filter(|ip| !ip.is_empty())
                    .unwrap_or_else(|| LOOPBACK.to_string()),
                host_port: port.public_port?,
                container_port: port.private_port,
                protocol: match port.typ {
                    Some(PortTypeEnum::UDP) => Protocol::Udp,
                    _ => Protocol::Tcp,
                },
            })
        })
        .collect();
    // IPv4 and IPv6 listeners show up as two entries
    ports.sort_by_key(|b| (b.container_port, b.host_port));
    ports.dedup_by_key(|b| (b.container_port, b.host_port, b.protocol));

    ContainerInfo {
        id: summary.id.unwrap_or_default(),
        name: summary
            .names
            .unwrap_or_default()
            .first()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        image: summary.image.unwrap_or_default(),
        state,
        status,
        ports,
    }
}

/// Desktop engines run in a VM; containers see the host through an alias.
fn host_for(operating_system: &str) -> &'static str {
    if operating_system.contains("Docker Desktop") {
        DESKTOP_HOST_ALIAS
    } else {
        LOOPBACK
    }
}

fn is_not_found(e: &DockerError) -> bool {
    matches!(
        e,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// API errors keep the daemon's message; anything else means the daemon
/// could not be reached.
fn engine_error(operation: &str, e: DockerError) -> Error {
    match e {
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => Error::engine(
            format!("docker {}", operation),
            format!("{} ({})", message, status_code),
        ),
        other => Error::EngineUnavailable(other.to_string()),
    }
}

fn not_found_or(name: &str, operation: &str, e: DockerError) -> Error {
    if is_not_found(&e) {
        Error::ContainerNotFound(name.to_string())
    } else {
        engine_error(operation, e)
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn initialize(&self) -> Result<()> {
        let host = self
            .host
            .get_or_try_init(|| async {
                let client = self.client().await?;
                let info = Compat::new(client.info())
                    .await
                    .map_err(|e| engine_error("info", e))?;
                let os = info.operating_system.unwrap_or_default();
                Ok::<_, Error>(host_for(&os).to_string())
            })
            .await?;
        tracing::info!(engine = self.name(), host = %host, "container engine ready");
        Ok(())
    }

    fn host_ip(&self) -> String {
        self.host
            .get()
            .cloned()
            .unwrap_or_else(|| LOOPBACK.to_string())
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>> {
        let client = self.client().await?;
        match Compat::new(client.inspect_container(name, None::<InspectContainerOptions>)).await {
            Ok(inspect) => Ok(Some(info_from_inspect(name, inspect))),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(engine_error("inspect", e)),
        }
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<StartOutcome> {
        check_port_bindings(&spec.ports)?;
        match self.container_state(&spec.name).await? {
            Some(state) if state.is_running() => {
                tracing::debug!(container = %spec.name, "already running");
                Ok(StartOutcome::AlreadyRunning)
            }
            Some(_) => {
                self.start(&spec.name).await?;
                tracing::info!(container = %spec.name, "container restarted");
                Ok(StartOutcome::Restarted)
            }
            None => {
                self.create(spec).await?;
                tracing::info!(container = %spec.name, image = %spec.image, "container created");
                Ok(StartOutcome::Created)
            }
        }
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        match self.container_state(name).await? {
            Some(state) if state.is_active() => {
                self.stop(name).await?;
                tracing::info!(container = %name, "container stopped");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        let client = self.client().await?;
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match Compat::new(client.remove_container(name, Some(options))).await {
            Ok(()) => {
                tracing::info!(container = %name, "container removed");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(engine_error("rm", e)),
        }
    }

    async fn start_container_by_name(&self, name: &str) -> Result<()> {
        if self.ensure_exists(name).await?.is_running() {
            return Ok(());
        }
        self.start(name).await?;
        tracing::info!(container = %name, "container started");
        Ok(())
    }

    async fn stop_container_by_name(&self, name: &str) -> Result<()> {
        if !self.ensure_exists(name).await?.is_active() {
            return Ok(());
        }
        self.stop(name).await?;
        tracing::info!(container = %name, "container stopped");
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let client = self.client().await?;
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let summaries = Compat::new(client.list_containers(Some(options)))
            .await
            .map_err(|e| engine_error("ps", e))?;
        Ok(summaries.into_iter().map(info_from_summary).collect())
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        let client = self.client().await?;
        let response = Compat::new(client.list_volumes(None::<ListVolumesOptions<String>>))
            .await
            .map_err(|e| engine_error("volume ls", e))?;
        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|volume| VolumeInfo {
                name: volume.name,
                mountpoint: volume.mountpoint,
            })
            .collect())
    }

    async fn create_volume(&self, name: &str, host_path: Option<&Path>) -> Result<()> {
        let client = self.client().await?;
        match Compat::new(client.inspect_volume(name)).await {
            Ok(_) => {
                tracing::debug!(volume = %name, "volume exists");
                return Ok(());
            }
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(engine_error("volume inspect", e)),
        }

        let mut options = CreateVolumeOptions {
            name: name.to_string(),
            ..Default::default()
        };
        if let Some(path) = host_path {
            async_fs::create_dir_all(path).await?;
            options.driver = "local".to_string();
            options.driver_opts = volume_bind_opts(path);
        }
        Compat::new(client.create_volume(options))
            .await
            .map_err(|e| engine_error("volume create", e))?;
        tracing::info!(volume = %name, "volume created");
        Ok(())
    }

    async fn get_container_logs(&self, name: &str, follow: bool) -> Result<LogStream> {
        self.ensure_exists(name).await?;

        let client = self.client().await?.clone();
        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let lines = Compat::new(client.logs(name, Some(options))).map(|frame| {
            frame
                .map(|output| output.to_string().trim_end_matches(['\r', '\n']).to_string())
                .map_err(|e| engine_error("logs", e))
        });
        Ok(lines.boxed())
    }

    async fn add_service(&self, spec: ContainerSpec) -> Result<()> {
        self.catalog.register(spec).await
    }

    async fn services(&self) -> Vec<ContainerSpec> {
        self.catalog.list().await
    }
}

/// `local` driver options that bind-mount `path` into the volume.
fn volume_bind_opts(path: &Path) -> HashMap<String, String> {
    HashMap::from([
        ("type".to_string(), "none".to_string()),
        ("o".to_string(), "bind".to_string()),
        ("device".to_string(), path.display().to_string()),
    ])
}
