//! The container engine seam.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::path::Path;

use super::ports;
use super::types::{ContainerInfo, ContainerSpec, ContainerState, PortBinding, StartOutcome, VolumeInfo};
use crate::error::Result;

/// Lines of container output. Dropping the stream stops a `follow`.
pub type LogStream = BoxStream<'static, Result<String>>;

/// Minimum surface the stack provider and CLI need from a container engine.
///
/// Idempotent operations succeed when the target state already holds.
/// Engine failures are surfaced as-is; callers decide whether to retry.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Short engine name for logs
    fn name(&self) -> &'static str;

    /// Fails with `EngineUnavailable` when the engine cannot be reached.
    async fn initialize(&self) -> Result<()>;

    /// Address containers publish their ports on, as seen from the host.
    fn host_ip(&self) -> String;

    /// Current snapshot, including published ports. `None` when no
    /// container has this name.
    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>>;

    /// `None` when no container has this name.
    async fn container_state(&self, name: &str) -> Result<Option<ContainerState>> {
        Ok(self.inspect_container(name).await?.map(|info| info.state))
    }

    /// Running: no-op. Stopped: restart. Absent: create and start.
    async fn start_container(&self, spec: &ContainerSpec) -> Result<StartOutcome>;

    /// Absent or already stopped is success.
    async fn stop_container(&self, name: &str) -> Result<()>;

    /// Stops and deletes; absent is success.
    async fn remove_container(&self, name: &str) -> Result<()>;

    /// Start an existing container. Absent fails with `ContainerNotFound`.
    async fn start_container_by_name(&self, name: &str) -> Result<()>;

    /// Stop an existing container. Absent fails with `ContainerNotFound`.
    async fn stop_container_by_name(&self, name: &str) -> Result<()>;

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>>;

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>>;

    /// Create a named volume, bind-mounted to `host_path` when given.
    async fn create_volume(&self, name: &str, host_path: Option<&Path>) -> Result<()>;

    async fn get_container_logs(&self, name: &str, follow: bool) -> Result<LogStream>;

    /// Record an intended service without starting it.
    async fn add_service(&self, spec: ContainerSpec) -> Result<()>;

    /// Services recorded by [`ContainerEngine::add_service`].
    async fn services(&self) -> Vec<ContainerSpec>;

    async fn restart_container(&self, name: &str) -> Result<()> {
        self.stop_container_by_name(name).await?;
        self.start_container_by_name(name).await
    }

    fn map_ports(&self, host_port: &str, container_port: &str) -> Result<PortBinding> {
        ports::map_ports(&self.host_ip(), host_port, container_port)
    }
}
