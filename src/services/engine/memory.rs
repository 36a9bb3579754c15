//! In-process engine used for dry runs and tests.
//!
//! Containers are plain records; nothing is executed. Every mutating call is
//! appended to a call log so callers can assert on side effects.

use async_channel::Sender;
use async_lock::RwLock;
use async_trait::async_trait;
use futures::{StreamExt, stream};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use super::catalog::ServiceCatalog;
use super::ports::{DESKTOP_HOST_ALIAS, LOOPBACK, check_port_bindings};
use super::traits::{ContainerEngine, LogStream};
use super::types::{ContainerInfo, ContainerSpec, ContainerState, StartOutcome, VolumeInfo};
use crate::error::{Error, Result};

/// A side effect recorded by [`MemoryEngine`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Create(String),
    Start(String),
    Stop(String),
    Remove(String),
    CreateVolume(String),
}

#[derive(Debug)]
struct MemoryContainer {
    id: String,
    spec: ContainerSpec,
    state: ContainerState,
    logs: Vec<String>,
    followers: Vec<Sender<String>>,
}

impl MemoryContainer {
    fn info(&self, name: &str) -> ContainerInfo {
        ContainerInfo {
            id: self.id.clone(),
            name: name.to_string(),
            image: self.spec.image.clone(),
            state: self.state.clone(),
            status: self.state.to_string(),
            ports: self.spec.ports.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    containers: BTreeMap<String, MemoryContainer>,
    volumes: BTreeMap<String, VolumeInfo>,
    calls: Vec<EngineCall>,
}

#[derive(Debug)]
pub struct MemoryEngine {
    state: RwLock<MemoryState>,
    catalog: ServiceCatalog,
    host: String,
    available: AtomicBool,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_host(LOOPBACK)
    }

    /// Behaves like a desktop engine reachable through the host alias.
    pub fn desktop() -> Self {
        Self::with_host(DESKTOP_HOST_ALIAS)
    }

    fn with_host(host: &str) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            catalog: ServiceCatalog::new(),
            host: host.to_string(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the daemon going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Seed a container as if something outside this process had started it.
    pub async fn insert_container(&self, spec: ContainerSpec, state: ContainerState) {
        let mut inner = self.state.write().await;
        let id = format!("mem-{}", inner.containers.len() + 1);
        inner.containers.insert(
            spec.name.clone(),
            MemoryContainer {
                id,
                spec,
                state,
                logs: Vec::new(),
                followers: Vec::new(),
            },
        );
    }

    /// Change a container's state behind the adapter's back.
    pub async fn set_state(&self, name: &str, state: ContainerState) -> Result<()> {
        let mut inner = self.state.write().await;
        let container = inner
            .containers
            .get_mut(name)
            .ok_or_else(|| Error::ContainerNotFound(name.to_string()))?;
        container.state = state;
        Ok(())
    }

    /// Append a log line and hand it to every active follower.
    pub async fn push_log(&self, name: &str, line: impl Into<String>) -> Result<()> {
        let line = line.into();
        let mut inner = self.state.write().await;
        let container = inner
            .containers
            .get_mut(name)
            .ok_or_else(|| Error::ContainerNotFound(name.to_string()))?;
        container.followers.retain(|tx| tx.try_send(line.clone()).is_ok());
        container.logs.push(line);
        Ok(())
    }

    pub async fn calls(&self) -> Vec<EngineCall> {
        self.state.read().await.calls.clone()
    }

    /// Specs of containers this engine created (not seeded ones).
    pub async fn created(&self) -> Vec<ContainerSpec> {
        let inner = self.state.read().await;
        inner
            .calls
            .iter()
            .filter_map(|call| match call {
                EngineCall::Create(name) => inner.containers.get(name).map(|c| c.spec.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn spec_of(&self, name: &str) -> Option<ContainerSpec> {
        self.state
            .read()
            .await
            .containers
            .get(name)
            .map(|c| c.spec.clone())
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::EngineUnavailable("memory engine switched off".to_string()))
        }
    }
}

#[async_trait]
impl ContainerEngine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn initialize(&self) -> Result<()> {
        self.ensure_available()
    }

    fn host_ip(&self) -> String {
        self.host.clone()
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>> {
        self.ensure_available()?;
        Ok(self
            .state
            .read()
            .await
            .containers
            .get(name)
            .map(|c| c.info(name)))
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<StartOutcome> {
        self.ensure_available()?;
        check_port_bindings(&spec.ports)?;

        let mut guard = self.state.write().await;
        let inner = &mut *guard;
        if let Some(container) = inner.containers.get_mut(&spec.name) {
            if container.state.is_running() {
                return Ok(StartOutcome::AlreadyRunning);
            }
            container.state = ContainerState::Running;
            inner.calls.push(EngineCall::Start(spec.name.clone()));
            return Ok(StartOutcome::Restarted);
        }

        let id = format!("mem-{}", inner.containers.len() + 1);
        inner.containers.insert(
            spec.name.clone(),
            MemoryContainer {
                id,
                spec: spec.clone(),
                state: ContainerState::Running,
                logs: Vec::new(),
                followers: Vec::new(),
            },
        );
        inner.calls.push(EngineCall::Create(spec.name.clone()));
        Ok(StartOutcome::Created)
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        self.ensure_available()?;
        let mut guard = self.state.write().await;
        let inner = &mut *guard;
        if let Some(container) = inner.containers.get_mut(name) {
            if container.state.is_active() {
                container.state = ContainerState::Exited;
                inner.calls.push(EngineCall::Stop(name.to_string()));
            }
        }
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.ensure_available()?;
        let mut inner = self.state.write().await;
        if inner.containers.remove(name).is_some() {
            inner.calls.push(EngineCall::Remove(name.to_string()));
        }
        Ok(())
    }

    async fn start_container_by_name(&self, name: &str) -> Result<()> {
        self.ensure_available()?;
        let mut guard = self.state.write().await;
        let inner = &mut *guard;
        let container = inner
            .containers
            .get_mut(name)
            .ok_or_else(|| Error::ContainerNotFound(name.to_string()))?;
        if !container.state.is_running() {
            container.state = ContainerState::Running;
            inner.calls.push(EngineCall::Start(name.to_string()));
        }
        Ok(())
    }

    async fn stop_container_by_name(&self, name: &str) -> Result<()> {
        self.ensure_available()?;
        let mut guard = self.state.write().await;
        let inner = &mut *guard;
        let container = inner
            .containers
            .get_mut(name)
            .ok_or_else(|| Error::ContainerNotFound(name.to_string()))?;
        if container.state.is_active() {
            container.state = ContainerState::Exited;
            inner.calls.push(EngineCall::Stop(name.to_string()));
        }
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        self.ensure_available()?;
        Ok(self
            .state
            .read()
            .await
            .containers
            .iter()
            .map(|(name, c)| c.info(name))
            .collect())
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>> {
        self.ensure_available()?;
        Ok(self.state.read().await.volumes.values().cloned().collect())
    }

    async fn create_volume(&self, name: &str, host_path: Option<&Path>) -> Result<()> {
        self.ensure_available()?;
        let mut inner = self.state.write().await;
        if inner.volumes.contains_key(name) {
            return Ok(());
        }
        let mountpoint = host_path
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| format!("/var/lib/docker/volumes/{}/_data", name));
        inner.volumes.insert(
            name.to_string(),
            VolumeInfo {
                name: name.to_string(),
                mountpoint,
            },
        );
        inner.calls.push(EngineCall::CreateVolume(name.to_string()));
        Ok(())
    }

    async fn get_container_logs(&self, name: &str, follow: bool) -> Result<LogStream> {
        self.ensure_available()?;
        let mut inner = self.state.write().await;
        let container = inner
            .containers
            .get_mut(name)
            .ok_or_else(|| Error::ContainerNotFound(name.to_string()))?;

        let backlog = stream::iter(container.logs.clone().into_iter().map(Ok));
        if !follow {
            return Ok(backlog.boxed());
        }
        let (tx, rx) = async_channel::unbounded();
        container.followers.push(tx);
        Ok(backlog.chain(rx.map(Ok)).boxed())
    }

    async fn add_service(&self, spec: ContainerSpec) -> Result<()> {
        self.catalog.register(spec).await
    }

    async fn services(&self) -> Vec<ContainerSpec> {
        self.catalog.list().await
    }
}
