#![allow(dead_code)]

use anyhow::bail;
use async_trait::async_trait;
use smol::Timer;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use kubexdb::services::config::{DatabaseKind, DbConfig};
use kubexdb::services::database::drivers::validate;
use kubexdb::services::database::{BoxedDriver, Driver};
use kubexdb::services::deadline::Timeouts;
use kubexdb::services::engine::ContainerEngine;
use kubexdb::services::stack::container_name;
use kubexdb::{BootstrapOptions, CredentialStore, MemoryEngine, Registry};

pub fn fast_timeouts() -> Timeouts {
    Timeouts {
        connect: Duration::from_millis(400),
        ping: Duration::from_millis(100),
    }
}

/// A server-kind entry that passes validation.
pub fn server_db(id: &str, kind: DatabaseKind) -> DbConfig {
    let mut db = DbConfig::new(id, kind);
    db.user = "app".to_string();
    db.db_name = "app".to_string();
    db
}

/// Driver whose server is the kind's canonical container in a
/// [`MemoryEngine`]: reachable exactly while that container runs.
///
/// `connect` waits for the container to come up and relies on the caller's
/// deadline to give up.
pub struct ContainerDriver {
    kind: DatabaseKind,
    engine: Arc<MemoryEngine>,
    connected: AtomicBool,
    connects: Arc<AtomicUsize>,
}

impl ContainerDriver {
    /// Refuse configs that would miss the container: wrong published port
    /// or a password the container was not created with.
    async fn check_reachable(&self, config: &DbConfig) -> anyhow::Result<()> {
        let name = container_name(self.kind);
        let Some(spec) = self.engine.spec_of(&name).await else {
            bail!("{} vanished", name);
        };
        let published = spec.ports.first().map(|binding| binding.host_port);
        if config.port != published {
            bail!("nothing listens on {:?}, {} publishes {:?}", config.port, name, published);
        }
        let accepted = spec
            .env
            .iter()
            .any(|(key, value)| key.ends_with("PASSWORD") && *value == config.pass);
        if !accepted {
            bail!("authentication failed for {}", config.user);
        }
        Ok(())
    }

    async fn running(&self) -> bool {
        matches!(
            self.engine.container_state(&container_name(self.kind)).await,
            Ok(Some(state)) if state.is_running()
        )
    }
}

#[async_trait]
impl Driver for ContainerDriver {
    fn kind(&self) -> DatabaseKind {
        self.kind
    }

    async fn connect(&self, config: &DbConfig) -> anyhow::Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        while !self.running().await {
            Timer::after(Duration::from_millis(10)).await;
        }
        self.check_reachable(config).await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.running().await
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Registry with a [`ContainerDriver`] for each of `kinds`, plus the
/// stock validators. Returns the shared connect counter.
pub fn container_registry(
    engine: &Arc<MemoryEngine>,
    kinds: &[DatabaseKind],
) -> (Registry, Arc<AtomicUsize>) {
    let connects = Arc::new(AtomicUsize::new(0));
    let mut registry = Registry::new();
    for &kind in kinds {
        let engine = engine.clone();
        let counter = connects.clone();
        registry
            .register_validator(kind, validate::for_kind(kind))
            .register_driver(kind, move || -> BoxedDriver {
                Box::new(ContainerDriver {
                    kind,
                    engine: engine.clone(),
                    connected: AtomicBool::new(false),
                    connects: counter.clone(),
                })
            });
    }
    (registry, connects)
}

/// Options wired to `engine` with an in-memory keyring and volumes under
/// `volumes`.
pub fn engine_options(
    engine: &Arc<MemoryEngine>,
    registry: Registry,
    credentials: CredentialStore,
    volumes: &Path,
) -> BootstrapOptions {
    BootstrapOptions::default()
        .with_registry(registry)
        .with_engine(engine.clone())
        .with_credentials(credentials)
        .with_volume_root(volumes)
        .with_timeouts(fast_timeouts())
}
