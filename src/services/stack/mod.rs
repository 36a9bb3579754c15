//! Stack provider: reconcile a root config against the container fleet.
//!
//! Reconciliation never writes into the `DbConfig` it was given. Each entry
//! yields a [`ResolvedDb`] carrying what was decided (port, password,
//! container, name), and [`ResolvedDb::apply`] produces the config the
//! manager connects with.
//!
//! Entries are handled one at a time, in file order. Containers started for
//! earlier entries are left running when a later entry fails.

mod profile;

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

pub use profile::{Profile, container_name, generated_name, profile};

use crate::error::{Error, Result};
use crate::services::config::{DatabaseKind, DbConfig, RootConfig, env};
use crate::services::credentials::CredentialStore;
use crate::services::engine::{
    ContainerEngine, ContainerInfo, ContainerSpec, StartOutcome, VolumeBinding,
    check_port_bindings, ports,
};
use profile::Credentials;

/// What reconciliation did for one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The canonical container was already running
    AlreadyRunning,
    /// An existing, stopped container was started
    Started,
    /// A fresh container was created
    Created,
    /// Nothing to run (file-based kind)
    Skipped,
}

/// Outputs of reconciling one `DbConfig`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedDb {
    pub id: String,
    pub kind: DatabaseKind,
    /// `None` for kinds without a container
    pub container: Option<String>,
    pub display_name: String,
    pub port: Option<u16>,
    #[serde(skip)]
    pub password: String,
    pub user: String,
    pub db_name: String,
    pub volume_root: Option<PathBuf>,
    pub image: Option<String>,
    pub outcome: Outcome,
}

impl ResolvedDb {
    /// A copy of `db` carrying the resolved values. `db` is untouched.
    pub fn apply(&self, db: &DbConfig) -> DbConfig {
        let mut next = match self.port {
            Some(port) => db.resolved(port, &self.password),
            None => db.clone(),
        };
        if next.name.is_empty() {
            next.name = self.display_name.clone();
        }
        if self.container.is_some() {
            if next.user.is_empty() {
                next.user = self.user.clone();
            }
            if next.db_name.is_empty() {
                next.db_name = self.db_name.clone();
            }
        }
        next
    }
}

/// Result of one reconciliation pass
#[derive(Debug, Default)]
pub struct StackReport {
    pub resolved: Vec<ResolvedDb>,
    /// Entries that were skipped, with the reason, in file order
    pub errors: Vec<(String, Error)>,
}

impl StackReport {
    pub fn get(&self, id: &str) -> Option<&ResolvedDb> {
        self.resolved.iter().find(|r| r.id == id)
    }

    /// `root` with every resolved entry applied. Unresolved entries are kept
    /// as they were.
    pub fn apply(&self, root: &RootConfig) -> RootConfig {
        let mut next = root.clone();
        next.databases = root
            .databases
            .iter()
            .map(|db| match self.get(&db.id) {
                Some(resolved) => resolved.apply(db),
                None => db.clone(),
            })
            .collect();
        next
    }
}

/// Bookkeeping for one reconciliation pass
#[derive(Default)]
struct Run {
    /// Host ports handed out so far
    claimed: HashSet<u16>,
    /// Container name -> the entry that resolved it first
    containers: HashMap<String, ResolvedDb>,
}

type PortProbe = Arc<dyn Fn(u16) -> bool + Send + Sync>;

pub struct StackProvider {
    engine: Arc<dyn ContainerEngine>,
    credentials: CredentialStore,
    volume_root: Option<PathBuf>,
    port_probe: PortProbe,
}

impl std::fmt::Debug for StackProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackProvider")
            .field("engine", &self.engine.name())
            .field("volume_root", &self.volume_root)
            .finish_non_exhaustive()
    }
}

impl StackProvider {
    pub fn new(engine: Arc<dyn ContainerEngine>, credentials: CredentialStore) -> Self {
        Self {
            engine,
            credentials,
            volume_root: None,
            port_probe: Arc::new(ports::is_port_free),
        }
    }

    /// Base directory for per-kind volumes instead of `~/.kubex/kubexdb/volumes`.
    pub fn with_volume_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.volume_root = Some(root.into());
        self
    }

    /// Replace the local "is this port free" check.
    pub fn with_port_probe<F>(mut self, probe: F) -> Self
    where
        F: Fn(u16) -> bool + Send + Sync + 'static,
    {
        self.port_probe = Arc::new(probe);
        self
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// Reconcile and fail with the first per-entry error, if any.
    pub async fn start_services(&self, root: &RootConfig) -> Result<StackReport> {
        let mut report = self.reconcile(root).await?;
        if report.errors.is_empty() {
            Ok(report)
        } else {
            let (_, first) = report.errors.remove(0);
            Err(first)
        }
    }

    /// Reconcile every enabled entry.
    ///
    /// Engine and credential store outages abort the pass. Anything else is
    /// recorded in the report and the pass moves on to the next entry.
    pub async fn reconcile(&self, root: &RootConfig) -> Result<StackReport> {
        if !root.enabled {
            return Err(Error::StackDisabled(root.name.clone()));
        }
        self.engine.initialize().await?;

        let mut run = Run::default();
        let mut report = StackReport::default();
        for db in &root.databases {
            if !db.is_enabled() {
                tracing::info!(id = %db.id, kind = %db.kind, "database disabled, not starting");
                continue;
            }
            match self.resolve_entry(db, &mut run).await {
                Ok(resolved) => report.resolved.push(resolved),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(id = %db.id, kind = %db.kind, error = %e, "skipping database");
                    report.errors.push((db.id.clone(), e));
                }
            }
        }
        Ok(report)
    }

    async fn resolve_entry(&self, db: &DbConfig, run: &mut Run) -> Result<ResolvedDb> {
        let Some(profile) = profile(db.kind) else {
            tracing::info!(id = %db.id, kind = %db.kind, "file-based database, no container needed");
            return Ok(ResolvedDb {
                id: db.id.clone(),
                kind: db.kind,
                container: None,
                display_name: db.label().to_string(),
                port: None,
                password: db.pass.clone(),
                user: db.user.clone(),
                db_name: db.db_name.clone(),
                volume_root: None,
                image: None,
                outcome: Outcome::Skipped,
            });
        };

        let container = container_name(db.kind);
        let password = self.resolve_password(db).await?;
        let mut resolved = ResolvedDb {
            id: db.id.clone(),
            kind: db.kind,
            container: Some(container.clone()),
            display_name: if db.name.is_empty() {
                generated_name(db.kind)
            } else {
                db.name.clone()
            },
            port: db.effective_port(),
            password,
            user: non_empty_or(&db.user, env::DEFAULT_ADMIN),
            db_name: non_empty_or(&db.db_name, env::DEFAULT_DB_NAME),
            volume_root: None,
            image: None,
            outcome: Outcome::AlreadyRunning,
        };

        // Another entry of this pass already owns the canonical container.
        if let Some(first) = run.containers.get(&container) {
            tracing::info!(id = %db.id, container = %container, "sharing container with {}", first.id);
            resolved.port = first.port;
            resolved.volume_root = first.volume_root.clone();
            resolved.image = first.image.clone();
            return Ok(resolved);
        }

        if let Some((outcome, info)) = self.reuse_existing(&container).await? {
            tracing::info!(id = %db.id, container = %container, ?outcome, "using existing container");
            resolved.outcome = outcome;
            resolved.image = Some(info.image.clone());
            match info.published_port(profile.container_port) {
                Some(published) => resolved.port = Some(published),
                None => tracing::warn!(
                    id = %db.id,
                    container = %container,
                    "existing container publishes no port for {}",
                    profile.container_port
                ),
            }
            if let Some(port) = resolved.port {
                run.claimed.insert(port);
            }
            run.containers.insert(container, resolved.clone());
            return Ok(resolved);
        }

        let volume_root = self.volume_root_for(db)?;
        let init_dir = volume_root.join("init");
        let data_dir = volume_root.join("data");
        async_fs::create_dir_all(&data_dir).await?;
        if profile.init_path.is_some() {
            async_fs::create_dir_all(&init_dir).await?;
        }

        let port = self.resolve_port(db, &profile, run)?;
        let image = profile::image_for(db, &profile);

        let mut spec = ContainerSpec::new(&container, &image);
        spec.env = profile::environment(
            db,
            &profile,
            &Credentials {
                user: &resolved.user,
                password: &resolved.password,
                db_name: &resolved.db_name,
            },
        );
        spec.ports.push(self.engine.map_ports(
            &port.to_string(),
            &profile.container_port.to_string(),
        )?);
        if let Some(init_path) = profile.init_path {
            spec.volumes
                .push(VolumeBinding::new(init_dir.display().to_string(), init_path));
        }
        spec.volumes.push(VolumeBinding::new(
            data_dir.display().to_string(),
            profile.data_path,
        ));
        check_port_bindings(&spec.ports)?;

        let outcome = match self.engine.start_container(&spec).await? {
            StartOutcome::Created => Outcome::Created,
            StartOutcome::Restarted => Outcome::Started,
            StartOutcome::AlreadyRunning => Outcome::AlreadyRunning,
        };
        tracing::info!(
            id = %db.id,
            container = %container,
            image = %image,
            port,
            ?outcome,
            "database container ready"
        );

        resolved.port = Some(port);
        resolved.volume_root = Some(volume_root);
        resolved.image = Some(image);
        resolved.outcome = outcome;
        run.claimed.insert(port);
        run.containers.insert(container, resolved.clone());
        Ok(resolved)
    }

    /// The entry's password, or the kind's generated secret.
    async fn resolve_password(&self, db: &DbConfig) -> Result<String> {
        if !db.pass.is_empty() {
            return Ok(db.pass.clone());
        }
        self.credentials
            .get_or_generate(&CredentialStore::name_for(db.kind))
            .await
    }

    /// Running: reuse as is. Present but stopped: start it by name.
    /// Absent: `None`, the caller creates a fresh one.
    ///
    /// The returned snapshot carries the ports the container actually
    /// publishes, which win over whatever the config asks for.
    async fn reuse_existing(&self, container: &str) -> Result<Option<(Outcome, ContainerInfo)>> {
        let Some(info) = self.engine.inspect_container(container).await? else {
            return Ok(None);
        };
        if info.state.is_running() {
            return Ok(Some((Outcome::AlreadyRunning, info)));
        }
        match self.engine.start_container_by_name(container).await {
            Ok(()) => Ok(Some((Outcome::Started, info))),
            Err(Error::ContainerNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn volume_root_for(&self, db: &DbConfig) -> Result<PathBuf> {
        if let Some(volume) = db.option("volume") {
            return Ok(PathBuf::from(volume));
        }
        let base = match &self.volume_root {
            Some(root) => root.clone(),
            None => env::default_volume_root()?,
        };
        Ok(base.join(db.kind.as_str()))
    }

    /// First free port from the configured (or default) one upward.
    ///
    /// An explicit port already handed to an earlier entry of this pass is a
    /// conflict; a port held by some other process is probed past.
    fn resolve_port(&self, db: &DbConfig, profile: &Profile, run: &Run) -> Result<u16> {
        let start = db.effective_port().unwrap_or(profile.container_port);
        if db.port.is_some() && run.claimed.contains(&start) {
            return Err(Error::PortConflict {
                port: start,
                detail: format!("already bound for another database of root config ({})", db.id),
            });
        }

        let probe = self.port_probe.clone();
        let port = ports::probe_port(start, &run.claimed, |port| probe(port)).ok_or_else(|| {
            Error::PortConflict {
                port: start,
                detail: format!(
                    "no free port in {}..={}",
                    start,
                    start.saturating_add(ports::PROBE_WINDOW - 1)
                ),
            }
        })?;
        if port != start {
            tracing::info!(id = %db.id, requested = start, port, "requested port busy, using next free");
        }
        Ok(port)
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}
