//! Single-entry bootstrap: config, containers, connections.
//!
//! ```ignore
//! let runtime = kubexdb::bootstrap(None, BootstrapOptions::from_env()?).await?;
//! let conn = runtime.conn("primary").await?;
//! assert!(conn.driver().ping().await);
//! drop(conn);
//! runtime.shutdown().await?;
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::services::config::{self, RootConfig, env};
use crate::services::credentials::CredentialStore;
use crate::services::database::{ConnectionRef, DatabaseManager, Registry};
use crate::services::deadline::Timeouts;
use crate::services::engine::ContainerEngine;
use crate::services::stack::{ResolvedDb, StackProvider};

/// Inputs to [`bootstrap`]
#[derive(Clone)]
pub struct BootstrapOptions {
    /// Root config file. Required when no config value is passed.
    pub file_path: Option<PathBuf>,
    pub registry: Arc<Registry>,
    /// When set, containers are reconciled before connecting.
    pub engine: Option<Arc<dyn ContainerEngine>>,
    /// Defaults to the system keyring when an engine is set.
    pub credentials: Option<CredentialStore>,
    pub key_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub volume_root: Option<PathBuf>,
    pub timeouts: Timeouts,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            file_path: None,
            registry: Arc::new(Registry::with_defaults()),
            engine: None,
            credentials: None,
            key_file: None,
            cert_file: None,
            volume_root: None,
            timeouts: Timeouts::default(),
        }
    }
}

impl std::fmt::Debug for BootstrapOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapOptions")
            .field("file_path", &self.file_path)
            .field("registry", &self.registry)
            .field("engine", &self.engine.as_ref().map(|engine| engine.name()))
            .field("key_file", &self.key_file)
            .field("cert_file", &self.cert_file)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl BootstrapOptions {
    /// Config path, TLS key and cert from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(env::non_empty_var)
    }

    /// Like [`BootstrapOptions::from_env`] with a custom variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file_path = match lookup(env::CONFIG_FILE_VAR) {
            Some(path) => PathBuf::from(path),
            None => env::home_dir()?.join("config.json"),
        };
        Ok(Self {
            file_path: Some(file_path),
            key_file: lookup(env::KEY_FILE_VAR).map(PathBuf::from),
            cert_file: lookup(env::CERT_FILE_VAR).map(PathBuf::from),
            ..Self::default()
        })
    }

    pub fn with_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_engine(mut self, engine: Arc<dyn ContainerEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_credentials(mut self, credentials: CredentialStore) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_volume_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.volume_root = Some(root.into());
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

/// Handle returned by [`bootstrap`]
pub struct Runtime {
    config: RootConfig,
    manager: Arc<DatabaseManager>,
    resolved: Vec<ResolvedDb>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config.name)
            .field("databases", &self.config.databases.len())
            .field("resolved", &self.resolved.len())
            .finish()
    }
}

impl Runtime {
    /// The effective config the manager connected with.
    pub fn config(&self) -> &RootConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<DatabaseManager> {
        &self.manager
    }

    /// Reconciliation results; empty when no engine was used.
    pub fn resolved(&self) -> &[ResolvedDb] {
        &self.resolved
    }

    pub async fn health_check(&self) -> Result<()> {
        self.manager.health_check().await
    }

    /// A live connection by id or name.
    pub async fn conn(&self, name: &str) -> Result<ConnectionRef<'_>> {
        self.manager.secure_conn(name).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.manager.shutdown().await
    }
}

/// Load (or take) the root config, reconcile containers when an engine is
/// given, then connect every enabled database.
///
/// Fails only when no usable connection can come out of it: no config
/// source, an unreadable config, an engine or keyring outage, or zero
/// connections.
pub async fn bootstrap(config: Option<RootConfig>, opts: BootstrapOptions) -> Result<Runtime> {
    let root = match config {
        Some(root) => root,
        None => {
            let path = opts
                .file_path
                .as_ref()
                .filter(|path| !path.as_os_str().is_empty())
                .ok_or(Error::NoConfigSource)?;
            config::load_or_bootstrap(path).await?
        }
    };
    root.validate()?;
    if !root.enabled {
        return Err(Error::StackDisabled(root.name.clone()));
    }

    let (mut effective, resolved) = match &opts.engine {
        Some(engine) => {
            let credentials = match &opts.credentials {
                Some(store) => store.clone(),
                None => CredentialStore::system()?,
            };
            let mut provider = StackProvider::new(engine.clone(), credentials);
            if let Some(root) = &opts.volume_root {
                provider = provider.with_volume_root(root);
            }
            let report = provider.reconcile(&root).await?;
            for (id, e) in &report.errors {
                tracing::warn!(id = %id, error = %e, "database not provisioned");
            }
            (report.apply(&root), report.resolved)
        }
        None => (root, Vec::new()),
    };

    inject_tls(&mut effective, &opts);

    let manager = Arc::new(DatabaseManager::with_timeouts(
        opts.registry.clone(),
        opts.timeouts,
    ));
    manager.init_from_root(&effective).await?;
    tracing::info!(
        config = %effective.name,
        connections = manager.len().await,
        "runtime ready"
    );

    Ok(Runtime {
        config: effective,
        manager,
        resolved,
    })
}

/// Hand the TLS key and cert to every TLS-enabled entry that has none.
fn inject_tls(root: &mut RootConfig, opts: &BootstrapOptions) {
    for db in root.databases.iter_mut().filter(|db| db.tls) {
        if let Some(key) = &opts.key_file {
            db.options
                .entry("sslkey".to_string())
                .or_insert_with(|| key.display().to_string());
        }
        if let Some(cert) = &opts.cert_file {
            db.options
                .entry("sslcert".to_string())
                .or_insert_with(|| cert.display().to_string());
        }
    }
}
