//! Registry of drivers, validators and migrators per database kind.
//!
//! Built once at start-up and handed to the manager behind an `Arc`; after
//! that every lookup is a plain map read.

use std::collections::HashMap;
use std::sync::Arc;

use super::memory::MemoryProbe;
use super::mysql::MySqlDriver;
use super::postgres::PostgresDriver;
use super::sqlite::SqliteDriver;
use super::validate;
use crate::error::{Error, Result};
use crate::services::config::{DatabaseKind, DbConfig};
use crate::services::database::traits::{BoxedDriver, Migrator};

pub type DriverFactory = Arc<dyn Fn() -> BoxedDriver + Send + Sync>;
pub type Validator = Arc<dyn Fn(&DbConfig) -> std::result::Result<(), String> + Send + Sync>;

/// Kind-indexed factories.
///
/// # Example
///
/// ```ignore
/// let mut registry = Registry::with_defaults();
/// registry.register_migrator(DatabaseKind::Postgres, Arc::new(MyMigrator));
/// let manager = DatabaseManager::new(Arc::new(registry));
/// ```
#[derive(Clone, Default)]
pub struct Registry {
    drivers: HashMap<DatabaseKind, DriverFactory>,
    validators: HashMap<DatabaseKind, Validator>,
    migrators: HashMap<DatabaseKind, Arc<dyn Migrator>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .field("validators", &self.validators.keys().collect::<Vec<_>>())
            .field("migrators", &self.migrators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validators for every kind and the SQLx drivers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::with_validators();
        registry
            .register_driver(DatabaseKind::Postgres, PostgresDriver::boxed)
            .register_driver(DatabaseKind::MySql, MySqlDriver::boxed)
            .register_driver(DatabaseKind::Sqlite, SqliteDriver::boxed);
        registry
    }

    /// Validators for every kind and a memory driver for every kind, all
    /// reporting into `probe`.
    pub fn in_memory(probe: &MemoryProbe) -> Self {
        let mut registry = Self::with_validators();
        for kind in DatabaseKind::all() {
            let probe = probe.clone();
            registry.register_driver(kind, move || probe.driver(kind));
        }
        registry
    }

    fn with_validators() -> Self {
        let mut registry = Self::new();
        for kind in DatabaseKind::all() {
            registry.register_validator(kind, validate::for_kind(kind));
        }
        registry
    }

    pub fn register_driver<F>(&mut self, kind: DatabaseKind, factory: F) -> &mut Self
    where
        F: Fn() -> BoxedDriver + Send + Sync + 'static,
    {
        self.drivers.insert(kind, Arc::new(factory));
        self
    }

    pub fn register_validator<F>(&mut self, kind: DatabaseKind, validator: F) -> &mut Self
    where
        F: Fn(&DbConfig) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.validators.insert(kind, Arc::new(validator));
        self
    }

    pub fn register_migrator(&mut self, kind: DatabaseKind, migrator: Arc<dyn Migrator>) -> &mut Self {
        self.migrators.insert(kind, migrator);
        self
    }

    pub fn has_driver(&self, kind: DatabaseKind) -> bool {
        self.drivers.contains_key(&kind)
    }

    /// Kinds with a registered driver, sorted.
    pub fn supported_kinds(&self) -> Vec<DatabaseKind> {
        let mut kinds: Vec<_> = self.drivers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Build a fresh, unconnected driver for `kind`.
    pub fn driver(&self, kind: DatabaseKind) -> Result<BoxedDriver> {
        self.drivers
            .get(&kind)
            .map(|factory| factory())
            .ok_or(Error::DriverUnavailable(kind))
    }

    /// Run the kind's validator. Kinds without one pass.
    pub fn validate(&self, config: &DbConfig) -> Result<()> {
        match self.validators.get(&config.kind) {
            Some(validator) => validator(config).map_err(|reason| Error::ValidationFailed {
                id: config.id.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }

    pub fn migrator(&self, kind: DatabaseKind) -> Result<Arc<dyn Migrator>> {
        self.migrators
            .get(&kind)
            .cloned()
            .ok_or(Error::MigratorUnavailable(kind))
    }
}
