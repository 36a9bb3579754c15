//! Database manager owning every live connection.
//!
//! One `async_lock::RwLock` covers the connection map and the default id.
//! `init_from_root` and `shutdown` take the writer role; lookups take the
//! reader role and hand it to the caller through [`ConnectionRef`], so a
//! shutdown waits until every borrowed connection has been released.

use async_lock::{RwLock, RwLockReadGuard};
use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::Arc;

use super::connection::{ConnectionStatus, DbConnection};
use super::drivers::Registry;
use crate::error::{Error, Result};
use crate::services::config::RootConfig;
use crate::services::deadline::Timeouts;

#[derive(Debug, Default)]
struct ManagerState {
    connections: HashMap<String, Arc<DbConnection>>,
    /// Ids in config order
    order: Vec<String>,
    default_id: Option<String>,
    closed: bool,
}

impl ManagerState {
    fn ordered(&self) -> impl Iterator<Item = &Arc<DbConnection>> {
        self.order.iter().filter_map(|id| self.connections.get(id))
    }

    /// Id first, then the human name.
    fn resolve(&self, name: &str) -> Option<&Arc<DbConnection>> {
        self.connections
            .get(name)
            .or_else(|| self.ordered().find(|conn| conn.config().name == name))
    }
}

/// A connection borrowed from the manager.
///
/// Holds the manager's read lock until dropped. Do not keep one across
/// another manager call that may need the write lock.
pub struct ConnectionRef<'a> {
    _guard: RwLockReadGuard<'a, ManagerState>,
    conn: Arc<DbConnection>,
}

impl Deref for ConnectionRef<'_> {
    type Target = DbConnection;

    fn deref(&self) -> &DbConnection {
        &self.conn
    }
}

impl std::fmt::Debug for ConnectionRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ConnectionRef").field(&self.conn).finish()
    }
}

pub struct DatabaseManager {
    registry: Arc<Registry>,
    timeouts: Timeouts,
    state: RwLock<ManagerState>,
}

impl std::fmt::Debug for DatabaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseManager")
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl DatabaseManager {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_timeouts(registry, Timeouts::default())
    }

    pub fn with_timeouts(registry: Arc<Registry>, timeouts: Timeouts) -> Self {
        Self {
            registry,
            timeouts,
            state: RwLock::new(ManagerState::default()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Connect every enabled entry of `root`, replacing any previous set.
    ///
    /// Entries without an id, repeating an earlier id, failing validation,
    /// lacking a driver or failing to connect are logged and skipped. Fails with `NoConnectionsAvailable` if none remain.
    pub async fn init_from_root(&self, root: &RootConfig) -> Result<()> {
        let mut state = self.state.write().await;

        let previous = std::mem::take(&mut *state);
        for conn in previous.connections.values() {
            if let Err(e) = conn.close().await {
                tracing::warn!(id = %conn.id(), error = %e, "closing replaced connection failed");
            }
        }

        let mut next = ManagerState::default();
        let mut seen = HashSet::new();
        for db in &root.databases {
            if !db.is_enabled() {
                tracing::info!(id = %db.id, kind = %db.kind, "database disabled, skipping");
                continue;
            }
            if db.id.trim().is_empty() {
                tracing::warn!(kind = %db.kind, name = %db.label(), "database has no id, skipping");
                continue;
            }
            // first enabled entry owns the id, even if it then fails to connect
            if !seen.insert(db.id.as_str()) {
                tracing::warn!(id = %db.id, kind = %db.kind, "duplicate database id, skipping");
                continue;
            }
            if let Err(e) = self.registry.validate(db) {
                tracing::warn!(id = %db.id, kind = %db.kind, error = %e, "skipping database");
                continue;
            }
            let driver = match self.registry.driver(db.kind) {
                Ok(driver) => driver,
                Err(e) => {
                    tracing::warn!(id = %db.id, kind = %db.kind, error = %e, "skipping database");
                    continue;
                }
            };

            let conn = Arc::new(DbConnection::new(db.clone(), driver));
            if let Err(e) = conn.connect(&self.timeouts).await {
                tracing::warn!(id = %db.id, kind = %db.kind, error = %e, "skipping database");
                continue;
            }
            tracing::info!(id = %db.id, kind = %db.kind, name = %db.label(), "database connected");
            next.order.push(db.id.clone());
            next.connections.insert(db.id.clone(), conn);
        }

        let default_id = next
            .ordered()
            .find(|conn| conn.config().is_default)
            .or_else(|| next.ordered().next())
            .map(|conn| conn.id().to_string());
        next.default_id = default_id;

        if next.connections.is_empty() {
            return Err(Error::NoConnectionsAvailable);
        }
        if let Some(id) = &next.default_id {
            tracing::debug!(id = %id, "default database elected");
        }
        *state = next;
        Ok(())
    }

    pub async fn get_default(&self) -> Option<ConnectionRef<'_>> {
        let guard = self.state.read().await;
        let conn = guard
            .default_id
            .as_ref()
            .and_then(|id| guard.connections.get(id))
            .cloned()?;
        Some(ConnectionRef {
            _guard: guard,
            conn,
        })
    }

    pub async fn get_by_id(&self, id: &str) -> Option<ConnectionRef<'_>> {
        let guard = self.state.read().await;
        let conn = guard.connections.get(id).cloned()?;
        Some(ConnectionRef {
            _guard: guard,
            conn,
        })
    }

    /// Look up by id or name and make sure the connection is live,
    /// reconnecting with the same config when the ping fails.
    pub async fn secure_conn(&self, name: &str) -> Result<ConnectionRef<'_>> {
        let guard = self.state.read().await;
        if guard.closed {
            return Err(Error::ManagerClosed);
        }
        let conn = guard
            .resolve(name)
            .cloned()
            .ok_or_else(|| Error::ConnectionNotFound(name.to_string()))?;

        conn.ensure_live(&self.timeouts).await?;
        Ok(ConnectionRef {
            _guard: guard,
            conn,
        })
    }

    /// Ping every connection; the first dead one fails the check.
    pub async fn health_check(&self) -> Result<()> {
        let guard = self.state.read().await;
        if guard.closed {
            return Err(Error::ManagerClosed);
        }
        for conn in guard.ordered() {
            if !conn.ping(self.timeouts.ping).await {
                tracing::warn!(id = %conn.id(), kind = %conn.kind(), "health check failed");
                return Err(Error::HealthCheckFailed {
                    id: conn.id().to_string(),
                    kind: conn.kind(),
                });
            }
        }
        Ok(())
    }

    /// Run the registered migrator for one connection.
    pub async fn migrate(&self, id: &str) -> Result<()> {
        let conn = self
            .get_by_id(id)
            .await
            .ok_or_else(|| Error::ConnectionNotFound(id.to_string()))?;
        let migrator = self.registry.migrator(conn.kind())?;
        let info = conn.config().migration.clone().unwrap_or_default();

        tracing::info!(id = %id, kind = %conn.kind(), path = %info.path, "running migrations");
        migrator
            .migrate(conn.config(), &info)
            .await
            .map_err(|e| Error::Migration {
                id: id.to_string(),
                reason: format!("{:#}", e),
            })
    }

    /// Close every driver. Failures are collected, never short-circuited.
    pub async fn shutdown(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.closed = true;
        state.default_id = None;
        state.order.clear();

        let mut errors = Vec::new();
        for (id, conn) in state.connections.drain() {
            match conn.close().await {
                Ok(()) => tracing::debug!(id = %id, "connection closed"),
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "close failed");
                    errors.push(format!("{}: {:#}", id, e));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Shutdown(errors))
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.state.read().await.closed
    }

    /// Connection ids in config order.
    pub async fn ids(&self) -> Vec<String> {
        self.state.read().await.order.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn statuses(&self) -> Vec<ConnectionStatus> {
        let guard = self.state.read().await;
        guard
            .ordered()
            .map(|conn| conn.status(guard.default_id.as_deref() == Some(conn.id())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::config::{DatabaseKind, DbConfig, MigrationInfo};
    use crate::services::database::drivers::MemoryProbe;
    use crate::services::database::traits::Migrator;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn db(id: &str, kind: DatabaseKind) -> DbConfig {
        let mut db = DbConfig::new(id, kind);
        db.name = format!("{}-name", id);
        db.user = "kubexdb".into();
        db.db_name = "kubexdb".into();
        db
    }

    fn manager(probe: &MemoryProbe) -> DatabaseManager {
        DatabaseManager::with_timeouts(
            Arc::new(Registry::in_memory(probe)),
            Timeouts {
                connect: Duration::from_millis(200),
                ping: Duration::from_millis(100),
            },
        )
    }

    #[test]
    fn test_default_election_prefers_flag() {
        smol::block_on(async {
            let probe = MemoryProbe::new();
            let manager = manager(&probe);
            let mut b = db("b", DatabaseKind::Postgres);
            b.is_default = true;
            let root = RootConfig::new("stack", vec![db("a", DatabaseKind::Postgres), b]);

            manager.init_from_root(&root).await.unwrap();
            assert_eq!(manager.get_default().await.unwrap().id(), "b");
            assert_eq!(manager.ids().await, vec!["a", "b"]);
        });
    }

    #[test]
    fn test_default_falls_back_to_first() {
        smol::block_on(async {
            let probe = MemoryProbe::new();
            let manager = manager(&probe);
            let root = RootConfig::new(
                "stack",
                vec![db("a", DatabaseKind::Postgres), db("b", DatabaseKind::MySql)],
            );
            manager.init_from_root(&root).await.unwrap();
            assert_eq!(manager.get_default().await.unwrap().id(), "a");
        });
    }

    #[test]
    fn test_skips_invalid_and_driverless() {
        smol::block_on(async {
            let probe = MemoryProbe::new();
            let mut registry = Registry::new();
            registry.register_driver(DatabaseKind::Postgres, {
                let probe = probe.clone();
                move || probe.driver(DatabaseKind::Postgres)
            });
            registry.register_validator(DatabaseKind::Postgres, |db| {
                if db.user.is_empty() { Err("no user".into()) } else { Ok(()) }
            });
            let manager = DatabaseManager::new(Arc::new(registry));

            let mut invalid = db("invalid", DatabaseKind::Postgres);
            invalid.user.clear();
            let root = RootConfig::new(
                "stack",
                vec![
                    invalid,
                    db("ok", DatabaseKind::Postgres),
                    db("mongo", DatabaseKind::MongoDb),
                ],
            );
            manager.init_from_root(&root).await.unwrap();
            assert_eq!(manager.ids().await, vec!["ok"]);
            assert!(manager.get_by_id("mongo").await.is_none());
        });
    }

    #[test]
    fn test_blank_and_repeated_ids_never_connect() {
        smol::block_on(async {
            let probe = MemoryProbe::new();
            let manager = manager(&probe);
            let mut twin = db("a", DatabaseKind::Postgres);
            twin.name = "twin".into();
            twin.is_default = true;
            let root = RootConfig::new(
                "stack",
                vec![
                    db("a", DatabaseKind::Postgres),
                    db("", DatabaseKind::Postgres),
                    db("  ", DatabaseKind::Postgres),
                    twin,
                ],
            );

            manager.init_from_root(&root).await.unwrap();
            assert_eq!(manager.ids().await, vec!["a"]);
            assert_eq!(manager.get_default().await.unwrap().config().name, "a-name");
            assert_eq!(probe.connects(), 1);

            manager.shutdown().await.unwrap();
            assert_eq!(probe.closes(), probe.connects());
        });
    }

    #[test]
    fn test_empty_result_is_fatal() {
        smol::block_on(async {
            let probe = MemoryProbe::new();
            probe.set_reachable(false);
            let manager = manager(&probe);
            let root = RootConfig::new("stack", vec![db("a", DatabaseKind::Postgres)]);
            assert!(matches!(
                manager.init_from_root(&root).await,
                Err(Error::NoConnectionsAvailable)
            ));
            assert!(manager.is_empty().await);
        });
    }

    #[test]
    fn test_reinit_replaces_previous_set() {
        smol::block_on(async {
            let probe = MemoryProbe::new();
            let manager = manager(&probe);
            let first = RootConfig::new("one", vec![db("a", DatabaseKind::Postgres)]);
            let second = RootConfig::new("two", vec![db("b", DatabaseKind::Postgres)]);
            manager.init_from_root(&first).await.unwrap();
            manager.init_from_root(&second).await.unwrap();
            assert_eq!(manager.ids().await, vec!["b"]);
            assert_eq!(probe.closes(), 1);
        });
    }

    #[test]
    fn test_secure_conn_by_name_and_reconnect() {
        smol::block_on(async {
            let probe = MemoryProbe::new();
            let manager = manager(&probe);
            let root = RootConfig::new("stack", vec![db("a", DatabaseKind::Postgres)]);
            manager.init_from_root(&root).await.unwrap();

            assert_eq!(manager.secure_conn("a-name").await.unwrap().id(), "a");

            probe.set_reachable(false);
            assert!(matches!(
                manager.secure_conn("a").await,
                Err(Error::ReconnectFailed { .. })
            ));
            assert!(matches!(
                manager.health_check().await,
                Err(Error::HealthCheckFailed { .. })
            ));

            probe.set_reachable(true);
            let conn = manager.secure_conn("a").await.unwrap();
            assert!(conn.is_connected());
            drop(conn);
            manager.health_check().await.unwrap();

            assert!(matches!(
                manager.secure_conn("nope").await,
                Err(Error::ConnectionNotFound(_))
            ));
        });
    }

    #[test]
    fn test_shutdown_collects_errors_and_closes() {
        smol::block_on(async {
            let probe = MemoryProbe::new();
            let manager = manager(&probe);
            let root = RootConfig::new(
                "stack",
                vec![db("a", DatabaseKind::Postgres), db("b", DatabaseKind::Postgres)],
            );
            manager.init_from_root(&root).await.unwrap();

            probe.set_fail_close(true);
            match manager.shutdown().await {
                Err(Error::Shutdown(errors)) => assert_eq!(errors.len(), 2),
                other => panic!("unexpected: {:?}", other),
            }
            assert_eq!(probe.closes(), 2);
            assert!(manager.get_default().await.is_none());
            assert!(manager.get_by_id("a").await.is_none());
            assert!(matches!(
                manager.secure_conn("a").await,
                Err(Error::ManagerClosed)
            ));
            // a second shutdown has nothing left to close
            manager.shutdown().await.unwrap();
        });
    }

    struct Counting(AtomicUsize);

    #[async_trait]
    impl Migrator for Counting {
        async fn migrate(&self, _config: &DbConfig, info: &MigrationInfo) -> anyhow::Result<()> {
            if info.path == "broken" {
                anyhow::bail!("bad migration");
            }
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_migrate_forwards_to_registered_migrator() {
        smol::block_on(async {
            let probe = MemoryProbe::new();
            let migrator = Arc::new(Counting(AtomicUsize::new(0)));
            let mut registry = Registry::in_memory(&probe);
            registry.register_migrator(DatabaseKind::Postgres, migrator.clone());
            let manager = DatabaseManager::new(Arc::new(registry));

            let mut broken = db("broken", DatabaseKind::Postgres);
            broken.migration = Some(MigrationInfo {
                path: "broken".into(),
                ..Default::default()
            });
            let root = RootConfig::new(
                "stack",
                vec![
                    db("a", DatabaseKind::Postgres),
                    db("m", DatabaseKind::MySql),
                    broken,
                ],
            );
            manager.init_from_root(&root).await.unwrap();

            manager.migrate("a").await.unwrap();
            assert_eq!(migrator.0.load(Ordering::SeqCst), 1);
            assert!(matches!(
                manager.migrate("m").await,
                Err(Error::MigratorUnavailable(DatabaseKind::MySql))
            ));
            assert!(matches!(
                manager.migrate("broken").await,
                Err(Error::Migration { .. })
            ));
            assert!(matches!(
                manager.migrate("zzz").await,
                Err(Error::ConnectionNotFound(_))
            ));
        });
    }

    #[test]
    fn test_statuses() {
        smol::block_on(async {
            let probe = MemoryProbe::new();
            let manager = manager(&probe);
            let root = RootConfig::new(
                "stack",
                vec![db("a", DatabaseKind::Postgres), db("b", DatabaseKind::Redis)],
            );
            manager.init_from_root(&root).await.unwrap();
            let statuses = manager.statuses().await;
            assert_eq!(statuses.len(), 2);
            assert!(statuses[0].is_default);
            assert!(!statuses[1].is_default);
        });
    }
}
