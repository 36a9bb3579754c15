mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{container_registry, engine_options, fast_timeouts, server_db};
use kubexdb::services::config::{self, DatabaseKind, RootConfig};
use kubexdb::services::database::drivers::MemoryProbe;
use kubexdb::services::engine::{
    ContainerEngine, ContainerSpec, ContainerState, EngineCall, map_ports,
};
use kubexdb::services::stack::{Outcome, StackProvider};
use kubexdb::{
    BootstrapOptions, CredentialStore, DatabaseManager, Error, MemoryEngine, Registry, bootstrap,
};

const PG: &str = "kubexdb-pg";

#[test]
fn cold_start_synthesizes_config_and_container() {
    smol::block_on(async {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh").join("config.json");
        let engine = Arc::new(MemoryEngine::new());
        let (registry, _) = container_registry(&engine, &[DatabaseKind::Postgres]);

        let opts = engine_options(
            &engine,
            registry,
            CredentialStore::in_memory(),
            &dir.path().join("volumes"),
        )
        .with_file_path(&path);
        let runtime = bootstrap(None, opts).await.unwrap();

        let on_disk = config::load(&path).await.unwrap();
        assert_eq!(on_disk.databases.len(), 1);
        let db = &on_disk.databases[0];
        assert_eq!(db.kind, DatabaseKind::Postgres);
        assert_eq!(db.pass.len(), config::PASSWORD_LEN);
        assert!(db.is_default);

        assert_eq!(engine.calls().await, vec![EngineCall::Create(PG.to_string())]);
        assert_eq!(
            engine.container_state(PG).await.unwrap(),
            Some(ContainerState::Running)
        );
        assert_eq!(runtime.resolved()[0].outcome, Outcome::Created);

        let conn = runtime.manager().get_default().await.unwrap();
        assert_eq!(conn.id(), db.id);
        assert!(conn.driver().ping().await);
        drop(conn);

        runtime.shutdown().await.unwrap();
    });
}

#[test]
fn warm_start_reuses_running_container() {
    smol::block_on(async {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut a = server_db("a", DatabaseKind::Postgres);
        a.is_default = true;
        a.pass = "warm-secret".into();
        let mut b = server_db("b", DatabaseKind::Postgres);
        b.pass = "warm-secret".into();
        let mut root = RootConfig::new("warm", vec![b, a]);
        root.file_path = path.clone();
        config::save(&root).await.unwrap();

        // started by an earlier run on a non-default host port
        let engine = Arc::new(MemoryEngine::new());
        let mut existing = ContainerSpec::new(PG, "postgres:16-alpine");
        existing
            .env
            .insert("POSTGRES_PASSWORD".into(), "warm-secret".into());
        existing
            .ports
            .push(map_ports("127.0.0.1", "15432", "5432").unwrap());
        engine
            .insert_container(existing, ContainerState::Running)
            .await;
        let (registry, connects) = container_registry(&engine, &[DatabaseKind::Postgres]);

        let opts = engine_options(
            &engine,
            registry,
            CredentialStore::in_memory(),
            &dir.path().join("volumes"),
        )
        .with_file_path(&path);
        let runtime = bootstrap(None, opts).await.unwrap();

        assert!(engine.calls().await.is_empty());
        assert_eq!(runtime.manager().ids().await, vec!["b", "a"]);
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(runtime.manager().get_default().await.unwrap().id(), "a");
        assert!(
            runtime
                .resolved()
                .iter()
                .all(|r| r.outcome == Outcome::AlreadyRunning && r.port == Some(15432))
        );
        assert!(
            runtime
                .config()
                .databases
                .iter()
                .all(|db| db.port == Some(15432))
        );
    });
}

#[test]
fn second_reconcile_connects_to_the_probed_port() {
    smol::block_on(async {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        let credentials = CredentialStore::in_memory();
        let provider = StackProvider::new(engine.clone(), credentials)
            .with_volume_root(dir.path())
            .with_port_probe(|port| port != 5432);
        let root = RootConfig::new("restart", vec![server_db("pg", DatabaseKind::Postgres)]);

        let first = provider.reconcile(&root).await.unwrap();
        assert_eq!(first.get("pg").unwrap().outcome, Outcome::Created);
        assert_eq!(first.get("pg").unwrap().port, Some(5433));

        // next process start: 5432 is still busy, the container keeps 5433
        let second = provider.reconcile(&root).await.unwrap();
        let resolved = second.get("pg").unwrap();
        assert_eq!(resolved.outcome, Outcome::AlreadyRunning);
        assert_eq!(resolved.port, Some(5433));

        let effective = second.apply(&root);
        assert_eq!(effective.databases[0].port, Some(5433));

        let (registry, connects) = container_registry(&engine, &[DatabaseKind::Postgres]);
        let manager = DatabaseManager::with_timeouts(Arc::new(registry), fast_timeouts());
        manager.init_from_root(&effective).await.unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert!(manager.get_by_id("pg").await.unwrap().driver().ping().await);

        // the config as written would have missed the container
        let stale = RootConfig::new("stale", vec![{
            let mut db = effective.databases[0].clone();
            db.port = Some(5432);
            db
        }]);
        assert!(matches!(
            manager.init_from_root(&stale).await,
            Err(Error::NoConnectionsAvailable)
        ));
    });
}

#[test]
fn busy_port_is_probed_past() {
    smol::block_on(async {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        let provider = StackProvider::new(engine.clone(), CredentialStore::in_memory())
            .with_volume_root(dir.path())
            .with_port_probe(|port| port != 5432);

        let mut db = server_db("pg", DatabaseKind::Postgres);
        db.port = Some(5432);
        let root = RootConfig::new("ports", vec![db]);

        let report = provider.start_services(&root).await.unwrap();
        assert_eq!(report.get("pg").unwrap().port, Some(5433));
        assert_eq!(engine.spec_of(PG).await.unwrap().ports[0].host_port, 5433);

        let effective = report.apply(&root);
        assert_eq!(effective.databases[0].port, Some(5433));
        assert_eq!(root.databases[0].port, Some(5432));
    });
}

#[test]
fn stopped_container_fails_reconnect_until_restarted() {
    smol::block_on(async {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        let (registry, connects) = container_registry(&engine, &[DatabaseKind::Postgres]);
        let opts = engine_options(
            &engine,
            registry,
            CredentialStore::in_memory(),
            &dir.path().join("volumes"),
        )
        .with_file_path(dir.path().join("config.json"));
        let runtime = bootstrap(None, opts).await.unwrap();
        let id = runtime.manager().ids().await.remove(0);
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        engine.stop_container(PG).await.unwrap();
        assert!(matches!(
            runtime.conn(&id).await,
            Err(Error::ReconnectFailed { .. })
        ));
        assert_eq!(connects.load(Ordering::SeqCst), 2);

        let restarter = {
            let engine = engine.clone();
            smol::spawn(async move {
                smol::Timer::after(Duration::from_millis(100)).await;
                engine.start_container_by_name(PG).await.unwrap();
            })
        };
        let conn = runtime.conn(&id).await.unwrap();
        assert!(conn.is_connected());
        assert!(conn.driver().ping().await);
        drop(conn);
        restarter.await;
    });
}

#[test]
fn lookups_racing_shutdown_never_see_a_closed_driver() {
    smol::block_on(async {
        let probe = MemoryProbe::new();
        let root = RootConfig::new("race", vec![server_db("a", DatabaseKind::Postgres)]);
        let opts = BootstrapOptions::default()
            .with_registry(Registry::in_memory(&probe))
            .with_timeouts(fast_timeouts());
        let runtime = bootstrap(Some(root), opts).await.unwrap();
        let manager = runtime.manager().clone();

        let readers: Vec<_> = (0..8u64)
            .map(|i| {
                let manager = manager.clone();
                smol::spawn(async move {
                    smol::Timer::after(Duration::from_millis(i)).await;
                    match manager.get_by_id("a").await {
                        Some(conn) => {
                            assert!(conn.is_connected());
                            smol::Timer::after(Duration::from_millis(5)).await;
                            assert!(conn.driver().ping().await);
                            assert!(conn.is_connected());
                            true
                        }
                        None => false,
                    }
                })
            })
            .collect();
        let closer = {
            let manager = manager.clone();
            smol::spawn(async move {
                smol::Timer::after(Duration::from_millis(3)).await;
                manager.shutdown().await
            })
        };

        for reader in readers {
            reader.await;
        }
        closer.await.unwrap();

        assert!(manager.get_by_id("a").await.is_none());
        assert!(manager.get_default().await.is_none());
        assert_eq!(probe.closes(), 1);
    });
}

#[test]
fn disabled_entry_is_left_alone() {
    smol::block_on(async {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        let (registry, _) = container_registry(&engine, &[DatabaseKind::Postgres]);

        let pg = server_db("pg", DatabaseKind::Postgres);
        let mut mongo = server_db("mongo", DatabaseKind::MongoDb);
        mongo.enabled = Some(false);
        let root = RootConfig::new("mixed", vec![pg, mongo]);

        let opts = engine_options(
            &engine,
            registry,
            CredentialStore::in_memory(),
            &dir.path().join("volumes"),
        );
        let runtime = bootstrap(Some(root), opts).await.unwrap();

        assert_eq!(runtime.manager().ids().await, vec!["pg"]);
        assert_eq!(engine.calls().await, vec![EngineCall::Create(PG.to_string())]);
        assert_eq!(engine.container_state("kubexdb-mongo").await.unwrap(), None);
        assert!(runtime.resolved().iter().all(|r| r.id != "mongo"));
    });
}
