use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;

use kubexdb::services::config::{self, RootConfig, env};
use kubexdb::services::database::drivers::MemoryProbe;
use kubexdb::services::engine::{ContainerSpec, StartOutcome, VolumeBinding, map_ports};
use kubexdb::services::stack::{StackProvider, container_name, profile};
use kubexdb::{
    BootstrapOptions, ContainerEngine, CredentialStore, DockerEngine, MemoryEngine, Registry,
    bootstrap, logging,
};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "kubexdb", version, about = "Local database stack manager", long_about = None)]
struct Cli {
    /// Root config file (defaults to $KUBEXDB_CONFIGFILE or ~/.kubex/kubexdb/config.json)
    #[arg(long, global = true)]
    config_file: Option<PathBuf>,

    /// Load environment variables from this file before anything else
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage the configured databases
    Database {
        #[command(subcommand)]
        command: DatabaseCommand,
    },
    /// Talk to the container engine directly
    Docker {
        #[command(subcommand)]
        command: DockerCommand,
    },
    /// Print the effective root config
    Config,
    Version,
}

#[derive(Debug, Args, Clone, Copy, Default)]
struct RunFlags {
    /// Use an in-process engine, keyring and drivers
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum DatabaseCommand {
    /// Start a container for every enabled database
    Start {
        #[command(flatten)]
        run: RunFlags,
    },
    /// Stop the containers of every enabled database
    Stop {
        #[command(flatten)]
        run: RunFlags,
    },
    /// Connect to every enabled database and report its state
    Status {
        #[command(flatten)]
        run: RunFlags,
    },
    /// Run migrations on every connected database
    Migrate {
        /// Keep connections open and health-checked after migrating
        #[arg(long)]
        keep_alive: bool,
        /// Keep going when one database fails to migrate
        #[arg(long)]
        force: bool,
        /// Ask migrators to reset before applying
        #[arg(long)]
        reset: bool,
        #[command(flatten)]
        run: RunFlags,
    },
}

#[derive(Debug, Subcommand)]
enum DockerCommand {
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
    Status { name: String },
    Logs {
        name: String,
        #[arg(long, short)]
        follow: bool,
    },
    List,
    ListVolumes,
    CreateVolume {
        name: String,
        /// Bind the volume to this host directory
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Register a container; only started with `--start`
    Add {
        name: String,
        #[arg(long)]
        image: String,
        /// `HOST:CONTAINER[/proto]`, repeatable
        #[arg(long = "port", short = 'p')]
        ports: Vec<String>,
        /// `KEY=VALUE`, repeatable
        #[arg(long = "env", short = 'e')]
        env: Vec<String>,
        /// `SOURCE:TARGET`, repeatable
        #[arg(long = "volume", short = 'v')]
        volumes: Vec<String>,
        /// Also create and start the container
        #[arg(long)]
        start: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    match &cli.env_file {
        Some(path) => {
            if let Err(e) = dotenvy::from_path(path) {
                eprintln!("error: cannot load {}: {}", path.display(), e);
                std::process::exit(1);
            }
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }
    logging::init_tracing(cli.debug);

    if !env::banner_hidden() && !matches!(cli.command, Commands::Version) {
        eprintln!("{} {}", env::APP_NAME, env!("CARGO_PKG_VERSION"));
    }

    if let Err(e) = smol::block_on(run(cli)) {
        tracing::error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = match &cli.config_file {
        Some(path) => path.clone(),
        None => env::default_config_path()?,
    };

    match cli.command {
        Commands::Database { command } => database(command, &config_path).await,
        Commands::Docker { command } => docker(command).await,
        Commands::Config => show_config(&config_path).await,
        Commands::Version => {
            println!("{} {}", env::APP_NAME, env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Engine, credentials and registry for one invocation.
struct Stack {
    engine: Arc<dyn ContainerEngine>,
    credentials: CredentialStore,
    registry: Registry,
    volume_root: Option<PathBuf>,
}

impl Stack {
    fn new(flags: RunFlags) -> anyhow::Result<Self> {
        if flags.dry_run {
            tracing::info!("dry run: no containers, keyring entries or connections are touched");
            return Ok(Self {
                engine: Arc::new(MemoryEngine::new()),
                credentials: CredentialStore::in_memory(),
                registry: Registry::in_memory(&MemoryProbe::new()),
                volume_root: Some(std::env::temp_dir().join("kubexdb-dry-run")),
            });
        }
        Ok(Self {
            engine: Arc::new(DockerEngine::new()),
            credentials: CredentialStore::system()?,
            registry: Registry::with_defaults(),
            volume_root: None,
        })
    }

    fn provider(&self) -> StackProvider {
        let provider = StackProvider::new(self.engine.clone(), self.credentials.clone());
        match &self.volume_root {
            Some(root) => provider.with_volume_root(root),
            None => provider,
        }
    }

    fn options(self, config_path: &Path) -> anyhow::Result<BootstrapOptions> {
        let mut opts = BootstrapOptions::from_env()?
            .with_file_path(config_path)
            .with_registry(self.registry)
            .with_engine(self.engine)
            .with_credentials(self.credentials);
        if let Some(root) = self.volume_root {
            opts = opts.with_volume_root(root);
        }
        Ok(opts)
    }
}

async fn database(command: DatabaseCommand, config_path: &Path) -> anyhow::Result<()> {
    match command {
        DatabaseCommand::Start { run } => {
            let root = config::load_or_bootstrap(config_path).await?;
            let report = Stack::new(run)?.provider().start_services(&root).await?;
            for resolved in &report.resolved {
                println!(
                    "{:<24} {:<10} {:<20} {:<6} {:?}",
                    resolved.id,
                    resolved.kind,
                    resolved.container.as_deref().unwrap_or("-"),
                    resolved.port.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                    resolved.outcome,
                );
            }
            Ok(())
        }
        DatabaseCommand::Stop { run } => {
            let root = config::load_or_bootstrap(config_path).await?;
            let stack = Stack::new(run)?;
            stack.engine.initialize().await?;
            let containers: BTreeSet<String> = root
                .enabled_databases()
                .filter(|db| profile(db.kind).is_some())
                .map(|db| container_name(db.kind))
                .collect();
            for name in containers {
                stack.engine.stop_container(&name).await?;
                println!("stopped {}", name);
            }
            Ok(())
        }
        DatabaseCommand::Status { run } => {
            let runtime = bootstrap(None, Stack::new(run)?.options(config_path)?).await?;
            for status in runtime.manager().statuses().await {
                println!("{}", serde_json::to_string(&status)?);
            }
            let health = runtime.health_check().await;
            runtime.shutdown().await?;
            health?;
            Ok(())
        }
        DatabaseCommand::Migrate {
            keep_alive,
            force,
            reset,
            run,
        } => {
            let mut root = config::load_or_bootstrap(config_path).await?;
            for db in &mut root.databases {
                let info = db.migration.get_or_insert_with(Default::default);
                info.force |= force;
                info.reset |= reset;
                info.dry_run |= run.dry_run;
            }

            let runtime = bootstrap(Some(root), Stack::new(run)?.options(config_path)?).await?;
            let mut failed = 0;
            for id in runtime.manager().ids().await {
                match runtime.manager().migrate(&id).await {
                    Ok(()) => println!("migrated {}", id),
                    Err(e) if force => {
                        tracing::warn!(id = %id, error = %e, "migration failed, continuing");
                        failed += 1;
                    }
                    Err(e) => {
                        runtime.shutdown().await.ok();
                        return Err(e.into());
                    }
                }
            }

            if keep_alive {
                tracing::info!("keeping connections alive");
                loop {
                    smol::Timer::after(KEEP_ALIVE_INTERVAL).await;
                    if let Err(e) = runtime.health_check().await {
                        tracing::warn!(error = %e, "health check failed");
                    }
                }
            }

            runtime.shutdown().await?;
            if failed > 0 {
                bail!("{} database(s) failed to migrate", failed);
            }
            Ok(())
        }
    }
}

async fn docker(command: DockerCommand) -> anyhow::Result<()> {
    let engine = DockerEngine::new();
    engine.initialize().await?;

    match command {
        DockerCommand::Start { name } => engine.start_container_by_name(&name).await?,
        DockerCommand::Stop { name } => engine.stop_container(&name).await?,
        DockerCommand::Restart { name } => engine.restart_container(&name).await?,
        DockerCommand::Status { name } => match engine.container_state(&name).await? {
            Some(state) => println!("{} {}", name, state),
            None => println!("{} absent", name),
        },
        DockerCommand::Logs { name, follow } => {
            let mut lines = engine.get_container_logs(&name, follow).await?;
            while let Some(line) = lines.next().await {
                println!("{}", line?);
            }
        }
        DockerCommand::List => {
            for info in engine.list_containers().await? {
                let ports: Vec<String> = info
                    .ports
                    .iter()
                    .map(|p| format!("{}->{}/{}", p.host_port, p.container_port, p.protocol.as_str()))
                    .collect();
                println!(
                    "{:<14} {:<28} {:<32} {:<20} {}",
                    info.id,
                    info.name,
                    info.image,
                    info.status,
                    ports.join(",")
                );
            }
        }
        DockerCommand::ListVolumes => {
            for volume in engine.list_volumes().await? {
                println!("{:<40} {}", volume.name, volume.mountpoint);
            }
        }
        DockerCommand::CreateVolume { name, path } => {
            engine.create_volume(&name, path.as_deref()).await?;
            println!("created volume {}", name);
        }
        DockerCommand::Add {
            name,
            image,
            ports,
            env,
            volumes,
            start,
        } => {
            let spec = service_spec(&engine.host_ip(), name, image, &ports, &env, &volumes)?;
            match add_service(&engine, spec.clone(), start).await? {
                Some(outcome) => println!("{} {:?}", spec.name, outcome),
                None => println!("{} registered", spec.name),
            }
        }
    }
    Ok(())
}

/// Record `spec` with the engine, starting it only when asked to.
async fn add_service(
    engine: &dyn ContainerEngine,
    spec: ContainerSpec,
    start: bool,
) -> kubexdb::Result<Option<StartOutcome>> {
    engine.add_service(spec.clone()).await?;
    if !start {
        return Ok(None);
    }
    engine.start_container(&spec).await.map(Some)
}

fn service_spec(
    host_ip: &str,
    name: String,
    image: String,
    ports: &[String],
    env: &[String],
    volumes: &[String],
) -> anyhow::Result<ContainerSpec> {
    let mut spec = ContainerSpec::new(name, image);
    for port in ports {
        let (host, container) = port
            .split_once(':')
            .with_context(|| format!("port '{}' is not HOST:CONTAINER", port))?;
        spec.ports.push(map_ports(host_ip, host, container)?);
    }
    for pair in env {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("env '{}' is not KEY=VALUE", pair))?;
        spec.env.insert(key.to_string(), value.to_string());
    }
    for volume in volumes {
        let (source, target) = volume
            .split_once(':')
            .with_context(|| format!("volume '{}' is not SOURCE:TARGET", volume))?;
        spec.volumes.push(VolumeBinding::new(source, target));
    }
    Ok(spec)
}

async fn show_config(config_path: &Path) -> anyhow::Result<()> {
    let mut root: RootConfig = config::load_or_bootstrap(config_path).await?;
    for db in &mut root.databases {
        if !db.pass.is_empty() {
            db.pass = "<redacted>".to_string();
        }
    }
    println!("{}", serde_json::to_string_pretty(&root)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubexdb::services::engine::Protocol;

    #[test]
    fn test_cli_parses_migrate_flags() {
        let cli = Cli::parse_from([
            "kubexdb",
            "--debug",
            "database",
            "migrate",
            "--keep-alive",
            "--force",
            "--dry-run",
        ]);
        assert!(cli.debug);
        match cli.command {
            Commands::Database {
                command:
                    DatabaseCommand::Migrate {
                        keep_alive,
                        force,
                        reset,
                        run,
                    },
            } => {
                assert!(keep_alive && force && run.dry_run);
                assert!(!reset);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_service_spec() {
        let spec = service_spec(
            "127.0.0.1",
            "cache".into(),
            "redis:7".into(),
            &["6380:6379/tcp".into()],
            &["REDIS_ARGS=--save 60 1".into()],
            &["/tmp/cache:/data".into()],
        )
        .unwrap();
        assert_eq!(spec.ports[0].host_port, 6380);
        assert_eq!(spec.ports[0].container_port, 6379);
        assert_eq!(spec.ports[0].protocol, Protocol::Tcp);
        assert_eq!(spec.env["REDIS_ARGS"], "--save 60 1");
        assert_eq!(spec.volumes[0].target, "/data");

        assert!(service_spec("127.0.0.1", "x".into(), "y".into(), &["6379".into()], &[], &[]).is_err());
    }

    #[test]
    fn test_add_registers_without_starting() {
        let cli = Cli::parse_from(["kubexdb", "docker", "add", "cache", "--image", "redis:7"]);
        match cli.command {
            Commands::Docker {
                command: DockerCommand::Add { start, .. },
            } => assert!(!start),
            other => panic!("unexpected command {:?}", other),
        }

        smol::block_on(async {
            let engine = MemoryEngine::new();
            let spec = ContainerSpec::new("cache", "redis:7");

            assert_eq!(add_service(&engine, spec.clone(), false).await.unwrap(), None);
            assert_eq!(engine.services().await, vec![spec.clone()]);
            assert!(engine.calls().await.is_empty());
            assert_eq!(engine.container_state("cache").await.unwrap(), None);

            assert_eq!(
                add_service(&engine, spec, true).await.unwrap(),
                Some(StartOutcome::Created)
            );
        });
    }
}
