//! Per-kind container profiles: image, ports, mount points, environment.

use rand::Rng;
use rand::distr::Alphanumeric;
use std::collections::BTreeMap;

use crate::services::config::{DatabaseKind, DbConfig, env};

/// How one kind runs under the container engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Profile {
    pub image: &'static str,
    pub container_port: u16,
    /// Where the image picks up init scripts, if it does
    pub init_path: Option<&'static str>,
    pub data_path: &'static str,
}

/// `None` for kinds that never run in a container.
pub fn profile(kind: DatabaseKind) -> Option<Profile> {
    let profile = match kind {
        DatabaseKind::Postgres => Profile {
            image: "postgres:17-alpine",
            container_port: 5432,
            init_path: Some("/docker-entrypoint-initdb.d"),
            data_path: "/var/lib/postgresql/data",
        },
        DatabaseKind::MySql => Profile {
            image: "mysql:8.4",
            container_port: 3306,
            init_path: Some("/docker-entrypoint-initdb.d"),
            data_path: "/var/lib/mysql",
        },
        DatabaseKind::MsSql => Profile {
            image: "mcr.microsoft.com/mssql/server:2022-latest",
            container_port: 1433,
            init_path: None,
            data_path: "/var/opt/mssql",
        },
        DatabaseKind::Oracle => Profile {
            image: "gvenzl/oracle-free:latest",
            container_port: 1521,
            init_path: Some("/container-entrypoint-initdb.d"),
            data_path: "/opt/oracle/oradata",
        },
        DatabaseKind::MongoDb => Profile {
            image: "mongo:7",
            container_port: 27017,
            init_path: Some("/docker-entrypoint-initdb.d"),
            data_path: "/data/db",
        },
        DatabaseKind::Redis => Profile {
            image: "redis/redis-stack-server:latest",
            container_port: 6379,
            init_path: None,
            data_path: "/data",
        },
        DatabaseKind::RabbitMq => Profile {
            image: "rabbitmq:3-management",
            container_port: 5672,
            init_path: None,
            data_path: "/var/lib/rabbitmq",
        },
        DatabaseKind::Sqlite => return None,
    };
    Some(profile)
}

/// `kubexdb-<short-kind>`, the only handle used to find existing containers.
pub fn container_name(kind: DatabaseKind) -> String {
    format!("{}-{}", env::APP_NAME, kind.short_name())
}

/// `kubexdb-<short-kind>-<6 random chars>` for entries without a name.
pub fn generated_name(kind: DatabaseKind) -> String {
    let suffix: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("{}-{}", container_name(kind), suffix.to_lowercase())
}

/// Image for `db`: the `image` option, else the profile default.
pub fn image_for(db: &DbConfig, profile: &Profile) -> String {
    db.option("image").unwrap_or(profile.image).to_string()
}

/// Admin credentials and database the container is initialised with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials<'a> {
    pub user: &'a str,
    pub password: &'a str,
    pub db_name: &'a str,
}

/// Environment understood by each kind's image.
pub fn environment(
    db: &DbConfig,
    profile: &Profile,
    credentials: &Credentials<'_>,
) -> BTreeMap<String, String> {
    let Credentials {
        user,
        password,
        db_name,
    } = *credentials;
    let port = profile.container_port.to_string();

    let pairs: Vec<(&str, String)> = match db.kind {
        DatabaseKind::Postgres => vec![
            ("POSTGRES_USER", user.to_string()),
            ("POSTGRES_PASSWORD", password.to_string()),
            ("POSTGRES_DB", db_name.to_string()),
            ("PGPORT", port),
            ("PGDATA", format!("{}/pgdata", profile.data_path)),
            ("PGSSLMODE", db.ssl_mode().to_db_str().to_string()),
        ],
        DatabaseKind::MySql => {
            let mut pairs = vec![
                ("MYSQL_ROOT_PASSWORD", password.to_string()),
                ("MYSQL_DATABASE", db_name.to_string()),
                ("MYSQL_TCP_PORT", port),
            ];
            // the image refuses MYSQL_USER=root
            if user != "root" {
                pairs.push(("MYSQL_USER", user.to_string()));
                pairs.push(("MYSQL_PASSWORD", password.to_string()));
            }
            pairs
        }
        DatabaseKind::MsSql => vec![
            ("ACCEPT_EULA", "Y".to_string()),
            ("MSSQL_PID", "Developer".to_string()),
            ("MSSQL_SA_PASSWORD", password.to_string()),
            ("MSSQL_TCP_PORT", port),
        ],
        DatabaseKind::Oracle => vec![
            ("ORACLE_PASSWORD", password.to_string()),
            ("APP_USER", user.to_string()),
            ("APP_USER_PASSWORD", password.to_string()),
            ("ORACLE_DATABASE", db_name.to_string()),
        ],
        DatabaseKind::MongoDb => vec![
            ("MONGO_INITDB_ROOT_USERNAME", user.to_string()),
            ("MONGO_INITDB_ROOT_PASSWORD", password.to_string()),
            ("MONGO_INITDB_DATABASE", db_name.to_string()),
        ],
        DatabaseKind::Redis => vec![("REDIS_ARGS", format!("--requirepass {}", password))],
        DatabaseKind::RabbitMq => vec![
            ("RABBITMQ_DEFAULT_USER", user.to_string()),
            ("RABBITMQ_DEFAULT_PASS", password.to_string()),
            ("RABBITMQ_DEFAULT_VHOST", db_name.to_string()),
        ],
        DatabaseKind::Sqlite => Vec::new(),
    };

    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}
