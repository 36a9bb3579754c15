//! Declarative configuration types.
//!
//! - `DatabaseKind` - the closed set of database engines a config may name
//! - `DbConfig` - one database instance as written on disk
//! - `MigrationInfo` - knobs forwarded untouched to a registered migrator
//! - `RootConfig` - the persisted document holding every `DbConfig`

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

use crate::error::{Error, Result};

/// Supported database kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    #[default]
    #[serde(alias = "postgresql")]
    Postgres,
    #[serde(alias = "mariadb")]
    MySql,
    #[serde(alias = "sqlserver")]
    MsSql,
    Sqlite,
    Oracle,
    #[serde(alias = "mongo")]
    MongoDb,
    Redis,
    RabbitMq,
}

impl DatabaseKind {
    /// Get the display name for this kind
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Postgres => "PostgreSQL",
            Self::MySql => "MySQL",
            Self::MsSql => "SQL Server",
            Self::Sqlite => "SQLite",
            Self::Oracle => "Oracle",
            Self::MongoDb => "MongoDB",
            Self::Redis => "Redis",
            Self::RabbitMq => "RabbitMQ",
        }
    }

    /// Lowercase tag used in config files
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::MsSql => "mssql",
            Self::Sqlite => "sqlite",
            Self::Oracle => "oracle",
            Self::MongoDb => "mongodb",
            Self::Redis => "redis",
            Self::RabbitMq => "rabbitmq",
        }
    }

    /// Short tag used in container names (`kubexdb-pg`) and credential names
    pub fn short_name(&self) -> &'static str {
        match self {
            Self::Postgres => "pg",
            Self::MongoDb => "mongo",
            other => other.as_str(),
        }
    }

    /// Get the default port for server-based kinds
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Postgres => Some(5432),
            Self::MySql => Some(3306),
            Self::MsSql => Some(1433),
            Self::Sqlite => None,
            Self::Oracle => Some(1521),
            Self::MongoDb => Some(27017),
            Self::Redis => Some(6379),
            Self::RabbitMq => Some(5672),
        }
    }

    /// URL scheme for DSNs
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::MsSql => "sqlserver",
            Self::Sqlite => "sqlite",
            Self::Oracle => "oracle",
            Self::MongoDb => "mongodb",
            Self::Redis => "redis",
            Self::RabbitMq => "amqp",
        }
    }

    pub fn is_file_based(&self) -> bool {
        matches!(self, Self::Sqlite)
    }

    pub fn all() -> Vec<DatabaseKind> {
        vec![
            Self::Postgres,
            Self::MySql,
            Self::MsSql,
            Self::Sqlite,
            Self::Oracle,
            Self::MongoDb,
            Self::Redis,
            Self::RabbitMq,
        ]
    }
}

impl FromStr for DatabaseKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySql),
            "mssql" | "sqlserver" => Ok(Self::MsSql),
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            "oracle" => Ok(Self::Oracle),
            "mongodb" | "mongo" => Ok(Self::MongoDb),
            "redis" => Ok(Self::Redis),
            "rabbitmq" | "rabbit" => Ok(Self::RabbitMq),
            other => Err(format!("unknown database type '{}'", other)),
        }
    }
}

impl std::fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// SSL mode options, spelled the libpq way
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    /// Parse from a config string, falling back to `Prefer`
    pub fn from_db_str(s: &str) -> Self {
        match s {
            "disable" => Self::Disable,
            "prefer" => Self::Prefer,
            "require" => Self::Require,
            "verify-ca" => Self::VerifyCa,
            "verify-full" => Self::VerifyFull,
            _ => Self::Prefer,
        }
    }

    pub fn to_db_str(&self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Prefer => "prefer",
            Self::Require => "require",
            Self::VerifyCa => "verify-ca",
            Self::VerifyFull => "verify-full",
        }
    }
}

/// Migration knobs. Only forwarded to a registered migrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationInfo {
    pub path: String,
    pub enabled: bool,
    pub auto: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub bootstrap: bool,
    pub dry_run: bool,
    pub reset: bool,
    pub force: bool,
}

/// One database instance as declared in the root config.
///
/// Immutable once loaded; reconciliation produces new values through
/// [`DbConfig::resolved`] instead of writing back into this one.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct DbConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
    /// Tri-state: absent means enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(rename = "type")]
    pub kind: DatabaseKind,
    #[serde(default)]
    pub host: String,
    #[serde(
        default,
        deserialize_with = "deserialize_port_lax",
        skip_serializing_if = "Option::is_none"
    )]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default)]
    pub db_name: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsn: Option<String>,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration: Option<MigrationInfo>,
}

impl std::fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("is_default", &self.is_default)
            .field("enabled", &self.is_enabled())
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("pass", &if self.pass.is_empty() { "" } else { "<redacted>" })
            .field("db_name", &self.db_name)
            .field("tls", &self.tls)
            .finish()
    }
}

impl DbConfig {
    /// Create an enabled config with only the kind and id set.
    pub fn new(id: impl Into<String>, kind: DatabaseKind) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            is_default: false,
            enabled: None,
            kind,
            host: String::new(),
            port: None,
            user: String::new(),
            pass: String::new(),
            db_name: String::new(),
            schema: String::new(),
            dsn: None,
            tls: false,
            options: BTreeMap::new(),
            migration: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Configured port, or the kind's default.
    pub fn effective_port(&self) -> Option<u16> {
        self.port.or(self.kind.default_port())
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// `sslmode` option, or one derived from the TLS toggle.
    pub fn ssl_mode(&self) -> SslMode {
        match self.option("sslmode") {
            Some(mode) => SslMode::from_db_str(mode),
            None if self.tls => SslMode::Require,
            None => SslMode::Disable,
        }
    }

    /// The non-empty DSN, if one is set.
    pub fn dsn(&self) -> Option<&str> {
        self.dsn.as_deref().filter(|dsn| !dsn.trim().is_empty())
    }

    /// Name used in logs: the human name, else the id.
    pub fn label(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }

    /// A copy carrying the outputs of reconciliation. The receiver is untouched.
    pub fn resolved(&self, port: u16, pass: &str) -> DbConfig {
        let mut next = self.clone();
        next.port = Some(port);
        if next.pass.is_empty() {
            next.pass = pass.to_string();
        }
        if next.host.is_empty() {
            next.host = "127.0.0.1".to_string();
        }
        if self.dsn().is_some() && (self.port != Some(port) || self.pass.is_empty()) {
            next.dsn = next.build_dsn().ok();
        }
        next
    }

    /// Build `<scheme>://<user>:<pass>@<host>:<port>/<db>[?sslmode=..]`.
    pub fn build_dsn(&self) -> Result<String> {
        if self.kind.is_file_based() {
            return Ok(format!("sqlite://{}", self.db_name));
        }
        let host = if self.host.is_empty() { "127.0.0.1" } else { &self.host };
        let port = self.effective_port().unwrap_or_default();
        let base = format!("{}://{}:{}/{}", self.kind.scheme(), host, port, self.db_name);
        let mut url = Url::parse(&base).map_err(|e| Error::ValidationFailed {
            id: self.id.clone(),
            reason: format!("cannot build DSN: {}", e),
        })?;
        let bad_credentials = |_| Error::ValidationFailed {
            id: self.id.clone(),
            reason: "cannot encode credentials into DSN".to_string(),
        };
        if !self.user.is_empty() {
            url.set_username(&self.user).map_err(bad_credentials)?;
        }
        if !self.pass.is_empty() {
            url.set_password(Some(&self.pass)).map_err(bad_credentials)?;
        }
        if self.kind == DatabaseKind::Postgres {
            url.query_pairs_mut()
                .append_pair("sslmode", self.ssl_mode().to_db_str());
        }
        Ok(url.to_string())
    }
}

/// The persisted top-level document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub file_path: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub databases: Vec<DbConfig>,
}

impl RootConfig {
    pub fn new(name: impl Into<String>, databases: Vec<DbConfig>) -> Self {
        Self {
            name: name.into(),
            file_path: PathBuf::new(),
            enabled: true,
            databases,
        }
    }

    /// Entries taking part in reconciliation and bootstrap, in file order.
    pub fn enabled_databases(&self) -> impl Iterator<Item = &DbConfig> {
        self.databases.iter().filter(|db| db.is_enabled())
    }

    /// Checks that hold regardless of kind: at most one default entry,
    /// no duplicate ids.
    pub fn validate(&self) -> Result<()> {
        let defaults = self.databases.iter().filter(|db| db.is_default).count();
        if defaults > 1 {
            return Err(Error::config_parse(
                &self.file_path,
                format!("{} databases are marked is_default; at most one is allowed", defaults),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for db in self.databases.iter().filter(|db| !db.id.is_empty()) {
            if !seen.insert(db.id.as_str()) {
                return Err(Error::config_parse(
                    &self.file_path,
                    format!("duplicate database id '{}'", db.id),
                ));
            }
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

/// Ports show up as numbers or strings (`"5432"`, `""`) in hand-written files.
fn deserialize_port_lax<'de, D>(deserializer: D) -> std::result::Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Option::<Port>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Port::Number(port)) => Ok(Some(port)),
        Some(Port::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(Port::Text(text)) => text
            .trim()
            .parse::<u16>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
