//! Kind-specific config validators.
//!
//! Validators are pure predicates run before any driver is built. They
//! return a human-readable reason on rejection.

use url::Url;

use super::options::PoolSettings;
use crate::services::config::{DatabaseKind, DbConfig};

/// Schemes accepted in a DSN for each kind.
fn accepted_schemes(kind: DatabaseKind) -> &'static [&'static str] {
    match kind {
        DatabaseKind::Postgres => &["postgres", "postgresql"],
        DatabaseKind::MySql => &["mysql", "mariadb"],
        DatabaseKind::MsSql => &["sqlserver", "mssql"],
        DatabaseKind::Sqlite => &["sqlite"],
        DatabaseKind::Oracle => &["oracle"],
        DatabaseKind::MongoDb => &["mongodb", "mongodb+srv"],
        DatabaseKind::Redis => &["redis", "rediss"],
        DatabaseKind::RabbitMq => &["amqp", "amqps"],
    }
}

/// Kinds whose server requires a login name.
fn requires_user(kind: DatabaseKind) -> bool {
    matches!(
        kind,
        DatabaseKind::Postgres | DatabaseKind::MySql | DatabaseKind::MsSql | DatabaseKind::Oracle
    )
}

/// Validator for server-based kinds.
pub fn validate_server(config: &DbConfig) -> Result<(), String> {
    validate_common(config)?;

    if let Some(dsn) = config.dsn() {
        return validate_dsn(config.kind, dsn);
    }
    if config.port == Some(0) {
        return Err("port must be between 1 and 65535".to_string());
    }
    if requires_user(config.kind) && config.user.trim().is_empty() {
        return Err(format!("{} requires a user", config.kind.display_name()));
    }
    if requires_user(config.kind) && config.db_name.trim().is_empty() {
        return Err(format!("{} requires a db_name", config.kind.display_name()));
    }
    Ok(())
}

/// Validator for file-based kinds.
pub fn validate_file(config: &DbConfig) -> Result<(), String> {
    validate_common(config)?;

    match config.dsn() {
        Some(dsn) => validate_dsn(config.kind, dsn),
        None if config.db_name.trim().is_empty() => {
            Err("db_name must hold the database file path".to_string())
        }
        None => Ok(()),
    }
}

fn validate_common(config: &DbConfig) -> Result<(), String> {
    if config.id.trim().is_empty() {
        return Err("id must not be empty".to_string());
    }
    PoolSettings::from_config(config)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

fn validate_dsn(kind: DatabaseKind, dsn: &str) -> Result<(), String> {
    let url = Url::parse(dsn).map_err(|e| format!("dsn is not a valid URL: {}", e))?;
    if accepted_schemes(kind).contains(&url.scheme()) {
        Ok(())
    } else {
        Err(format!(
            "dsn scheme '{}' does not match type {}",
            url.scheme(),
            kind.as_str()
        ))
    }
}

/// The validator registered by default for `kind`.
pub fn for_kind(kind: DatabaseKind) -> fn(&DbConfig) -> Result<(), String> {
    if kind.is_file_based() {
        validate_file
    } else {
        validate_server
    }
}
