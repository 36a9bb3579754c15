//! Crate-wide error type.
//!
//! Drivers speak `anyhow` internally; everything that crosses a component
//! boundary (config loader, stack provider, manager, runtime) is mapped into
//! [`Error`] so callers can branch on the failure kind.

use std::path::PathBuf;

use thiserror::Error as ThisError;

use crate::services::config::DatabaseKind;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("config file not found or not readable: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("config file {path} is invalid: {message}")]
    ConfigParse { path: PathBuf, message: String },

    #[error("database '{id}' failed validation: {reason}")]
    ValidationFailed { id: String, reason: String },

    #[error("no driver registered for {0}")]
    DriverUnavailable(DatabaseKind),

    #[error("no migrator registered for {0}")]
    MigratorUnavailable(DatabaseKind),

    #[error("migration of '{id}' failed: {reason}")]
    Migration { id: String, reason: String },

    #[error("credential store unavailable: {0}")]
    CredentialStoreUnavailable(String),

    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("`{command}` failed: {stderr}")]
    Engine { command: String, stderr: String },

    #[error("port conflict on {port}: {detail}")]
    PortConflict { port: u16, detail: String },

    #[error("invalid port '{0}'")]
    InvalidPort(String),

    #[error("container '{0}' not found")]
    ContainerNotFound(String),

    #[error("connect to '{id}' timed out after {secs}s")]
    ConnectTimeout { id: String, secs: u64 },

    #[error("connect to '{id}' failed: {reason}")]
    ConnectFailed { id: String, reason: String },

    #[error("no database connection could be established")]
    NoConnectionsAvailable,

    #[error("could not restore connection '{id}': {reason}")]
    ReconnectFailed { id: String, reason: String },

    #[error("health check failed for '{id}' ({kind})")]
    HealthCheckFailed { id: String, kind: DatabaseKind },

    #[error("no connection named '{0}'")]
    ConnectionNotFound(String),

    #[error("database manager has been shut down")]
    ManagerClosed,

    #[error("no configuration given and no config file path set")]
    NoConfigSource,

    #[error("root config '{0}' is disabled")]
    StackDisabled(String),

    #[error("shutdown finished with {} error(s): {}", .0.len(), .0.join("; "))]
    Shutdown(Vec<String>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config_parse<E>(path: impl Into<PathBuf>, err: E) -> Self
    where
        E: ToString,
    {
        Error::ConfigParse {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn engine<C, S>(command: C, stderr: S) -> Self
    where
        C: AsRef<str>,
        S: AsRef<str>,
    {
        Error::Engine {
            command: command.as_ref().to_string(),
            stderr: stderr.as_ref().trim().to_string(),
        }
    }

    /// Errors that abort a bootstrap outright. Everything else is either a
    /// per-entry skip or surfaced to the caller that asked.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::CredentialStoreUnavailable(_)
                | Error::EngineUnavailable(_)
                | Error::NoConnectionsAvailable
                | Error::NoConfigSource
        )
    }
}
