//! PostgreSQL driver.
//!
//! This module implements the `Driver` trait for PostgreSQL using SQLx's
//! PgPool.

use anyhow::Result;
use async_lock::RwLock;
use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use std::str::FromStr;

use crate::services::config::{DatabaseKind, DbConfig, SslMode};
use crate::services::database::drivers::options::PoolSettings;
use crate::services::database::traits::{BoxedDriver, Driver};

/// PostgreSQL driver wrapping an optional SQLx PgPool.
pub struct PostgresDriver {
    pool: RwLock<Option<PgPool>>,
}

impl std::fmt::Debug for PostgresDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDriver")
            .field("pool", &"<PgPool>")
            .finish()
    }
}

impl Default for PostgresDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl PostgresDriver {
    /// Create an unconnected driver. Call `connect()` to open the pool.
    pub fn new() -> Self {
        Self {
            pool: RwLock::new(None),
        }
    }

    /// Create a boxed driver (for registry use).
    pub fn boxed() -> BoxedDriver {
        Box::new(Self::new())
    }

    pub(crate) fn map_ssl_mode(mode: SslMode) -> PgSslMode {
        match mode {
            SslMode::Disable => PgSslMode::Disable,
            SslMode::Prefer => PgSslMode::Prefer,
            SslMode::Require => PgSslMode::Require,
            SslMode::VerifyCa => PgSslMode::VerifyCa,
            SslMode::VerifyFull => PgSslMode::VerifyFull,
        }
    }

    /// Build PgConnectOptions from the config. A DSN wins over discrete fields.
    pub(crate) fn build_connect_options(config: &DbConfig) -> Result<PgConnectOptions> {
        let mut options = match config.dsn() {
            Some(dsn) => PgConnectOptions::from_str(dsn)?,
            None => {
                let host = if config.host.is_empty() { "127.0.0.1" } else { &config.host };
                let mut options = PgConnectOptions::new()
                    .host(host)
                    .port(config.effective_port().unwrap_or(5432))
                    .username(&config.user)
                    .database(&config.db_name)
                    .ssl_mode(Self::map_ssl_mode(config.ssl_mode()));
                if !config.pass.is_empty() {
                    options = options.password(&config.pass);
                }
                options
            }
        };

        if let Some(name) = config.option("application_name") {
            options = options.application_name(name);
        }
        if let Some(cert) = config.option("sslcert") {
            options = options.ssl_client_cert(cert);
        }
        if let Some(key) = config.option("sslkey") {
            options = options.ssl_client_key(key);
        }
        if !config.schema.is_empty() && config.schema != "public" {
            options = options.options([("search_path", config.schema.as_str())]);
        }
        Ok(options)
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Postgres
    }

    async fn connect(&self, config: &DbConfig) -> Result<()> {
        let options = Self::build_connect_options(config)?;
        let settings = PoolSettings::from_config(config)?;

        let pool = settings
            .apply(PgPoolOptions::new())
            .connect_with(options)
            .await?;

        let previous = self.pool.write().await.replace(pool);
        if let Some(previous) = previous {
            previous.close().await;
        }
        Ok(())
    }

    async fn ping(&self) -> bool {
        let pool = self.pool.read().await.clone();
        match pool {
            Some(pool) => sqlx::query("SELECT 1").execute(&pool).await.is_ok(),
            None => false,
        }
    }

    async fn close(&self) -> Result<()> {
        let pool = self.pool.write().await.take();
        if let Some(pool) = pool {
            pool.close().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DbConfig {
        let mut db = DbConfig::new("a", DatabaseKind::Postgres);
        db.host = "db.internal".into();
        db.port = Some(5433);
        db.user = "kubexdb".into();
        db.pass = "secret".into();
        db.db_name = "app".into();
        db
    }

    #[test]
    fn test_map_ssl_mode() {
        assert!(matches!(
            PostgresDriver::map_ssl_mode(SslMode::Disable),
            PgSslMode::Disable
        ));
        assert!(matches!(
            PostgresDriver::map_ssl_mode(SslMode::VerifyFull),
            PgSslMode::VerifyFull
        ));
    }

    #[test]
    fn test_options_from_fields() {
        let options = PostgresDriver::build_connect_options(&config()).unwrap();
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 5433);
        assert_eq!(options.get_username(), "kubexdb");
        assert_eq!(options.get_database(), Some("app"));
    }

    #[test]
    fn test_dsn_wins() {
        let mut db = config();
        db.dsn = Some("postgres://other:pw@elsewhere:6000/otherdb".into());
        let options = PostgresDriver::build_connect_options(&db).unwrap();
        assert_eq!(options.get_host(), "elsewhere");
        assert_eq!(options.get_port(), 6000);
        assert_eq!(options.get_database(), Some("otherdb"));
    }

    #[test]
    fn test_ping_without_pool() {
        smol::block_on(async {
            let driver = PostgresDriver::new();
            assert!(!driver.ping().await);
            driver.close().await.unwrap();
        });
    }
}
