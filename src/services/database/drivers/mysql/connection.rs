//! MySQL driver.
//!
//! This module implements the `Driver` trait for MySQL and MariaDB using
//! SQLx's MySqlPool.

use anyhow::Result;
use async_lock::RwLock;
use async_trait::async_trait;
use sqlx::MySqlPool;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlSslMode};
use std::str::FromStr;

use crate::services::config::{DatabaseKind, DbConfig, SslMode};
use crate::services::database::drivers::options::PoolSettings;
use crate::services::database::traits::{BoxedDriver, Driver};

/// MySQL driver wrapping an optional SQLx MySqlPool.
pub struct MySqlDriver {
    pool: RwLock<Option<MySqlPool>>,
}

impl std::fmt::Debug for MySqlDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlDriver")
            .field("pool", &"<MySqlPool>")
            .finish()
    }
}

impl Default for MySqlDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MySqlDriver {
    pub fn new() -> Self {
        Self {
            pool: RwLock::new(None),
        }
    }

    /// Create a boxed driver (for registry use).
    pub fn boxed() -> BoxedDriver {
        Box::new(Self::new())
    }

    pub(crate) fn map_ssl_mode(mode: SslMode) -> MySqlSslMode {
        match mode {
            SslMode::Disable => MySqlSslMode::Disabled,
            SslMode::Prefer => MySqlSslMode::Preferred,
            SslMode::Require => MySqlSslMode::Required,
            SslMode::VerifyCa => MySqlSslMode::VerifyCa,
            SslMode::VerifyFull => MySqlSslMode::VerifyIdentity,
        }
    }

    pub(crate) fn build_connect_options(config: &DbConfig) -> Result<MySqlConnectOptions> {
        if let Some(dsn) = config.dsn() {
            return Ok(MySqlConnectOptions::from_str(dsn)?);
        }

        let host = if config.host.is_empty() { "127.0.0.1" } else { &config.host };
        let mut options = MySqlConnectOptions::new()
            .host(host)
            .port(config.effective_port().unwrap_or(3306))
            .username(&config.user)
            .database(&config.db_name)
            .ssl_mode(Self::map_ssl_mode(config.ssl_mode()));
        if !config.pass.is_empty() {
            options = options.password(&config.pass);
        }
        Ok(options)
    }
}

#[async_trait]
impl Driver for MySqlDriver {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::MySql
    }

    async fn connect(&self, config: &DbConfig) -> Result<()> {
        let options = Self::build_connect_options(config)?;
        let settings = PoolSettings::from_config(config)?;

        let pool = settings
            .apply(MySqlPoolOptions::new())
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
