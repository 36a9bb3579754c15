//! SQLite driver.
//!
//! This module implements the `Driver` trait for SQLite using SQLx's
//! SqlitePool. The database file comes from the DSN or `db_name`.

use anyhow::{Result, anyhow};
use async_lock::RwLock;
use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::str::FromStr;

use crate::services::config::{DatabaseKind, DbConfig};
use crate::services::database::drivers::options::PoolSettings;
use crate::services::database::traits::{BoxedDriver, Driver};

const MEMORY: &str = ":memory:";

/// SQLite driver wrapping an optional SQLx SqlitePool.
pub struct SqliteDriver {
    pool: RwLock<Option<SqlitePool>>,
}

impl std::fmt::Debug for SqliteDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDriver")
            .field("pool", &"<SqlitePool>")
            .finish()
    }
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SqliteDriver {
    pub fn new() -> Self {
        Self {
            pool: RwLock::new(None),
        }
    }

    /// Create a boxed driver (for registry use).
    pub fn boxed() -> BoxedDriver {
        Box::new(Self::new())
    }

    pub(crate) fn build_connect_options(config: &DbConfig) -> Result<SqliteConnectOptions> {
        if let Some(dsn) = config.dsn() {
            return Ok(SqliteConnectOptions::from_str(dsn)?.foreign_keys(true));
        }

        let path = config.db_name.trim();
        if path.is_empty() {
            return Err(anyhow!("SQLite needs a database file path in db_name"));
        }
        if path == MEMORY {
            return Ok(SqliteConnectOptions::from_str(MEMORY)?
                .foreign_keys(true)
                .shared_cache(true));
        }

        // Enable WAL mode for better concurrency
        Ok(SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal))
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Sqlite
    }

    async fn connect(&self, config: &DbConfig) -> Result<()> {
        let options = Self::build_connect_options(config)?;
        let settings = PoolSettings::from_config(config)?;

        let pool = settings
            .apply(SqlitePoolOptions::new())
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
