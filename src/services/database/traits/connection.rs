//! Core driver trait.
//!
//! A driver owns at most one live pool for one `DbConfig`. All methods take
//! `&self`; the pool sits behind an interior lock so a driver can be shared
//! by readers while a reconnect swaps the pool underneath.

use anyhow::Result;
use async_trait::async_trait;

use crate::services::config::{DatabaseKind, DbConfig};

/// Kind-specific connect/ping/close.
///
/// `connect` is cancelled by dropping its future; a dropped connect must
/// leave no half-open pool behind.
///
/// # Example
///
/// ```ignore
/// let driver = registry.driver(DatabaseKind::Postgres)?;
/// driver.connect(&config).await?;
/// assert!(driver.ping().await);
/// driver.close().await?;
/// ```
#[async_trait]
pub trait Driver: Send + Sync {
    fn kind(&self) -> DatabaseKind;

    /// Open a pool for `config`, replacing any previous one.
    async fn connect(&self, config: &DbConfig) -> Result<()>;

    /// Round-trip a trivial statement. `false` when not connected.
    async fn ping(&self) -> bool;

    /// Close the pool. Closing an unconnected driver is a no-op.
    async fn close(&self) -> Result<()>;
}

/// A boxed driver trait object.
pub type BoxedDriver = Box<dyn Driver>;
