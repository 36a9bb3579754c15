use anyhow::Result;
use async_trait::async_trait;

use crate::services::config::{DbConfig, MigrationInfo};

/// Hook for schema migrations. No migrator ships with the crate; embedders
/// register their own per kind.
#[async_trait]
pub trait Migrator: Send + Sync {
    async fn migrate(&self, config: &DbConfig, info: &MigrationInfo) -> Result<()>;
}
