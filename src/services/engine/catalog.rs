use async_lock::RwLock;
use std::collections::BTreeMap;

use super::ports::check_port_bindings;
use super::types::ContainerSpec;
use crate::error::Result;

/// Services registered with `add_service`, keyed by container name.
#[derive(Debug, Default)]
pub struct ServiceCatalog {
    services: RwLock<BTreeMap<String, ContainerSpec>>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering a name twice replaces the earlier spec.
    pub async fn register(&self, spec: ContainerSpec) -> Result<()> {
        check_port_bindings(&spec.ports)?;
        tracing::debug!(container = %spec.name, image = %spec.image, "service registered");
        self.services.write().await.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub async fn list(&self) -> Vec<ContainerSpec> {
        self.services.read().await.values().cloned().collect()
    }
}
