//! Container engine adapter.
//!
//! The stack provider only ever talks to [`ContainerEngine`]. Two
//! implementations ship: [`DockerEngine`] for real hosts and
//! [`MemoryEngine`] for dry runs and tests.

mod catalog;
mod docker;
mod memory;
pub mod ports;
mod traits;
mod types;

pub use catalog::ServiceCatalog;
pub use docker::DockerEngine;
pub use memory::{EngineCall, MemoryEngine};
pub use ports::{check_port_bindings, map_ports};
pub use traits::{ContainerEngine, LogStream};
pub use types::{
    ContainerInfo, ContainerSpec, ContainerState, PortBinding, Protocol, StartOutcome,
    VolumeBinding, VolumeInfo,
};
