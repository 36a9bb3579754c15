//! Bootstrap and run a local database stack.
//!
//! A root config lists the databases a project needs. [`bootstrap`] makes
//! sure each one has a running container (through a [`ContainerEngine`]),
//! resolves its port and password, and hands the resulting configs to a
//! [`DatabaseManager`] that keeps one live connection per entry.

pub mod error;
pub mod logging;
pub mod runtime;
pub mod services;

pub use error::{Error, Result};
pub use runtime::{BootstrapOptions, Runtime, bootstrap};
pub use services::config::{DatabaseKind, DbConfig, RootConfig};
pub use services::credentials::CredentialStore;
pub use services::database::{DatabaseManager, Registry};
pub use services::engine::{ContainerEngine, DockerEngine, MemoryEngine};
pub use services::stack::StackProvider;
