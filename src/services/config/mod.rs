//! Root configuration: types, defaults and the file loader.

pub mod env;
pub mod loader;
mod types;

pub use loader::{PASSWORD_LEN, default_root, generate_password, load, load_or_bootstrap, save};
pub use types::{DatabaseKind, DbConfig, MigrationInfo, RootConfig, SslMode};
