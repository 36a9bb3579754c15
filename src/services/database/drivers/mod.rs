//! Database driver implementations.
//!
//! - **PostgreSQL**, **MySQL**, **SQLite**: SQLx-backed pools
//! - **Memory**: an in-process stand-in for dry runs and tests
//!
//! The [`Registry`] maps each kind to its driver factory, validator and
//! optional migrator.

mod memory;
mod mysql;
pub mod options;
mod postgres;
mod registry;
mod sqlite;
pub mod validate;

pub use memory::{MemoryDriver, MemoryProbe};
pub use mysql::MySqlDriver;
pub use postgres::PostgresDriver;
pub use registry::{DriverFactory, Registry, Validator};
pub use sqlite::SqliteDriver;
