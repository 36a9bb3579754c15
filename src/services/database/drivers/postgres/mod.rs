//! PostgreSQL database driver implementation.
//!
//! Implements the `Driver` trait with SQLx. Honours `sslmode`,
//! `application_name`, `sslcert`/`sslkey` and the shared pool options.

mod connection;

pub use connection::PostgresDriver;
