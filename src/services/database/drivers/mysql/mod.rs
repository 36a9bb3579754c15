//! MySQL / MariaDB database driver implementation.

mod connection;

pub use connection::MySqlDriver;
