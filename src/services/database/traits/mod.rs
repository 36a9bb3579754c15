//! Database abstraction traits.
//!
//! - **Connection** (`connection`): the [`Driver`] every kind implements
//! - **Migrate** (`migrate`): the optional [`Migrator`] hook

pub mod connection;
pub mod migrate;

pub use connection::{BoxedDriver, Driver};
pub use migrate::Migrator;
