//! Live database connections.
//!
//! - `traits`: the [`Driver`] and [`Migrator`] seams
//! - `drivers`: SQLx drivers, validators and the [`Registry`]
//! - `connection`: one config paired with its driver
//! - `manager`: the [`DatabaseManager`] owning every connection

mod connection;
pub mod drivers;
mod manager;
pub mod traits;

pub use connection::{ConnectionState, ConnectionStatus, DbConnection};
pub use drivers::{MemoryProbe, Registry};
pub use manager::{ConnectionRef, DatabaseManager};
pub use traits::{BoxedDriver, Driver, Migrator};
