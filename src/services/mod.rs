pub mod config;
pub mod credentials;
pub mod database;
pub mod deadline;
pub mod engine;
pub mod stack;
