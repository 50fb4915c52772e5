//! Database schema, models and typed broker queries

pub mod broker;
pub mod init;
pub mod models;

pub use init::*;
pub use models::*;
