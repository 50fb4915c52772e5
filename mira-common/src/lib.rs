//! # MIRA Common Library
//!
//! Shared code for the MIRA archive services:
//! - Database schema, models and typed broker queries
//! - Instance document handling
//! - Configuration loading
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod instance;

pub use error::{Error, Result};
pub use instance::InstanceDocument;
