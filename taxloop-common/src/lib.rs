//! taxloop-common - Shared Library
//!
//! Common functionality shared across the taxloop workspace:
//! - Error types (`Error`, `Result`)
//! - Configuration loading and resolution
//! - Database initialization and schema bootstrap
//! - Append-only run log with retention sweep

pub mod config;
pub mod db;
pub mod error;
pub mod runlog;

pub use error::{Error, Result};
