//! Database initialization and schema bootstrap

pub mod init;
pub mod schema;

pub use init::init_database;
