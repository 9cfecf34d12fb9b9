//! Database access shared by the services

pub mod facilities;
pub mod init;
pub mod regions;

pub use init::init_database;
