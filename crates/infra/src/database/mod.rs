//! SQLite persistence
//!
//! [`DbManager`] owns the connection pool and the schema;
//! [`SqliteOfflineStore`] implements the durable offline store on top of it.

pub mod manager;
pub mod offline_store;

pub use manager::{DbConnection, DbManager};
pub use offline_store::SqliteOfflineStore;
