//! # Netguard Infrastructure
//!
//! Infrastructure implementations of core ports.
//!
//! This crate contains:
//! - SQLite persistence for the durable offline queue
//! - The reqwest transport and an HTTP probe connectivity monitor
//! - Configuration loading (files plus environment)
//! - Logging setup, the event log bridge and the log-backed error reporter
//!
//! ## Architecture
//! - Implements traits defined in `netguard-core`
//! - Contains all "impure" code (disk, network, process-wide subscriber)

pub mod config;
pub mod database;
pub mod errors;
pub mod http;
pub mod observability;

// Re-export commonly used items
pub use database::{DbManager, SqliteOfflineStore};
pub use errors::InfraError;
pub use http::{HttpProbeConnectivity, ProbeConfig, ReqwestTransport};
pub use observability::{init_logging, spawn_event_logger, TracingErrorReporter};
