//! # Netguard Domain
//!
//! Shared vocabulary for the resilience layer.
//!
//! This crate contains:
//! - Request/response value types exchanged with the transport
//! - The call-path error taxonomy ([`NetError`]) and the infrastructure
//!   error type ([`NetguardError`])
//! - Durable queue records and status enums
//! - Configuration structures with documented defaults
//! - Notification payloads emitted by the runtime components
//!
//! ## Architecture
//! - No dependencies on other netguard crates
//! - Only external dependencies allowed
//! - Pure data structures and invariants, no I/O

pub mod config;
pub mod constants;
pub mod errors;
pub mod macros;
pub mod serde_utils;
pub mod types;

// Re-export commonly used items
pub use config::*;
pub use errors::*;
pub use types::*;
