//! Circuit breaker states

use serde::{Deserialize, Serialize};

use crate::impl_wire_conversions;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Calls flow normally; failures are counted.
    #[default]
    Closed,
    /// Calls are rejected until the reset timeout elapses.
    Open,
    /// Limited probe calls are allowed to test recovery.
    HalfOpen,
}

impl_wire_conversions!(CircuitState {
    Closed => "closed",
    Open => "open",
    HalfOpen => "half-open",
});
