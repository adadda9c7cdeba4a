//! Observability: subscriber setup, the event log bridge and the
//! log-backed error reporter.

pub mod events;
pub mod logging;
pub mod reporter;

pub use events::{log_event, spawn_event_logger};
pub use logging::init_logging;
pub use reporter::{replay_payload, TracingErrorReporter};
