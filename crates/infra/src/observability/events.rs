//! Event bus to log bridge

use netguard_core::EventBus;
use netguard_domain::NetEvent;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Log every notification published on `bus` until the last sender is gone.
pub fn spawn_event_logger(bus: &EventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event logger lagged behind the bus");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("event logger stopped");
    })
}

pub fn log_event(event: &NetEvent) {
    let name = event.name();
    match event {
        NetEvent::CircuitOpened { service, failures, retry_after_ms } => {
            warn!(event = name, %service, failures, retry_after_ms, "circuit opened");
        }
        NetEvent::CircuitHalfOpened { service } | NetEvent::CircuitClosed { service } => {
            info!(event = name, %service, "circuit state changed");
        }
        NetEvent::RetryAttempted { trace_id, url, attempt, delay_ms, status } => {
            debug!(event = name, %trace_id, %url, attempt, delay_ms, status, "retrying request");
        }
        NetEvent::SlowCall { trace_id, url, elapsed_ms, threshold_ms } => {
            warn!(event = name, %trace_id, %url, elapsed_ms, threshold_ms, "slow call");
        }
        NetEvent::EntryEnqueued { id, url, priority } => {
            debug!(event = name, entry_id = %id, %url, %priority, "request queued offline");
        }
        NetEvent::EntryProcessing { id, attempt } => {
            debug!(event = name, entry_id = %id, attempt, "replaying offline entry");
        }
        NetEvent::EntryCompleted { id, status } => {
            info!(event = name, entry_id = %id, status, "offline entry delivered");
        }
        NetEvent::EntryRetryScheduled { id, retry_count, next_attempt_at } => {
            info!(event = name, entry_id = %id, retry_count, next_attempt_at, "offline entry rescheduled");
        }
        NetEvent::EntryFailed { id, status, error: reason } => {
            error!(event = name, entry_id = %id, status, error = %reason, "offline entry failed");
        }
        NetEvent::EntryExpired { id } => {
            warn!(event = name, entry_id = %id, "offline entry expired");
        }
    }
}
