//! In-memory fakes for the ports, used by this crate's tests and by
//! downstream integration tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use netguard_domain::{DurableEntry, NetError, NetEvent, NetRequest, NetResponse};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::ports::{ErrorReporter, Transport};

#[derive(Debug, Default)]
struct Script {
    outcomes: VecDeque<Result<NetResponse, NetError>>,
    requests: Vec<NetRequest>,
    delay: Option<Duration>,
}

/// Transport that replays queued outcomes in order.
///
/// Once the script runs out every call answers `200` with an empty body.
/// Clones share the script.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_dyn(self) -> Arc<dyn Transport> {
        Arc::new(self)
    }

    pub fn push_response(&self, response: NetResponse) {
        self.script.lock().outcomes.push_back(Ok(response));
    }

    /// Queue a failure classified from `status` (0 for a network error).
    pub fn push_status(&self, status: u16) {
        let error = NetError::from_status(status, format!("scripted status {status}"));
        self.script.lock().outcomes.push_back(Err(error));
    }

    pub fn push_error(&self, error: NetError) {
        self.script.lock().outcomes.push_back(Err(error));
    }

    /// Every send sleeps this long first.
    pub fn set_delay(&self, delay: Duration) {
        self.script.lock().delay = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<NetRequest> {
        self.script.lock().requests.clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: NetRequest) -> Result<NetResponse, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.script.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut script = self.script.lock();
        script.requests.push(request.clone());
        match script.outcomes.pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(error)) => Err(error.with_request(request)),
            None => Ok(NetResponse::new(200)),
        }
    }
}

/// Error reporter that keeps everything it was given.
#[derive(Debug, Clone, Default)]
pub struct RecordingErrorReporter {
    reports: Arc<Mutex<Vec<(NetError, DurableEntry)>>>,
}

impl RecordingErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<(NetError, DurableEntry)> {
        self.reports.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.reports.lock().len()
    }
}

impl ErrorReporter for RecordingErrorReporter {
    fn report(&self, error: &NetError, entry: &DurableEntry) {
        self.reports.lock().push((error.clone(), entry.clone()));
    }
}

/// Everything currently buffered on `rx`, without waiting.
pub fn drain_events(rx: &mut broadcast::Receiver<NetEvent>) -> Vec<NetEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}
