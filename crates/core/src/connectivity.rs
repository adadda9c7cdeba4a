//! Connectivity source
//!
//! The offline queue needs the current state and a way to hear about
//! changes. A `watch` channel gives both.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

pub trait ConnectivityMonitor: Send + Sync {
    fn is_online(&self) -> bool;

    /// Receiver that observes every later change.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Connectivity flipped by hand (tests, or an OS callback in the host app).
#[derive(Debug, Clone)]
pub struct ManualConnectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl ManualConnectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn online() -> Self {
        Self::new(true)
    }

    pub fn offline() -> Self {
        Self::new(false)
    }

    pub fn set_online(&self, online: bool) {
        let previous = self.tx.send_replace(online);
        if previous != online {
            info!(online, "Connectivity changed");
        }
    }
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        Self::online()
    }
}

impl ConnectivityMonitor for ManualConnectivity {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
