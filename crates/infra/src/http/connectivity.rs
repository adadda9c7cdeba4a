//! Connectivity monitor backed by a periodic HTTP probe
//!
//! Any HTTP response counts as online; only connection failures and timeouts
//! count as offline. Clones share the published state but not the background
//! task, so one clone can be handed to the client while the owner drives
//! `start`/`stop`.

use std::sync::Arc;
use std::time::Duration;

use netguard_core::ConnectivityMonitor;
use netguard_domain::NetguardError;
use reqwest::Client as ReqwestClient;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::errors::InfraError;

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub url: Url,
    pub interval: Duration,
    pub timeout: Duration,
    /// State reported before the first probe completes.
    pub assume_online: bool,
    pub join_timeout: Duration,
}

impl ProbeConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(5),
            assume_online: true,
            join_timeout: Duration::from_secs(5),
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn assume_online(mut self, online: bool) -> Self {
        self.assume_online = online;
        self
    }
}

#[derive(Debug)]
pub struct HttpProbeConnectivity {
    client: ReqwestClient,
    config: ProbeConfig,
    tx: Arc<watch::Sender<bool>>,
    cancellation: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
}

impl Clone for HttpProbeConnectivity {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            config: self.config.clone(),
            tx: Arc::clone(&self.tx),
            cancellation: CancellationToken::new(),
            task_handle: None,
        }
    }
}

impl HttpProbeConnectivity {
    pub fn new(config: ProbeConfig) -> Result<Self, NetguardError> {
        let client = ReqwestClient::builder()
            .timeout(config.timeout)
            .no_proxy()
            .build()
            .map_err(|err| NetguardError::from(InfraError::from(err)))?;
        let (tx, _rx) = watch::channel(config.assume_online);
        Ok(Self {
            client,
            config,
            tx: Arc::new(tx),
            cancellation: CancellationToken::new(),
            task_handle: None,
        })
    }

    /// Probe once and publish the result.
    pub async fn probe_now(&self) -> bool {
        let online = probe(&self.client, &self.config.url).await;
        publish(&self.tx, online);
        online
    }

    #[instrument(skip(self), fields(url = %self.config.url))]
    pub fn start(&mut self) -> Result<(), NetguardError> {
        if self.is_running() {
            return Err(NetguardError::Internal("connectivity probe already running".into()));
        }

        info!("Starting connectivity probe");
        self.cancellation = CancellationToken::new();

        let client = self.client.clone();
        let url = self.config.url.clone();
        let interval = self.config.interval;
        let tx = Arc::clone(&self.tx);
        let cancel = self.cancellation.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("connectivity probe cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let online = probe(&client, &url).await;
                        publish(&tx, online);
                    }
                }
            }
        });

        self.task_handle = Some(handle);
        Ok(())
    }

    #[instrument(skip(self), fields(url = %self.config.url))]
    pub async fn stop(&mut self) -> Result<(), NetguardError> {
        let Some(handle) = self.task_handle.take() else {
            return Err(NetguardError::Internal("connectivity probe not running".into()));
        };

        info!("Stopping connectivity probe");
        self.cancellation.cancel();

        match tokio::time::timeout(self.config.join_timeout, handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!("Connectivity probe task panicked: {}", e);
                Err(NetguardError::Internal("connectivity probe task panicked".into()))
            }
            Err(_) => {
                warn!("Connectivity probe did not stop within timeout");
                Err(NetguardError::Internal("connectivity probe stop timed out".into()))
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task_handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for HttpProbeConnectivity {
    fn drop(&mut self) {
        if self.task_handle.is_some() {
            self.cancellation.cancel();
        }
    }
}

impl ConnectivityMonitor for HttpProbeConnectivity {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

async fn probe(client: &ReqwestClient, url: &Url) -> bool {
    match client.head(url.clone()).send().await {
        Ok(response) => {
            debug!(status = response.status().as_u16(), "connectivity probe answered");
            true
        }
        Err(err) => {
            debug!(error = %err, "connectivity probe failed");
            false
        }
    }
}

fn publish(tx: &watch::Sender<bool>, online: bool) {
    let previous = tx.send_replace(online);
    if previous != online {
        info!(online, "Connectivity changed");
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn dead_url() -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        Url::parse(&format!("http://{addr}/health")).unwrap()
    }

    #[tokio::test]
    async fn any_response_counts_as_online() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD")).respond_with(ResponseTemplate::new(503)).mount(&server).await;

        let config = ProbeConfig::new(Url::parse(&server.uri()).unwrap()).assume_online(false);
        let monitor = HttpProbeConnectivity::new(config).expect("monitor");
        assert!(!monitor.is_online());

        assert!(monitor.probe_now().await);
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn refused_connection_counts_as_offline() {
        let monitor = HttpProbeConnectivity::new(ProbeConfig::new(dead_url())).expect("monitor");
        let mut rx = monitor.subscribe();

        assert!(!monitor.probe_now().await);
        rx.changed().await.expect("change published");
        assert!(!*rx.borrow());
    }

    /// Validates `HttpProbeConnectivity::start` behavior for the background
    /// probing scenario.
    ///
    /// Assertions:
    /// - Confirms the first tick probes immediately and publishes the state.
    /// - Ensures a second start is rejected and stop joins the task.
    #[tokio::test]
    async fn background_probe_lifecycle() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD")).respond_with(ResponseTemplate::new(204)).mount(&server).await;

        let config = ProbeConfig::new(Url::parse(&server.uri()).unwrap())
            .assume_online(false)
            .interval(Duration::from_millis(20));
        let mut monitor = HttpProbeConnectivity::new(config).expect("monitor");
        let shared = monitor.clone();
        let mut rx = shared.subscribe();

        monitor.start().expect("start");
        assert!(monitor.start().is_err());
        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .expect("probe within timeout")
            .expect("sender alive");
        assert!(shared.is_online());

        monitor.stop().await.expect("stop");
        assert!(!monitor.is_running());
        assert!(monitor.stop().await.is_err());
    }
}
