//! HTTP adapters: the reqwest transport and the probe-based connectivity
//! monitor.

pub mod connectivity;
pub mod transport;

pub use connectivity::{HttpProbeConnectivity, ProbeConfig};
pub use transport::{ReqwestTransport, ReqwestTransportBuilder};
