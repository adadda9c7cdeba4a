use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use netguard_common::resilience::parse_retry_after;
use netguard_core::Transport;
use netguard_domain::constants::HEADER_RETRY_AFTER;
use netguard_domain::{
    ErrorKind, HttpMethod, NetError, NetRequest, NetResponse, NetguardError, TransportSettings,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client as ReqwestClient, Method};
use tracing::debug;
use url::Url;

use crate::errors::InfraError;

/// Longest response body excerpt copied into an error message.
const ERROR_BODY_EXCERPT: usize = 256;

/// [`Transport`] over a shared reqwest client.
///
/// Statuses of 400 and above come back as `Err`, classified by status, with
/// the response headers and any `Retry-After` hint attached. Connection
/// failures use status 0; client-side timeouts map to
/// [`ErrorKind::Timeout`].
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: ReqwestClient,
    timeout: Duration,
}

impl ReqwestTransport {
    /// Start building a new transport.
    pub fn builder() -> ReqwestTransportBuilder {
        ReqwestTransportBuilder::default()
    }

    /// Convenience constructor with default configuration.
    pub fn new() -> Result<Self, NetguardError> {
        Self::builder().build()
    }

    pub fn from_settings(settings: &TransportSettings) -> Result<Self, NetguardError> {
        Self::builder().timeout(settings.timeout()).user_agent(settings.user_agent.clone()).build()
    }

    fn prepare(&self, request: &NetRequest) -> Result<reqwest::RequestBuilder, NetError> {
        let url = Url::parse(&request.url).map_err(|err| {
            NetError::new(ErrorKind::Client, 0, format!("invalid url '{}': {err}", request.url))
        })?;

        let mut headers = HeaderMap::with_capacity(request.headers.len());
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
                NetError::new(ErrorKind::Client, 0, format!("invalid header name '{name}': {err}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|err| {
                NetError::new(ErrorKind::Client, 0, format!("invalid value for header '{name}': {err}"))
            })?;
            headers.insert(name, value);
        }

        let mut builder = self.client.request(to_reqwest_method(request.method), url).headers(headers);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        Ok(builder)
    }

    fn map_send_error(&self, err: &reqwest::Error) -> NetError {
        if err.is_timeout() {
            NetError::timeout(self.timeout)
        } else {
            NetError::transport(err.to_string())
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: NetRequest) -> Result<NetResponse, NetError> {
        let builder = self.prepare(&request)?;
        let method = request.method;
        let url = request.url.as_str();
        let started = Instant::now();
        debug!(%method, %url, "sending HTTP request");

        let response = builder.send().await.map_err(|err| {
            debug!(%method, %url, error = %err, "HTTP request failed");
            self.map_send_error(&err)
        })?;

        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response.bytes().await.map_err(|err| self.map_send_error(&err))?.to_vec();
        debug!(
            %method,
            %url,
            status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "received HTTP response"
        );

        if status < 400 {
            return Ok(NetResponse { status, headers, body });
        }

        let reason = reqwest::StatusCode::from_u16(status)
            .ok()
            .and_then(|code| code.canonical_reason())
            .unwrap_or("unknown status");
        let message = if body.is_empty() {
            format!("HTTP {status} {reason}")
        } else {
            format!("HTTP {status} {reason}: {}", excerpt(&String::from_utf8_lossy(&body)))
        };

        let retry_after = headers
            .get(HEADER_RETRY_AFTER)
            .and_then(|value| parse_retry_after(value, SystemTime::now()));
        let mut error = NetError::from_status(status, message).with_headers(headers);
        if let Some(delay) = retry_after {
            error = error.with_retry_after(delay);
        }
        Err(error)
    }
}

/// Builder for [`ReqwestTransport`].
#[derive(Debug)]
pub struct ReqwestTransportBuilder {
    timeout: Duration,
    user_agent: Option<String>,
    default_headers: Option<HeaderMap>,
}

impl Default for ReqwestTransportBuilder {
    fn default() -> Self {
        Self { timeout: TransportSettings::default().timeout(), user_agent: None, default_headers: None }
    }
}

impl ReqwestTransportBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    pub fn default_headers(mut self, headers: HeaderMap) -> Self {
        self.default_headers = Some(headers);
        self
    }

    pub fn build(self) -> Result<ReqwestTransport, NetguardError> {
        let mut builder = ReqwestClient::builder().timeout(self.timeout).no_proxy();

        if let Some(agent) = self.user_agent {
            builder = builder.user_agent(agent);
        }

        if let Some(headers) = self.default_headers {
            builder = builder.default_headers(headers);
        }

        let client = builder.build().map_err(|err| NetguardError::from(InfraError::from(err)))?;

        Ok(ReqwestTransport { client, timeout: self.timeout })
    }
}

fn to_reqwest_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Head => Method::HEAD,
        HttpMethod::Options => Method::OPTIONS,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

/// Header names from reqwest are already lowercase; non-UTF-8 values are
/// dropped.
fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn excerpt(body: &str) -> &str {
    if body.len() <= ERROR_BODY_EXCERPT {
        return body;
    }
    let mut end = ERROR_BODY_EXCERPT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
