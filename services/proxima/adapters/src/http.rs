//! HTTP request/response client with optional long polling.

use crate::config::{
    default_long_poll_interval_ms, default_reconnect_interval_ms, default_retries, millis,
    DEFAULT_HTTP_TIMEOUT_MS, DEFAULT_REQUEST_TIMEOUT_MS,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use proxima_session::{
    AdapterError, Inbound, InboundStream, Pipeline, Result, RetryPolicy, Session, Transport,
    DEFAULT_CONNECT_TIMEOUT,
};
use proxima_wire::{parse_record_bytes, Record};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Protocol identifier
pub const PROTOCOL: &str = "http_client";

/// HTTP client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// Base URL relative endpoints are resolved against
    #[serde(default)]
    pub base_url: Option<String>,
    /// Headers sent with every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Per-request timeout, also used as the delay between attempts
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Attempts per request
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Endpoint polled while connected
    #[serde(default)]
    pub long_poll_endpoint: Option<String>,
    /// Delay between long-poll requests
    #[serde(default = "default_long_poll_interval_ms")]
    pub long_poll_interval_ms: u64,
    /// Delay between reconnect attempts
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            headers: BTreeMap::new(),
            timeout_ms: None,
            retries: default_retries(),
            long_poll_endpoint: None,
            long_poll_interval_ms: default_long_poll_interval_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
        }
    }
}

impl HttpClientConfig {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retries,
            millis(self.timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS)),
        )
    }
}

/// Resolve `endpoint` against an optional base URL
pub(crate) fn resolve_url(base: Option<&str>, endpoint: &str) -> Result<Url> {
    if let Ok(url) = Url::parse(endpoint) {
        return Ok(url);
    }
    let base = base.ok_or_else(|| {
        AdapterError::Config(format!("relative endpoint {} without base_url", endpoint))
    })?;
    Url::parse(base)
        .and_then(|base| base.join(endpoint))
        .map_err(|e| AdapterError::Config(format!("invalid endpoint {}: {}", endpoint, e)))
}

/// Build a header map from configured name/value pairs
pub(crate) fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| AdapterError::Config(format!("invalid header {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| AdapterError::Config(format!("invalid header value: {}", e)))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Build a reqwest client with default headers. Every request is bounded
/// by `timeout_ms`, or thirty seconds when unset.
pub(crate) fn build_client(
    headers: &BTreeMap<String, String>,
    timeout_ms: Option<u64>,
) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .default_headers(header_map(headers)?)
        .timeout(millis(timeout_ms.unwrap_or(DEFAULT_HTTP_TIMEOUT_MS)))
        .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
        .build()
        .map_err(|e| AdapterError::Config(format!("cannot build HTTP client: {}", e)))
}

/// Request transport behind [`HttpClient`]
pub struct HttpTransport {
    config: HttpClientConfig,
}

#[async_trait]
impl Transport for HttpTransport {
    type Link = reqwest::Client;

    fn name(&self) -> &'static str {
        PROTOCOL
    }

    fn reconnect_interval(&self) -> Duration {
        millis(self.config.reconnect_interval_ms)
    }

    async fn prepare(&self) -> Result<()> {
        header_map(&self.config.headers)?;
        if let Some(endpoint) = &self.config.long_poll_endpoint {
            resolve_url(self.config.base_url.as_deref(), endpoint)?;
        }
        Ok(())
    }

    async fn connect(&self) -> Result<(Self::Link, InboundStream)> {
        let client = build_client(&self.config.headers, self.config.timeout_ms)?;

        let inbound = match &self.config.long_poll_endpoint {
            Some(endpoint) => {
                let url = resolve_url(self.config.base_url.as_deref(), endpoint)?;
                debug!(protocol = PROTOCOL, "Long polling {}", url);
                long_poll(
                    client.clone(),
                    url,
                    millis(self.config.long_poll_interval_ms),
                )
            }
            None => futures::stream::pending().boxed(),
        };
        Ok((client, inbound))
    }

    async fn close(&self, _link: &Self::Link) {
        debug!(protocol = PROTOCOL, "Client released");
    }
}

async fn poll_once(client: &reqwest::Client, url: &Url) -> reqwest::Result<Option<Bytes>> {
    let body = client
        .get(url.clone())
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    Ok(Some(body))
}

/// GET `url` every `every`; poll failures are logged and polling continues
fn long_poll(client: reqwest::Client, url: Url, every: Duration) -> InboundStream {
    futures::stream::unfold(false, move |waited| {
        let client = client.clone();
        let url = url.clone();
        async move {
            let mut wait = waited;
            loop {
                if wait {
                    tokio::time::sleep(every).await;
                }
                wait = true;

                match poll_once(&client, &url).await {
                    Ok(Some(body)) => return Some((Ok(Inbound::message(body)), true)),
                    Ok(None) => debug!(protocol = PROTOCOL, "Empty long-poll response"),
                    Err(e) => warn!(protocol = PROTOCOL, "Long poll failed: {}", e),
                }
            }
        }
    })
    .boxed()
}

/// HTTP client adapter
pub struct HttpClient {
    session: Session<HttpTransport>,
}

impl HttpClient {
    /// Create a stopped client
    pub fn new(config: HttpClientConfig, pipeline: Pipeline) -> Self {
        Self {
            session: Session::new(HttpTransport { config }, pipeline),
        }
    }

    /// Configuration the client was built with
    pub fn config(&self) -> &HttpClientConfig {
        &self.session.transport().config
    }

    /// Execute a request with bounded retries.
    ///
    /// The JSON response runs through the pipeline and the transformed
    /// record is returned. Pipeline rejections are not retried.
    pub async fn execute_request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Record> {
        let client = self.session.link()?;
        let url = resolve_url(self.config().base_url.as_deref(), endpoint)?;

        self.config()
            .retry_policy()
            .run(PROTOCOL, |attempt| {
                let client = client.clone();
                let method = method.clone();
                let url = url.clone();
                async move {
                    debug!(protocol = PROTOCOL, "{} {} (attempt {})", method, url, attempt);
                    let mut request = client.request(method, url);
                    if let Some(body) = body {
                        request = request.json(body);
                    }
                    let response = request
                        .send()
                        .await
                        .and_then(|r| r.error_for_status())
                        .map_err(|e| AdapterError::Request(e.to_string()))?;
                    let bytes = response
                        .bytes()
                        .await
                        .map_err(|e| AdapterError::Request(e.to_string()))?;
                    let record = parse_record_bytes(&bytes)?;
                    self.session.process(record, None).await
                }
            })
            .await
    }
}

delegate_adapter!(HttpClient);
