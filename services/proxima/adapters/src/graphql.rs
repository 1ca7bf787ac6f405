//! GraphQL-over-HTTP client.
//!
//! Connecting checks the endpoint with a `__typename` query. Each query's
//! `data` object runs through the pipeline; a response carrying `errors`
//! fails the call.

use crate::config::{
    default_reconnect_interval_ms, default_retries, millis, DEFAULT_REQUEST_TIMEOUT_MS,
};
use crate::http::{build_client, resolve_url};
use async_trait::async_trait;
use futures::StreamExt;
use proxima_session::{
    AdapterError, InboundStream, Pipeline, Result, RetryPolicy, Session, Transport,
    DEFAULT_CONNECT_TIMEOUT,
};
use proxima_wire::{Record, WireError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Protocol identifier
pub const PROTOCOL: &str = "graphql_client";

const TYPENAME_QUERY: &str = "{ __typename }";

/// GraphQL client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQlClientConfig {
    /// GraphQL endpoint URL
    pub endpoint: String,
    /// Headers sent with every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Per-request timeout, also used as the delay between attempts
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Attempts per query
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Query run by [`GraphQlClient::execute_configured_query`]
    #[serde(default)]
    pub query: Option<String>,
    /// Variables for the configured query
    #[serde(default)]
    pub variables: Option<Record>,
    /// Delay between reconnect attempts
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

impl GraphQlClientConfig {
    /// Client for `endpoint` with default settings
    pub fn for_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            headers: BTreeMap::new(),
            timeout_ms: None,
            retries: default_retries(),
            query: None,
            variables: None,
            reconnect_interval_ms: default_reconnect_interval_ms(),
        }
    }
}

/// Open GraphQL endpoint
pub struct GraphQlLink {
    client: reqwest::Client,
    endpoint: Url,
}

/// Request transport behind [`GraphQlClient`]
pub struct GraphQlTransport {
    config: GraphQlClientConfig,
}

#[async_trait]
impl Transport for GraphQlTransport {
    type Link = GraphQlLink;

    fn name(&self) -> &'static str {
        PROTOCOL
    }

    fn reconnect_interval(&self) -> Duration {
        millis(self.config.reconnect_interval_ms)
    }

    fn connect_timeout(&self) -> Duration {
        self.config
            .timeout_ms
            .map(millis)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    async fn prepare(&self) -> Result<()> {
        resolve_url(None, &self.config.endpoint)?;
        build_client(&self.config.headers, self.config.timeout_ms)?;
        Ok(())
    }

    async fn connect(&self) -> Result<(Self::Link, InboundStream)> {
        let link = GraphQlLink {
            client: build_client(&self.config.headers, self.config.timeout_ms)?,
            endpoint: resolve_url(None, &self.config.endpoint)?,
        };

        post_query(&link, TYPENAME_QUERY, None)
            .await
            .map_err(|e| AdapterError::Connection(format!("endpoint check failed: {}", e)))?;
        info!(protocol = PROTOCOL, "Endpoint {} reachable", link.endpoint);

        Ok((link, futures::stream::pending().boxed()))
    }

    async fn close(&self, _link: &Self::Link) {
        debug!(protocol = PROTOCOL, "Client released");
    }
}

/// POST one query and return its `data` object
async fn post_query(link: &GraphQlLink, query: &str, variables: Option<&Record>) -> Result<Record> {
    let body = json!({
        "query": query,
        "variables": variables.cloned().unwrap_or_default(),
    });

    let response: Value = link
        .client
        .post(link.endpoint.clone())
        .json(&body)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| AdapterError::Request(e.to_string()))?
        .json()
        .await
        .map_err(|e| AdapterError::Request(format!("invalid response body: {}", e)))?;

    if let Some(errors) = response.get("errors").filter(|e| !e.is_null()) {
        return Err(AdapterError::Request(format!("GraphQL errors: {}", errors)));
    }

    match response.get("data") {
        Some(Value::Object(data)) => Ok(data.clone()),
        Some(other) => Err(AdapterError::Parse(WireError::NotAnObject(type_name(other)))),
        None => Err(AdapterError::Request("response has no data".into())),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// GraphQL client adapter
pub struct GraphQlClient {
    session: Session<GraphQlTransport>,
}

impl GraphQlClient {
    /// Create a stopped client
    pub fn new(config: GraphQlClientConfig, pipeline: Pipeline) -> Self {
        Self {
            session: Session::new(GraphQlTransport { config }, pipeline),
        }
    }

    /// Configuration the client was built with
    pub fn config(&self) -> &GraphQlClientConfig {
        &self.session.transport().config
    }

    /// Run `query` with bounded retries and return the transformed `data`
    pub async fn execute_query(&self, query: &str, variables: Option<&Record>) -> Result<Record> {
        let link = self.session.link()?;
        let policy = RetryPolicy::new(
            self.config().retries,
            millis(self.config().timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS)),
        );

        policy
            .run(PROTOCOL, |attempt| {
                let link = link.clone();
                async move {
                    debug!(protocol = PROTOCOL, "Query attempt {}", attempt);
                    let data = post_query(&link, query, variables).await?;
                    self.session.process(data, None).await
                }
            })
            .await
    }

    /// Run the query and variables from the configuration
    pub async fn execute_configured_query(&self) -> Result<Record> {
        let query = self
            .config()
            .query
            .as_deref()
            .ok_or_else(|| AdapterError::Config("no query configured".into()))?;
        self.execute_query(query, self.config().variables.as_ref())
            .await
    }
}

delegate_adapter!(GraphQlClient);
