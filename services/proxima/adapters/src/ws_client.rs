//! WebSocket client with a ping watchdog.
//!
//! The server is expected to ping at least every `ping_pong_interval_ms`.
//! Half a second of grace beyond that without any inbound frame counts as a
//! dead connection and triggers a reconnect.

use crate::config::{default_ping_pong_interval_ms, default_reconnect_interval_ms, millis};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use proxima_session::{
    connect_tcp, tls, AdapterError, Inbound, InboundStream, IoStream, Pipeline, Result, Session,
    SocketOptions, Transport, DEFAULT_CONNECT_TIMEOUT,
};
use proxima_wire::{Record, WireError};
use rustls::ClientConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;
use url::{Host, Url};

/// Protocol identifier
pub const PROTOCOL: &str = "ws_client";

const PING_GRACE: Duration = Duration::from_millis(500);

/// WebSocket client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsClientConfig {
    /// Server URL (`ws://` or `wss://`)
    pub url: String,
    /// Require TLS; needs a `wss://` URL and `certificate_path`
    #[serde(default)]
    pub secure: bool,
    /// PEM file with the CA certificates to trust
    #[serde(default)]
    pub certificate_path: Option<PathBuf>,
    /// Expected server ping interval
    #[serde(default = "default_ping_pong_interval_ms")]
    pub ping_pong_interval_ms: u64,
    /// Limit for TCP connect, TLS and upgrade handshakes together; defaults
    /// to ten seconds
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    /// Delay between reconnect attempts
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

impl WsClientConfig {
    /// Plain client with default timings
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            secure: false,
            certificate_path: None,
            ping_pong_interval_ms: default_ping_pong_interval_ms(),
            connect_timeout_ms: None,
            reconnect_interval_ms: default_reconnect_interval_ms(),
        }
    }
}

type WsStream = WebSocketStream<IoStream>;

/// Write half of an open WebSocket
pub struct ClientLink {
    sink: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
}

/// Connection transport behind [`WsClient`]
pub struct WsClientTransport {
    config: WsClientConfig,
    tls: Mutex<Option<Arc<ClientConfig>>>,
}

impl WsClientTransport {
    fn url(&self) -> Result<Url> {
        Url::parse(&self.config.url)
            .map_err(|e| AdapterError::Config(format!("invalid url {}: {}", self.config.url, e)))
    }
}

/// TLS server name for `url`; IPv6 literals lose their brackets
fn server_name(url: &Url) -> Result<String> {
    match url.host() {
        Some(Host::Domain(domain)) => Ok(domain.to_string()),
        Some(Host::Ipv4(addr)) => Ok(addr.to_string()),
        Some(Host::Ipv6(addr)) => Ok(addr.to_string()),
        None => Err(AdapterError::Config(format!("url {} has no host", url))),
    }
}

#[async_trait]
impl Transport for WsClientTransport {
    type Link = ClientLink;

    fn name(&self) -> &'static str {
        PROTOCOL
    }

    fn reconnect_interval(&self) -> Duration {
        millis(self.config.reconnect_interval_ms)
    }

    fn connect_timeout(&self) -> Duration {
        self.config
            .connect_timeout_ms
            .map(millis)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    async fn prepare(&self) -> Result<()> {
        let url = self.url()?;
        match (url.scheme(), self.config.secure) {
            ("ws", false) => {
                *self.tls.lock() = None;
                Ok(())
            }
            ("wss", true) => {
                let ca = self.config.certificate_path.as_ref().ok_or_else(|| {
                    AdapterError::Config(
                        "secure WebSocket client requires certificate_path".into(),
                    )
                })?;
                let config = tls::client_config(ca).await?;
                *self.tls.lock() = Some(config);
                Ok(())
            }
            ("wss", false) => Err(AdapterError::Config(
                "wss url requires secure: true and certificate_path".into(),
            )),
            (scheme, true) => Err(AdapterError::Config(format!(
                "secure WebSocket url must start with wss, got {}",
                scheme
            ))),
            (scheme, false) => Err(AdapterError::Config(format!(
                "unsupported WebSocket scheme {}",
                scheme
            ))),
        }
    }

    async fn connect(&self) -> Result<(Self::Link, InboundStream)> {
        let url = self.url()?;
        let host = url
            .host_str()
            .ok_or_else(|| AdapterError::Config(format!("url {} has no host", url)))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| AdapterError::Config(format!("url {} has no port", url)))?;

        debug!(protocol = PROTOCOL, "Connecting to {}", url);
        let options = SocketOptions::default();
        let tcp = connect_tcp(host, port, self.connect_timeout(), options).await?;
        let tls_config = self.tls.lock().clone();
        let stream = match tls_config {
            Some(config) => tls::connect_tls(config, tcp, &server_name(&url)?).await?,
            None => IoStream::Plain(tcp),
        };

        let (ws, _response) = tokio_tungstenite::client_async(url.as_str(), stream)
            .await
            .map_err(|e| AdapterError::Connection(format!("handshake failed: {}", e)))?;
        let (sink, source) = ws.split();

        let silence = millis(self.config.ping_pong_interval_ms) + PING_GRACE;
        let link = ClientLink {
            sink: tokio::sync::Mutex::new(sink),
        };
        Ok((link, watch_frames(source, silence)))
    }

    async fn close(&self, link: &Self::Link) {
        let closing = async { link.sink.lock().await.close().await };
        match tokio::time::timeout(self.connect_timeout(), closing).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(protocol = PROTOCOL, "Close failed: {}", e),
            Err(_) => debug!(protocol = PROTOCOL, "Close timed out"),
        }
    }
}

/// Map WebSocket frames to inbound messages, failing after `silence`
/// without any frame
fn watch_frames(source: SplitStream<WsStream>, silence: Duration) -> InboundStream {
    futures::stream::unfold(Some(source), move |source| async move {
        let mut source = source?;
        loop {
            let frame = match tokio::time::timeout(silence, source.next()).await {
                Ok(frame) => frame,
                Err(_) => {
                    let error = AdapterError::Connection(format!("no ping within {:?}", silence));
                    return Some((Err(error), None));
                }
            };

            match frame {
                Some(Ok(Message::Text(text))) => {
                    return Some((Ok(Inbound::message(text)), Some(source)));
                }
                Some(Ok(Message::Binary(data))) => {
                    return Some((Ok(Inbound::message(data)), Some(source)));
                }
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    let error = AdapterError::Connection(e.to_string());
                    return Some((Err(error), None));
                }
            }
        }
    })
    .boxed()
}

/// WebSocket client adapter
pub struct WsClient {
    session: Session<WsClientTransport>,
}

impl WsClient {
    /// Create a stopped client
    pub fn new(config: WsClientConfig, pipeline: Pipeline) -> Self {
        let transport = WsClientTransport {
            config,
            tls: Mutex::new(None),
        };
        Self {
            session: Session::new(transport, pipeline),
        }
    }

    /// Configuration the client was built with
    pub fn config(&self) -> &WsClientConfig {
        &self.session.transport().config
    }

    /// Send a record as one text frame
    pub async fn send(&self, record: &Record) -> Result<()> {
        let link = self.session.link()?;
        let text = serde_json::to_string(record).map_err(WireError::from)?;

        let sent = link.sink.lock().await.send(Message::Text(text)).await;
        if let Err(e) = sent {
            let error = AdapterError::Connection(format!("send failed: {}", e));
            self.session.report_failure(&error);
            return Err(error);
        }
        Ok(())
    }
}

delegate_adapter!(WsClient);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{collecting_pipeline, next_record, record, silent_listener, wait_for};
    use crate::ws_server::{WsServer, WsServerConfig};
    use proxima_session::{ConnectionState, ProtocolAdapter};
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn local_server(pipeline: Pipeline) -> (WsServer, String) {
        let config = WsServerConfig {
            host: "127.0.0.1".into(),
            ..WsServerConfig::on_port(0)
        };
        let server = WsServer::new(config, pipeline);
        server.start().await.unwrap();
        let url = format!("ws://{}", server.local_addr().unwrap());
        (server, url)
    }

    #[tokio::test]
    async fn test_round_trip_with_server() {
        let (server_pipeline, mut server_rx) = collecting_pipeline();
        let (server, url) = local_server(server_pipeline).await;
        let (client_pipeline, mut client_rx) = collecting_pipeline();
        let client = WsClient::new(WsClientConfig::for_url(url), client_pipeline);

        client.start().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);

        client.send(&record(json!({"from": "client"}))).await.unwrap();
        assert_eq!(
            next_record(&mut server_rx).await,
            record(json!({"from": "client"}))
        );

        wait_for(|| server.clients().map(|c| c.len()).unwrap_or(0) == 1).await;
        server.broadcast(&record(json!({"from": "server"}))).unwrap();
        assert_eq!(
            next_record(&mut client_rx).await,
            record(json!({"from": "server"}))
        );
        assert_eq!(
            client.received_parsed_message(),
            record(json!({"from": "server"}))
        );

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let client = WsClient::new(
            WsClientConfig::for_url("ws://127.0.0.1:1"),
            Pipeline::new(),
        );
        let err = client.send(&record(json!({}))).await.unwrap_err();
        assert!(matches!(err, AdapterError::NotConnected { protocol: PROTOCOL }));
    }

    #[tokio::test]
    async fn test_silent_server_triggers_reconnect() {
        let (server, url) = local_server(Pipeline::new()).await;
        let config = WsClientConfig {
            ping_pong_interval_ms: 100,
            reconnect_interval_ms: 60_000,
            ..WsClientConfig::for_url(url)
        };
        let client = WsClient::new(config, Pipeline::new());

        // The server pings every five seconds, far beyond the client's watchdog
        client.start().await.unwrap();
        wait_for(|| client.state() == ConnectionState::Reconnecting).await;

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_tls_settings_validated() {
        let secure_without_ca = WsClientConfig {
            secure: true,
            ..WsClientConfig::for_url("wss://localhost:8443")
        };
        let client = WsClient::new(secure_without_ca, Pipeline::new());
        assert!(matches!(client.start().await, Err(AdapterError::Config(_))));

        let secure_plain_url = WsClientConfig {
            secure: true,
            certificate_path: Some("/nonexistent/ca.pem".into()),
            ..WsClientConfig::for_url("ws://localhost:8080")
        };
        let client = WsClient::new(secure_plain_url, Pipeline::new());
        assert!(matches!(client.start().await, Err(AdapterError::Config(_))));

        let wss_not_secure = WsClientConfig::for_url("wss://localhost:8443");
        let client = WsClient::new(wss_not_secure, Pipeline::new());
        assert!(matches!(client.start().await, Err(AdapterError::Config(_))));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_silent_server_bounds_start() {
        let silent = silent_listener().await;
        let config = WsClientConfig {
            connect_timeout_ms: Some(200),
            reconnect_interval_ms: 60_000,
            ..WsClientConfig::for_url(format!("ws://{}", silent.addr))
        };
        let client = WsClient::new(config, Pipeline::new());

        tokio::time::timeout(Duration::from_secs(5), client.start())
            .await
            .expect("start blocked on a silent server")
            .unwrap();
        assert_eq!(client.state(), ConnectionState::Reconnecting);
        assert!(silent.accepted() >= 1);

        client.stop().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_server_name_strips_ipv6_brackets() {
        let url = Url::parse("wss://[::1]:8443/feed").unwrap();
        assert_eq!(server_name(&url).unwrap(), "::1");
        assert!(rustls::pki_types::ServerName::try_from(server_name(&url).unwrap()).is_ok());

        let url = Url::parse("wss://feeds.example.com/live").unwrap();
        assert_eq!(server_name(&url).unwrap(), "feeds.example.com");
    }

    #[tokio::test]
    async fn test_unreachable_server_schedules_retry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = WsClient::new(
            WsClientConfig::for_url(format!("ws://127.0.0.1:{}", port)),
            Pipeline::new(),
        );
        client.start().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Reconnecting);
        client.stop().await;
    }
}
