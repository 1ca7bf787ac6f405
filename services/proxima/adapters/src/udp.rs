//! Datagram socket client speaking line-delimited JSON.
//!
//! Datagrams are fed through the same frame reassembler as the TCP stream,
//! so a record may span several datagrams.

use crate::config::{default_reconnect_interval_ms, millis};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use proxima_session::{
    AdapterError, Inbound, InboundStream, Pipeline, Result, Session, Transport,
};
use proxima_wire::{encode_record, Record};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info};

/// Protocol identifier
pub const PROTOCOL: &str = "udp_client";

const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// UDP client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpClientConfig {
    /// Local bind address
    pub host: String,
    /// Local bind port (0 picks an ephemeral port)
    pub port: u16,
    /// Destination host for outgoing records
    pub remote_host: String,
    /// Destination port for outgoing records
    pub remote_port: u16,
    /// Delay between rebind attempts
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

/// Socket transport behind [`UdpClient`]
pub struct UdpTransport {
    config: UdpClientConfig,
}

#[async_trait]
impl Transport for UdpTransport {
    type Link = Arc<UdpSocket>;

    fn name(&self) -> &'static str {
        PROTOCOL
    }

    fn reconnect_interval(&self) -> Duration {
        millis(self.config.reconnect_interval_ms)
    }

    async fn connect(&self) -> Result<(Self::Link, InboundStream)> {
        let bind = (self.config.host.as_str(), self.config.port);
        let socket = UdpSocket::bind(bind).await.map_err(|e| {
            AdapterError::Connection(format!(
                "bind {}:{}: {}",
                self.config.host, self.config.port, e
            ))
        })?;
        let socket = Arc::new(socket);
        info!(protocol = PROTOCOL, "Bound to {}", socket.local_addr()?);
        Ok((socket.clone(), receive_datagrams(socket)))
    }

    async fn close(&self, _link: &Self::Link) {
        // Socket is released with its last handle
        debug!(protocol = PROTOCOL, "Socket closed");
    }
}

fn receive_datagrams(socket: Arc<UdpSocket>) -> InboundStream {
    futures::stream::unfold(Some(socket), |socket| async move {
        let socket = socket?;
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                debug!(protocol = PROTOCOL, "Datagram of {} bytes from {}", len, from);
                buf.truncate(len);
                Some((Ok(Inbound::Chunk(Bytes::from(buf))), Some(socket)))
            }
            Err(e) => Some((Err(AdapterError::Io(e)), None)),
        }
    })
    .boxed()
}

/// Line-delimited JSON client over UDP
pub struct UdpClient {
    session: Session<UdpTransport>,
}

impl UdpClient {
    /// Create a stopped client
    pub fn new(config: UdpClientConfig, pipeline: Pipeline) -> Self {
        Self {
            session: Session::new(UdpTransport { config }, pipeline),
        }
    }

    /// Configuration the client was built with
    pub fn config(&self) -> &UdpClientConfig {
        &self.session.transport().config
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.session.link()?.local_addr()?)
    }

    /// Send one record to the configured remote address
    pub async fn send_message(&self, record: &Record) -> Result<()> {
        let socket = self.session.link()?;
        let frame = encode_record(record)?;
        let config = self.config();
        let target = (config.remote_host.as_str(), config.remote_port);

        if let Err(e) = socket.send_to(&frame, target).await {
            let error = AdapterError::Connection(format!("send failed: {}", e));
            self.session.report_failure(&error);
            return Err(error);
        }

        debug!(protocol = PROTOCOL, "Sent {} bytes", frame.len());
        Ok(())
    }
}

delegate_adapter!(UdpClient);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{collecting_pipeline, next_record, record};
    use proxima_session::{ConnectionState, ProtocolAdapter};
    use serde_json::json;

    fn config(remote_port: u16) -> UdpClientConfig {
        UdpClientConfig {
            host: "127.0.0.1".into(),
            port: 0,
            remote_host: "127.0.0.1".into(),
            remote_port,
            reconnect_interval_ms: 100,
        }
    }

    #[tokio::test]
    async fn test_record_split_across_datagrams() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (pipeline, mut delivered) = collecting_pipeline();
        let client = UdpClient::new(config(peer.local_addr().unwrap().port()), pipeline);

        client.start().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
        let addr = client.local_addr().unwrap();

        peer.send_to(b"{\"a\":1}\n{\"a\"", addr).await.unwrap();
        peer.send_to(b":2}\n", addr).await.unwrap();

        assert_eq!(next_record(&mut delivered).await, record(json!({"a": 1})));
        assert_eq!(next_record(&mut delivered).await, record(json!({"a": 2})));
        assert_eq!(client.received_parsed_message(), record(json!({"a": 2})));

        client.stop().await;
        assert!(client.received_parsed_message().is_empty());
    }

    #[tokio::test]
    async fn test_send_message_to_remote() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpClient::new(config(peer.local_addr().unwrap().port()), Pipeline::new());

        let err = client.send_message(&record(json!({"n": 1}))).await.unwrap_err();
        assert!(matches!(err, AdapterError::NotConnected { .. }));

        client.start().await.unwrap();
        client.send_message(&record(json!({"n": 1}))).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"{\"n\":1}\n");

        client.stop().await;
    }
}
