//! Stream socket client speaking line-delimited JSON.

use crate::config::{default_reconnect_interval_ms, default_true, millis};
use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use proxima_session::{
    connect_tcp, AdapterError, Inbound, InboundStream, Pipeline, Result, Session, SocketOptions,
    Transport, DEFAULT_CONNECT_TIMEOUT,
};
use proxima_wire::{encode_record, Record};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tracing::debug;

/// Protocol identifier
pub const PROTOCOL: &str = "tcp_client";

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// TCP client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpClientConfig {
    /// Remote host
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Delay between reconnect attempts
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    /// Connect timeout; defaults to ten seconds
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    /// Disable Nagle's algorithm
    #[serde(default = "default_true")]
    pub no_delay: bool,
    /// Enable TCP keepalive
    #[serde(default = "default_true")]
    pub keep_alive: bool,
}

impl TcpClientConfig {
    /// Client for `host:port` with default settings
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            reconnect_interval_ms: default_reconnect_interval_ms(),
            connect_timeout_ms: None,
            no_delay: true,
            keep_alive: true,
        }
    }

    fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            no_delay: self.no_delay,
            keep_alive: self.keep_alive,
        }
    }
}

/// Socket transport behind [`TcpClient`]
pub struct TcpTransport {
    config: TcpClientConfig,
}

#[async_trait]
impl Transport for TcpTransport {
    type Link = Mutex<OwnedWriteHalf>;

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

    async fn connect(&self) -> Result<(Self::Link, InboundStream)> {
        let stream = connect_tcp(
            &self.config.host,
            self.config.port,
            self.connect_timeout(),
            self.config.socket_options(),
        )
        .await?;
        let (reader, writer) = stream.into_split();
        Ok((Mutex::new(writer), read_chunks(reader)))
    }

    async fn close(&self, link: &Self::Link) {
        if let Err(e) = link.lock().await.shutdown().await {
            debug!(protocol = PROTOCOL, "Shutdown failed: {}", e);
        }
    }
}

/// Turn a byte reader into raw inbound chunks; EOF ends the stream
pub(crate) fn read_chunks<R>(reader: R) -> InboundStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    futures::stream::unfold(Some(reader), |reader| async move {
        let mut reader = reader?;
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        match reader.read_buf(&mut buf).await {
            Ok(0) => None,
            Ok(_) => Some((Ok(Inbound::Chunk(buf.freeze())), Some(reader))),
            Err(e) => Some((Err(AdapterError::Io(e)), None)),
        }
    })
    .boxed()
}

/// Line-delimited JSON client over TCP
pub struct TcpClient {
    session: Session<TcpTransport>,
}

impl TcpClient {
    /// Create a stopped client
    pub fn new(config: TcpClientConfig, pipeline: Pipeline) -> Self {
        Self {
            session: Session::new(TcpTransport { config }, pipeline),
        }
    }

    /// Configuration the client was built with
    pub fn config(&self) -> &TcpClientConfig {
        &self.session.transport().config
    }

    /// Write one record followed by the delimiter.
    ///
    /// A write failure tears the connection down and schedules a reconnect
    /// before being returned.
    pub async fn send_message(&self, record: &Record) -> Result<()> {
        let link = self.session.link()?;
        let frame = encode_record(record)?;

        let written = link.lock().await.write_all(&frame).await;
        if let Err(e) = written {
            let error = AdapterError::Connection(format!("write failed: {}", e));
            self.session.report_failure(&error);
            return Err(error);
        }

        debug!(protocol = PROTOCOL, "Sent {} bytes", frame.len());
        Ok(())
    }
}

delegate_adapter!(TcpClient);
