//! Protocol adapters for proxima.
//!
//! One adapter per transport. Each wraps a [`Session`](proxima_session::Session)
//! around a transport collaborator and adds the data-plane calls that make
//! sense for that transport. Every adapter takes a serde config type and a
//! [`Pipeline`](proxima_session::Pipeline).
//!
//! | Protocol | Adapter | Collaborator |
//! |----------|---------|--------------|
//! | `tcp_client` | [`TcpClient`] | `tokio::net::TcpStream` |
//! | `udp_client` | [`UdpClient`] | `tokio::net::UdpSocket` |
//! | `ws_client` | [`WsClient`] | `tokio-tungstenite` |
//! | `ws_server` | [`WsServer`] | `tokio-tungstenite` |
//! | `http_client` | [`HttpClient`] | `reqwest` |
//! | `graphql_client` | [`GraphQlClient`] | `reqwest` |
//! | `mqtt_client` | [`MqttClient`] | `rumqttc` |
//! | `kafka_client` | [`KafkaClient`] | [`BrokerConnector`], `rskafka` via [`RsKafkaConnector`] |
//! | `ftp_client` | [`FtpClient`] | [`FileTransferConnector`], `suppaftp` via [`SuppaFtpConnector`] |

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Implement [`ProtocolAdapter`](proxima_session::ProtocolAdapter) by
/// delegating to the adapter's `session` field
macro_rules! delegate_adapter {
    ($adapter:ty) => {
        #[async_trait::async_trait]
        impl proxima_session::ProtocolAdapter for $adapter {
            fn protocol(&self) -> &'static str {
                self.session.protocol()
            }

            async fn start(&self) -> proxima_session::Result<()> {
                self.session.start().await
            }

            async fn stop(&self) {
                self.session.stop().await
            }

            fn state(&self) -> proxima_session::ConnectionState {
                self.session.state()
            }

            fn received_parsed_message(&self) -> proxima_wire::Record {
                self.session.received_parsed_message()
            }

            fn stats(&self) -> proxima_session::StatsSnapshot {
                self.session.stats()
            }
        }
    };
}

pub mod config;
pub mod ftp;
pub mod graphql;
pub mod http;
pub mod kafka;
pub mod mqtt;
pub mod tcp;
pub mod udp;
pub mod ws_client;
pub mod ws_server;

#[cfg(test)]
mod testing;

// Re-export main types
pub use ftp::{
    FileTransferConnector, FileTransferSession, FtpClient, FtpClientConfig, RemoteEntry,
    SuppaFtpConnector,
};
pub use graphql::{GraphQlClient, GraphQlClientConfig};
pub use http::{HttpClient, HttpClientConfig};
pub use kafka::{
    BrokerConnector, BrokerHandle, BrokerMessage, BrokerStream, KafkaClient, KafkaClientConfig,
    RsKafkaConnector,
};
pub use mqtt::{MqttClient, MqttClientConfig};
pub use tcp::{TcpClient, TcpClientConfig};
pub use udp::{UdpClient, UdpClientConfig};
pub use ws_client::{WsClient, WsClientConfig};
pub use ws_server::{WsServer, WsServerConfig};
