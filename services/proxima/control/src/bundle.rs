//! Per-protocol configuration bundle.

use crate::protocol::ProtocolId;
use proxima_adapters::{
    FtpClientConfig, GraphQlClientConfig, HttpClientConfig, KafkaClientConfig, MqttClientConfig,
    TcpClientConfig, UdpClientConfig, WsClientConfig, WsServerConfig,
};
use serde::{Deserialize, Serialize};

/// Default reconcile tick interval in milliseconds
pub const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 15_000;

fn default_reconcile_interval_ms() -> u64 {
    DEFAULT_RECONCILE_INTERVAL_MS
}

/// Configuration of one protocol, tagged by protocol
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolConfig {
    /// WebSocket server
    WsServer(WsServerConfig),
    /// WebSocket client
    WsClient(WsClientConfig),
    /// FTP client
    FtpClient(FtpClientConfig),
    /// Kafka client
    KafkaClient(KafkaClientConfig),
    /// MQTT client
    MqttClient(MqttClientConfig),
    /// GraphQL client
    GraphQlClient(GraphQlClientConfig),
    /// HTTP client
    HttpClient(HttpClientConfig),
    /// UDP client
    UdpClient(UdpClientConfig),
    /// TCP client
    TcpClient(TcpClientConfig),
}

impl ProtocolConfig {
    /// Protocol this configuration belongs to
    pub fn protocol(&self) -> ProtocolId {
        match self {
            ProtocolConfig::WsServer(_) => ProtocolId::WsServer,
            ProtocolConfig::WsClient(_) => ProtocolId::WsClient,
            ProtocolConfig::FtpClient(_) => ProtocolId::FtpClient,
            ProtocolConfig::KafkaClient(_) => ProtocolId::KafkaClient,
            ProtocolConfig::MqttClient(_) => ProtocolId::MqttClient,
            ProtocolConfig::GraphQlClient(_) => ProtocolId::GraphQlClient,
            ProtocolConfig::HttpClient(_) => ProtocolId::HttpClient,
            ProtocolConfig::UdpClient(_) => ProtocolId::UdpClient,
            ProtocolConfig::TcpClient(_) => ProtocolId::TcpClient,
        }
    }
}

/// Configuration slots, one per protocol
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProtocolConfigs {
    /// WebSocket server
    pub ws_server: Option<WsServerConfig>,
    /// WebSocket client
    pub ws_client: Option<WsClientConfig>,
    /// FTP client
    pub ftp_client: Option<FtpClientConfig>,
    /// Kafka client
    pub kafka_client: Option<KafkaClientConfig>,
    /// MQTT client
    pub mqtt_client: Option<MqttClientConfig>,
    /// GraphQL client
    pub graphql_client: Option<GraphQlClientConfig>,
    /// HTTP client
    pub http_client: Option<HttpClientConfig>,
    /// UDP client
    pub udp_client: Option<UdpClientConfig>,
    /// TCP client
    pub tcp_client: Option<TcpClientConfig>,
}

/// Everything the controller reads on a reconcile tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigBundle {
    /// Interval between reconcile ticks
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
    /// Per-protocol configurations
    #[serde(default)]
    pub protocols: ProtocolConfigs,
}

impl Default for ConfigBundle {
    fn default() -> Self {
        Self {
            reconcile_interval_ms: DEFAULT_RECONCILE_INTERVAL_MS,
            protocols: ProtocolConfigs::default(),
        }
    }
}

impl ConfigBundle {
    /// Configuration for `id`, if present
    pub fn get(&self, id: ProtocolId) -> Option<ProtocolConfig> {
        let p = &self.protocols;
        match id {
            ProtocolId::WsServer => p.ws_server.clone().map(ProtocolConfig::WsServer),
            ProtocolId::WsClient => p.ws_client.clone().map(ProtocolConfig::WsClient),
            ProtocolId::FtpClient => p.ftp_client.clone().map(ProtocolConfig::FtpClient),
            ProtocolId::KafkaClient => p.kafka_client.clone().map(ProtocolConfig::KafkaClient),
            ProtocolId::MqttClient => p.mqtt_client.clone().map(ProtocolConfig::MqttClient),
            ProtocolId::GraphQlClient => {
                p.graphql_client.clone().map(ProtocolConfig::GraphQlClient)
            }
            ProtocolId::HttpClient => p.http_client.clone().map(ProtocolConfig::HttpClient),
            ProtocolId::UdpClient => p.udp_client.clone().map(ProtocolConfig::UdpClient),
            ProtocolId::TcpClient => p.tcp_client.clone().map(ProtocolConfig::TcpClient),
        }
    }

    /// Store `config` in its protocol's slot
    pub fn set(&mut self, config: ProtocolConfig) {
        let p = &mut self.protocols;
        match config {
            ProtocolConfig::WsServer(c) => p.ws_server = Some(c),
            ProtocolConfig::WsClient(c) => p.ws_client = Some(c),
            ProtocolConfig::FtpClient(c) => p.ftp_client = Some(c),
            ProtocolConfig::KafkaClient(c) => p.kafka_client = Some(c),
            ProtocolConfig::MqttClient(c) => p.mqtt_client = Some(c),
            ProtocolConfig::GraphQlClient(c) => p.graphql_client = Some(c),
            ProtocolConfig::HttpClient(c) => p.http_client = Some(c),
            ProtocolConfig::UdpClient(c) => p.udp_client = Some(c),
            ProtocolConfig::TcpClient(c) => p.tcp_client = Some(c),
        }
    }

    /// Builder form of [`set`](Self::set)
    pub fn with(mut self, config: ProtocolConfig) -> Self {
        self.set(config);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_bundle() {
        let yaml = r#"
protocols:
  ws_server:
    port: 8081
  tcp_client:
    host: 127.0.0.1
    port: 9000
"#;
        let bundle: ConfigBundle = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(bundle.reconcile_interval_ms, DEFAULT_RECONCILE_INTERVAL_MS);

        match bundle.get(ProtocolId::WsServer) {
            Some(ProtocolConfig::WsServer(c)) => {
                assert_eq!(c.port, 8081);
                assert_eq!(c.host, "0.0.0.0");
            }
            other => panic!("unexpected config: {other:?}"),
        }
        assert_eq!(
            bundle.get(ProtocolId::TcpClient).map(|c| c.protocol()),
            Some(ProtocolId::TcpClient)
        );
        assert!(bundle.get(ProtocolId::MqttClient).is_none());
    }

    #[test]
    fn test_unknown_protocol_section_rejected() {
        let yaml = "protocols:\n  smtp_client:\n    host: mail\n";
        assert!(serde_yaml::from_str::<ConfigBundle>(yaml).is_err());
    }

    #[test]
    fn test_structural_equality() {
        let server = |port| ProtocolConfig::WsServer(WsServerConfig::on_port(port));
        let a = ConfigBundle::default().with(server(8081));
        let b = ConfigBundle::default().with(server(8081));
        assert_eq!(a.get(ProtocolId::WsServer), b.get(ProtocolId::WsServer));

        let c = a.clone().with(server(9090));
        assert_ne!(a.get(ProtocolId::WsServer), c.get(ProtocolId::WsServer));
    }
}
