//! Adapter construction: the [`Adapter`] sum type and the [`Registry`] of
//! factories, pipelines and connectors the controller builds adapters from.

use crate::bundle::ProtocolConfig;
use crate::error::{ControlError, Result};
use crate::protocol::ProtocolId;
use proxima_adapters::{
    BrokerConnector, FileTransferConnector, FtpClient, GraphQlClient, HttpClient, KafkaClient,
    MqttClient, TcpClient, UdpClient, WsClient, WsServer,
};
use proxima_session::{Pipeline, ProtocolAdapter};
use std::collections::HashMap;
use std::sync::Arc;

/// One live adapter of any protocol
pub enum Adapter {
    /// WebSocket server
    WsServer(WsServer),
    /// WebSocket client
    WsClient(WsClient),
    /// FTP client
    FtpClient(FtpClient),
    /// Kafka client
    KafkaClient(KafkaClient),
    /// MQTT client
    MqttClient(MqttClient),
    /// GraphQL client
    GraphQlClient(GraphQlClient),
    /// HTTP client
    HttpClient(HttpClient),
    /// UDP client
    UdpClient(UdpClient),
    /// TCP client
    TcpClient(TcpClient),
    /// Adapter supplied by a custom factory
    Custom(Arc<dyn ProtocolAdapter>),
}

impl Adapter {
    /// Lifecycle view of the adapter
    pub fn as_protocol(&self) -> &dyn ProtocolAdapter {
        match self {
            Adapter::WsServer(a) => a,
            Adapter::WsClient(a) => a,
            Adapter::FtpClient(a) => a,
            Adapter::KafkaClient(a) => a,
            Adapter::MqttClient(a) => a,
            Adapter::GraphQlClient(a) => a,
            Adapter::HttpClient(a) => a,
            Adapter::UdpClient(a) => a,
            Adapter::TcpClient(a) => a,
            Adapter::Custom(a) => a.as_ref(),
        }
    }

    /// WebSocket server, if this is one
    pub fn as_ws_server(&self) -> Option<&WsServer> {
        match self {
            Adapter::WsServer(a) => Some(a),
            _ => None,
        }
    }

    /// WebSocket client, if this is one
    pub fn as_ws_client(&self) -> Option<&WsClient> {
        match self {
            Adapter::WsClient(a) => Some(a),
            _ => None,
        }
    }

    /// FTP client, if this is one
    pub fn as_ftp_client(&self) -> Option<&FtpClient> {
        match self {
            Adapter::FtpClient(a) => Some(a),
            _ => None,
        }
    }

    /// Kafka client, if this is one
    pub fn as_kafka_client(&self) -> Option<&KafkaClient> {
        match self {
            Adapter::KafkaClient(a) => Some(a),
            _ => None,
        }
    }

    /// MQTT client, if this is one
    pub fn as_mqtt_client(&self) -> Option<&MqttClient> {
        match self {
            Adapter::MqttClient(a) => Some(a),
            _ => None,
        }
    }

    /// GraphQL client, if this is one
    pub fn as_graphql_client(&self) -> Option<&GraphQlClient> {
        match self {
            Adapter::GraphQlClient(a) => Some(a),
            _ => None,
        }
    }

    /// HTTP client, if this is one
    pub fn as_http_client(&self) -> Option<&HttpClient> {
        match self {
            Adapter::HttpClient(a) => Some(a),
            _ => None,
        }
    }

    /// UDP client, if this is one
    pub fn as_udp_client(&self) -> Option<&UdpClient> {
        match self {
            Adapter::UdpClient(a) => Some(a),
            _ => None,
        }
    }

    /// TCP client, if this is one
    pub fn as_tcp_client(&self) -> Option<&TcpClient> {
        match self {
            Adapter::TcpClient(a) => Some(a),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("protocol", &self.as_protocol().protocol())
            .field("state", &self.as_protocol().state())
            .finish()
    }
}

/// Builds an adapter from its configuration
pub type AdapterFactory =
    Arc<dyn Fn(&ProtocolConfig, Pipeline) -> Result<Adapter> + Send + Sync>;

/// Everything needed to turn a [`ProtocolConfig`] into an [`Adapter`]
///
/// Built-in adapters are used unless a factory is registered for the
/// protocol. Kafka and FTP need a connector; without one their `start`
/// fails with a configuration error.
#[derive(Clone, Default)]
pub struct Registry {
    factories: HashMap<ProtocolId, AdapterFactory>,
    pipelines: HashMap<ProtocolId, Pipeline>,
    broker: Option<Arc<dyn BrokerConnector>>,
    file_transfer: Option<Arc<dyn FileTransferConnector>>,
}

impl Registry {
    /// Registry of built-in adapters with empty pipelines
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `pipeline` for every adapter built for `id`
    pub fn with_pipeline(mut self, id: ProtocolId, pipeline: Pipeline) -> Self {
        self.pipelines.insert(id, pipeline);
        self
    }

    /// Use `pipeline` for every protocol without a dedicated one
    pub fn with_default_pipeline(mut self, pipeline: Pipeline) -> Self {
        for id in ProtocolId::ALL {
            self.pipelines.entry(id).or_insert_with(|| pipeline.clone());
        }
        self
    }

    /// Replace the built-in adapter for `id`
    pub fn with_factory<F>(mut self, id: ProtocolId, factory: F) -> Self
    where
        F: Fn(&ProtocolConfig, Pipeline) -> Result<Adapter> + Send + Sync + 'static,
    {
        self.factories.insert(id, Arc::new(factory));
        self
    }

    /// Broker connector for the Kafka adapter
    pub fn with_broker_connector(mut self, connector: Arc<dyn BrokerConnector>) -> Self {
        self.broker = Some(connector);
        self
    }

    /// File transfer connector for the FTP adapter
    pub fn with_file_transfer_connector(
        mut self,
        connector: Arc<dyn FileTransferConnector>,
    ) -> Self {
        self.file_transfer = Some(connector);
        self
    }

    /// Pipeline used for `id`
    pub fn pipeline(&self, id: ProtocolId) -> Pipeline {
        self.pipelines.get(&id).cloned().unwrap_or_default()
    }

    /// Build a stopped adapter for `config`
    pub fn build(&self, config: &ProtocolConfig) -> Result<Adapter> {
        let id = config.protocol();
        let pipeline = self.pipeline(id);

        if let Some(factory) = self.factories.get(&id) {
            let adapter = factory(config, pipeline)?;
            let built = adapter.as_protocol().protocol();
            if built != id.as_str() {
                return Err(ControlError::Factory {
                    protocol: id,
                    reason: format!("factory built a {} adapter", built),
                });
            }
            return Ok(adapter);
        }

        Ok(match config.clone() {
            ProtocolConfig::WsServer(c) => Adapter::WsServer(WsServer::new(c, pipeline)),
            ProtocolConfig::WsClient(c) => Adapter::WsClient(WsClient::new(c, pipeline)),
            ProtocolConfig::FtpClient(c) => {
                Adapter::FtpClient(FtpClient::new(c, pipeline, self.file_transfer.clone()))
            }
            ProtocolConfig::KafkaClient(c) => {
                Adapter::KafkaClient(KafkaClient::new(c, pipeline, self.broker.clone()))
            }
            ProtocolConfig::MqttClient(c) => Adapter::MqttClient(MqttClient::new(c, pipeline)),
            ProtocolConfig::GraphQlClient(c) => {
                Adapter::GraphQlClient(GraphQlClient::new(c, pipeline))
            }
            ProtocolConfig::HttpClient(c) => Adapter::HttpClient(HttpClient::new(c, pipeline)),
            ProtocolConfig::UdpClient(c) => Adapter::UdpClient(UdpClient::new(c, pipeline)),
            ProtocolConfig::TcpClient(c) => Adapter::TcpClient(TcpClient::new(c, pipeline)),
        })
    }
}
