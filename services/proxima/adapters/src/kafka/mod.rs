//! Broker consumer/producer behind a pluggable connector.
//!
//! The wire client is supplied through [`BrokerConnector`];
//! [`RsKafkaConnector`] speaks the Kafka protocol directly. The adapter owns
//! the lifecycle: it subscribes on connect, feeds every consumed message
//! through the pipeline tagged with its topic, and reconnects when the
//! consumer stream ends.

mod connector;

pub use connector::RsKafkaConnector;

use crate::config::{default_reconnect_interval_ms, default_true, millis};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use proxima_session::{
    AdapterError, Inbound, InboundStream, Pipeline, Result, Session, Transport,
    DEFAULT_CONNECT_TIMEOUT,
};
use proxima_wire::{encode_record, Record};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Protocol identifier
pub const PROTOCOL: &str = "kafka_client";

/// Kafka client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KafkaClientConfig {
    /// Client identifier
    pub client_id: String,
    /// Bootstrap brokers, `host:port`
    pub brokers: Vec<String>,
    /// Consumer group
    pub group_id: String,
    /// Topics to consume
    pub topics: Vec<String>,
    /// Start from the earliest offset when the group has none
    #[serde(default = "default_true")]
    pub from_beginning: bool,
    /// Upper bound for connecting and subscribing
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    /// Delay between reconnect attempts
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

impl KafkaClientConfig {
    /// Configuration with default offsets and timings
    pub fn new(
        brokers: Vec<String>,
        group_id: impl Into<String>,
        topics: Vec<String>,
    ) -> Self {
        Self {
            client_id: "proxima".into(),
            brokers,
            group_id: group_id.into(),
            topics,
            from_beginning: true,
            connect_timeout_ms: None,
            reconnect_interval_ms: default_reconnect_interval_ms(),
        }
    }
}

/// One consumed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Topic the message was consumed from
    pub topic: String,
    /// Raw message value
    pub payload: Bytes,
}

/// Consumed messages; ending or erroring means the consumer is gone
pub type BrokerStream = BoxStream<'static, Result<BrokerMessage>>;

/// Producer side of a live broker session
#[async_trait]
pub trait BrokerHandle: Send + Sync {
    /// Produce one message
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Leave the group and close the session
    async fn disconnect(&self);
}

/// Opens broker sessions for a [`KafkaClient`]
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Connect, join the consumer group and subscribe to the configured
    /// topics
    async fn subscribe(
        &self,
        config: &KafkaClientConfig,
    ) -> Result<(Arc<dyn BrokerHandle>, BrokerStream)>;
}

/// Broker transport behind [`KafkaClient`]
pub struct KafkaTransport {
    config: KafkaClientConfig,
    connector: Option<Arc<dyn BrokerConnector>>,
}

impl KafkaTransport {
    fn connector(&self) -> Result<&Arc<dyn BrokerConnector>> {
        self.connector
            .as_ref()
            .ok_or_else(|| AdapterError::Config("no broker connector registered".into()))
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    type Link = Arc<dyn BrokerHandle>;

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
        self.connector()?;
        if self.config.brokers.is_empty() {
            return Err(AdapterError::Config("no brokers configured".into()));
        }
        if self.config.topics.is_empty() {
            return Err(AdapterError::Config("no topics configured".into()));
        }
        Ok(())
    }

    async fn connect(&self) -> Result<(Self::Link, InboundStream)> {
        let (handle, messages) = self.connector()?.subscribe(&self.config).await?;
        info!(
            protocol = PROTOCOL,
            "Consuming {:?} as group {}", self.config.topics, self.config.group_id
        );

        let inbound = messages
            .map(|message| {
                message.map(|m| Inbound::Message {
                    body: m.payload,
                    topic: Some(m.topic),
                    reply: None,
                })
            })
            .boxed();
        Ok((handle, inbound))
    }

    async fn close(&self, link: &Self::Link) {
        link.disconnect().await;
        debug!(protocol = PROTOCOL, "Broker session closed");
    }
}

/// Kafka client adapter
pub struct KafkaClient {
    session: Session<KafkaTransport>,
}

impl KafkaClient {
    /// Create a stopped client. Without a connector, `start` fails with a
    /// configuration error.
    pub fn new(
        config: KafkaClientConfig,
        pipeline: Pipeline,
        connector: Option<Arc<dyn BrokerConnector>>,
    ) -> Self {
        Self {
            session: Session::new(KafkaTransport { config, connector }, pipeline),
        }
    }

    /// Configuration the client was built with
    pub fn config(&self) -> &KafkaClientConfig {
        &self.session.transport().config
    }

    /// Produce a record to `topic`
    pub async fn publish(&self, topic: &str, record: &Record) -> Result<()> {
        let handle = self.session.link()?;
        let payload = encode_record(record)?;
        handle.publish(topic, payload).await
    }
}

delegate_adapter!(KafkaClient);
