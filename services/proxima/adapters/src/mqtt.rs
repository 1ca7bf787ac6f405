//! MQTT subscriber and publisher.
//!
//! Connecting waits for the broker's CONNACK, then subscribes to every
//! configured topic in a single SUBSCRIBE. Each PUBLISH runs through the pipeline tagged with its
//! topic.

use crate::config::{default_reconnect_interval_ms, millis};
use async_trait::async_trait;
use futures::StreamExt;
use proxima_session::{
    AdapterError, Inbound, InboundStream, Pipeline, Result, Session, Transport,
    DEFAULT_CONNECT_TIMEOUT,
};
use proxima_wire::{encode_record, Record};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeFilter};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Protocol identifier
pub const PROTOCOL: &str = "mqtt_client";

const DEFAULT_MQTT_PORT: u16 = 1883;
const REQUEST_CAPACITY: usize = 64;

fn default_keep_alive_secs() -> u64 {
    30
}

/// MQTT client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttClientConfig {
    /// Client identifier presented to the broker
    pub client_id: String,
    /// Broker URL, `mqtt://host:port`
    pub broker_url: String,
    /// Topics to subscribe to
    pub topics: Vec<String>,
    /// Subscription and publish QoS (0, 1 or 2)
    #[serde(default)]
    pub qos: u8,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Broker username
    #[serde(default)]
    pub username: Option<String>,
    /// Broker password
    #[serde(default)]
    pub password: Option<String>,
    /// Delay between reconnect attempts
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

impl MqttClientConfig {
    fn qos(&self) -> Result<QoS> {
        match self.qos {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(AdapterError::Config(format!("invalid qos {}", other))),
        }
    }

    fn broker(&self) -> Result<(String, u16)> {
        let url = Url::parse(&self.broker_url).map_err(|e| {
            AdapterError::Config(format!("invalid broker url {}: {}", self.broker_url, e))
        })?;
        if !matches!(url.scheme(), "mqtt" | "tcp") {
            return Err(AdapterError::Config(format!(
                "unsupported broker scheme {}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| AdapterError::Config(format!("broker url {} has no host", url)))?;
        Ok((host.to_string(), url.port().unwrap_or(DEFAULT_MQTT_PORT)))
    }

    fn options(&self) -> Result<MqttOptions> {
        let (host, port) = self.broker()?;
        let mut options = MqttOptions::new(self.client_id.clone(), host, port);
        options.set_keep_alive(Duration::from_secs(self.keep_alive_secs.max(5)));
        if let Some(username) = &self.username {
            options.set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }
        Ok(options)
    }
}

/// Broker transport behind [`MqttClient`]
pub struct MqttTransport {
    config: MqttClientConfig,
}

#[async_trait]
impl Transport for MqttTransport {
    type Link = AsyncClient;

    fn name(&self) -> &'static str {
        PROTOCOL
    }

    fn reconnect_interval(&self) -> Duration {
        millis(self.config.reconnect_interval_ms)
    }

    async fn prepare(&self) -> Result<()> {
        if self.config.topics.is_empty() {
            return Err(AdapterError::Config("no topics configured".into()));
        }
        if self.config.client_id.is_empty() {
            return Err(AdapterError::Config("client_id must not be empty".into()));
        }
        self.config.qos()?;
        self.config.broker()?;
        Ok(())
    }

    async fn connect(&self) -> Result<(Self::Link, InboundStream)> {
        let (client, mut events) = AsyncClient::new(self.config.options()?, REQUEST_CAPACITY);

        tokio::time::timeout(DEFAULT_CONNECT_TIMEOUT, wait_for_connack(&mut events))
            .await
            .map_err(|_| AdapterError::Connection("timed out waiting for CONNACK".into()))??;
        info!(protocol = PROTOCOL, "Connected to {}", self.config.broker_url);

        // One request, so the bounded request channel cannot fill up before
        // the event loop is polled
        let qos = self.config.qos()?;
        let filters = self
            .config
            .topics
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), qos));
        client
            .subscribe_many(filters)
            .await
            .map_err(|e| AdapterError::Connection(format!("subscribe: {}", e)))?;
        debug!(
            protocol = PROTOCOL,
            "Subscribing to {} topics",
            self.config.topics.len()
        );

        Ok((client, publishes(events)))
    }

    async fn close(&self, link: &Self::Link) {
        if let Err(e) = link.try_disconnect() {
            debug!(protocol = PROTOCOL, "Disconnect failed: {}", e);
        }
    }
}

async fn wait_for_connack(events: &mut EventLoop) -> Result<()> {
    loop {
        let event = events
            .poll()
            .await
            .map_err(|e| AdapterError::Connection(e.to_string()))?;
        if let Event::Incoming(Packet::ConnAck(_)) = event {
            return Ok(());
        }
    }
}

/// Drive the event loop and yield every non-empty PUBLISH
fn publishes(events: EventLoop) -> InboundStream {
    futures::stream::unfold(Some(events), |events| async move {
        let mut events = events?;
        loop {
            match events.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if publish.payload.is_empty() {
                        debug!(protocol = PROTOCOL, "Empty payload on {}", publish.topic);
                        continue;
                    }
                    let inbound = Inbound::Message {
                        body: publish.payload,
                        topic: Some(publish.topic),
                        reply: None,
                    };
                    return Some((Ok(inbound), Some(events)));
                }
                Ok(Event::Incoming(Packet::Disconnect)) => return None,
                Ok(_) => continue,
                Err(e) => {
                    let error = AdapterError::Connection(e.to_string());
                    return Some((Err(error), None));
                }
            }
        }
    })
    .boxed()
}

/// MQTT client adapter
pub struct MqttClient {
    session: Session<MqttTransport>,
}

impl MqttClient {
    /// Create a stopped client
    pub fn new(config: MqttClientConfig, pipeline: Pipeline) -> Self {
        Self {
            session: Session::new(MqttTransport { config }, pipeline),
        }
    }

    /// Configuration the client was built with
    pub fn config(&self) -> &MqttClientConfig {
        &self.session.transport().config
    }

    /// Publish a record to `topic` at the configured QoS
    pub async fn publish(&self, topic: &str, record: &Record) -> Result<()> {
        let client = self.session.link()?;
        let qos = self.config().qos()?;
        let payload = encode_record(record)?;

        client
            .publish(topic, qos, false, payload.to_vec())
            .await
            .map_err(|e| AdapterError::Delivery(format!("publish to {}: {}", topic, e)))
    }
}

delegate_adapter!(MqttClient);
