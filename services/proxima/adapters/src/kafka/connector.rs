//! Kafka wire client built on `rskafka`.
//!
//! Every partition of every configured topic gets its own stream consumer,
//! and the streams are merged into one. Offsets start at the earliest or
//! latest record depending on `from_beginning`; nothing is committed back,
//! so `group_id` only labels the session in logs.

use super::{
    BrokerConnector, BrokerHandle, BrokerMessage, BrokerStream, KafkaClientConfig, PROTOCOL,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use proxima_session::{AdapterError, Result};
use rskafka::client::consumer::{StartOffset, StreamConsumerBuilder};
use rskafka::client::partition::{Compression, PartitionClient, UnknownTopicHandling};
use rskafka::client::{Client, ClientBuilder};
use rskafka::record::Record as KafkaRecord;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Longest a consumer fetch waits on the broker for new records
const MAX_WAIT_MS: i32 = 500;

fn connection_error(
    context: impl std::fmt::Display,
    e: rskafka::client::error::Error,
) -> AdapterError {
    AdapterError::Connection(format!("{}: {}", context, e))
}

fn start_offset(config: &KafkaClientConfig) -> StartOffset {
    if config.from_beginning {
        StartOffset::Earliest
    } else {
        StartOffset::Latest
    }
}

/// [`BrokerConnector`] speaking the Kafka protocol through `rskafka`
#[derive(Debug, Default, Clone, Copy)]
pub struct RsKafkaConnector;

impl RsKafkaConnector {
    /// Create a connector
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerConnector for RsKafkaConnector {
    async fn subscribe(
        &self,
        config: &KafkaClientConfig,
    ) -> Result<(Arc<dyn BrokerHandle>, BrokerStream)> {
        let client = ClientBuilder::new(config.brokers.clone())
            .build()
            .await
            .map_err(|e| connection_error(format!("bootstrap {:?}", config.brokers), e))?;
        let client = Arc::new(client);

        let metadata = client
            .list_topics()
            .await
            .map_err(|e| connection_error("list topics", e))?;

        let mut streams = Vec::new();
        for topic in &config.topics {
            let Some(found) = metadata.iter().find(|t| &t.name == topic) else {
                return Err(AdapterError::Connection(format!("unknown topic {}", topic)));
            };
            for &partition in &found.partitions {
                let partition_client = client
                    .partition_client(topic.clone(), partition, UnknownTopicHandling::Error)
                    .await
                    .map_err(|e| connection_error(format!("{}/{}", topic, partition), e))?;
                let consumer =
                    StreamConsumerBuilder::new(Arc::new(partition_client), start_offset(config))
                        .with_max_wait_ms(MAX_WAIT_MS)
                        .build();

                let topic = topic.clone();
                streams.push(
                    consumer
                        .filter_map(move |item| {
                            let topic = topic.clone();
                            async move {
                                match item {
                                    Ok((consumed, _high_watermark)) => {
                                        let value = consumed.record.value?;
                                        Some(Ok(BrokerMessage {
                                            topic,
                                            payload: Bytes::from(value),
                                        }))
                                    }
                                    Err(e) => Some(Err(connection_error(
                                        format!("consume {}", topic),
                                        e,
                                    ))),
                                }
                            }
                        })
                        .boxed(),
                );
            }
            debug!(
                protocol = PROTOCOL,
                "Consuming {} partitions of {}",
                found.partitions.len(),
                topic
            );
        }

        info!(
            protocol = PROTOCOL,
            "Client {} joined {:?}", config.client_id, config.brokers
        );
        let handle = RsKafkaHandle {
            client,
            producers: DashMap::new(),
            next_partition: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        };
        Ok((Arc::new(handle), futures::stream::select_all(streams).boxed()))
    }
}

/// Producer side of an `rskafka` session
struct RsKafkaHandle {
    client: Arc<Client>,
    /// Partition clients per topic, built on first publish
    producers: DashMap<String, Arc<Vec<PartitionClient>>>,
    next_partition: AtomicUsize,
    closed: AtomicBool,
}

impl RsKafkaHandle {
    async fn producers(&self, topic: &str) -> Result<Arc<Vec<PartitionClient>>> {
        let cached = self.producers.get(topic).map(|entry| entry.value().clone());
        if let Some(cached) = cached {
            return Ok(cached);
        }

        let metadata = self
            .client
            .list_topics()
            .await
            .map_err(|e| connection_error("list topics", e))?;
        let partitions = metadata
            .into_iter()
            .find(|t| t.name == topic)
            .map(|t| t.partitions)
            .ok_or_else(|| AdapterError::Delivery(format!("unknown topic {}", topic)))?;

        let mut clients = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let client = self
                .client
                .partition_client(topic, partition, UnknownTopicHandling::Error)
                .await
                .map_err(|e| AdapterError::Delivery(format!("{}/{}: {}", topic, partition, e)))?;
            clients.push(client);
        }
        if clients.is_empty() {
            return Err(AdapterError::Delivery(format!("{} has no partitions", topic)));
        }

        let clients = Arc::new(clients);
        self.producers.insert(topic.to_string(), clients.clone());
        Ok(clients)
    }
}

#[async_trait]
impl BrokerHandle for RsKafkaHandle {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AdapterError::NotConnected { protocol: PROTOCOL });
        }

        let producers = self.producers(topic).await?;
        let index = self.next_partition.fetch_add(1, Ordering::Relaxed) % producers.len();
        let record = KafkaRecord {
            key: None,
            value: Some(payload.to_vec()),
            headers: BTreeMap::new(),
            timestamp: chrono::Utc::now(),
        };

        producers[index]
            .produce(vec![record], Compression::NoCompression)
            .await
            .map(|_offsets| ())
            .map_err(|e| AdapterError::Delivery(format!("produce to {}: {}", topic, e)))
    }

    async fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.producers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::KafkaClient;
    use crate::testing::silent_listener;
    use proxima_session::{ConnectionState, Pipeline, ProtocolAdapter};
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn config(broker: String) -> KafkaClientConfig {
        KafkaClientConfig {
            connect_timeout_ms: Some(300),
            reconnect_interval_ms: 60_000,
            ..KafkaClientConfig::new(vec![broker], "proxima-group", vec!["orders".into()])
        }
    }

    #[tokio::test]
    async fn test_unreachable_broker_schedules_retry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = KafkaClient::new(
            config(format!("127.0.0.1:{}", port)),
            Pipeline::new(),
            Some(Arc::new(RsKafkaConnector::new())),
        );
        tokio::time::timeout(Duration::from_secs(5), client.start())
            .await
            .expect("start blocked on a refused broker")
            .unwrap();
        assert_eq!(client.state(), ConnectionState::Reconnecting);

        client.stop().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_silent_broker_bounds_start() {
        let silent = silent_listener().await;
        let client = KafkaClient::new(
            config(silent.addr.to_string()),
            Pipeline::new(),
            Some(Arc::new(RsKafkaConnector::new())),
        );

        tokio::time::timeout(Duration::from_secs(5), client.start())
            .await
            .expect("start blocked on a silent broker")
            .unwrap();
        assert_eq!(client.state(), ConnectionState::Reconnecting);
        assert!(silent.accepted() >= 1);

        client.stop().await;
    }
}
