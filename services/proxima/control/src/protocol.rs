//! Protocol identifiers and the desired-state declaration.

use crate::error::ControlError;
use proxima_adapters::{ftp, graphql, http, kafka, mqtt, tcp, udp, ws_client, ws_server};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Closed set of protocols the controller can manage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolId {
    /// WebSocket server
    WsServer,
    /// WebSocket client
    WsClient,
    /// FTP client
    FtpClient,
    /// Kafka client
    KafkaClient,
    /// MQTT client
    MqttClient,
    /// GraphQL client
    #[serde(rename = "graphql_client")]
    GraphQlClient,
    /// HTTP client
    HttpClient,
    /// UDP client
    UdpClient,
    /// TCP client
    TcpClient,
}

impl ProtocolId {
    /// Every protocol, in reconcile order
    pub const ALL: [ProtocolId; 9] = [
        ProtocolId::WsServer,
        ProtocolId::WsClient,
        ProtocolId::FtpClient,
        ProtocolId::KafkaClient,
        ProtocolId::MqttClient,
        ProtocolId::GraphQlClient,
        ProtocolId::HttpClient,
        ProtocolId::UdpClient,
        ProtocolId::TcpClient,
    ];

    /// Identifier as written in the desired-state declaration
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolId::WsServer => ws_server::PROTOCOL,
            ProtocolId::WsClient => ws_client::PROTOCOL,
            ProtocolId::FtpClient => ftp::PROTOCOL,
            ProtocolId::KafkaClient => kafka::PROTOCOL,
            ProtocolId::MqttClient => mqtt::PROTOCOL,
            ProtocolId::GraphQlClient => graphql::PROTOCOL,
            ProtocolId::HttpClient => http::PROTOCOL,
            ProtocolId::UdpClient => udp::PROTOCOL,
            ProtocolId::TcpClient => tcp::PROTOCOL,
        }
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolId {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProtocolId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| ControlError::UnknownProtocol(s.to_string()))
    }
}

/// Set of protocols that should currently be running
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState(BTreeSet<ProtocolId>);

impl DesiredState {
    /// Parse a comma separated declaration such as `"ws_server, tcp_client"`.
    ///
    /// Entries are trimmed; empty entries are skipped. Unknown identifiers
    /// are logged and ignored so that one typo does not stall the others.
    pub fn parse(declaration: &str) -> Self {
        let mut ids = BTreeSet::new();
        for entry in declaration.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match entry.parse::<ProtocolId>() {
                Ok(id) => {
                    ids.insert(id);
                }
                Err(e) => warn!("Ignoring desired-state entry: {}", e),
            }
        }
        Self(ids)
    }

    /// Whether `id` should be running
    pub fn contains(&self, id: ProtocolId) -> bool {
        self.0.contains(&id)
    }

    /// Desired protocols in reconcile order
    pub fn iter(&self) -> impl Iterator<Item = ProtocolId> + '_ {
        self.0.iter().copied()
    }

    /// Number of desired protocols
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Nothing should be running
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<_> = self.iter().map(ProtocolId::as_str).collect();
        f.write_str(&ids.join(", "))
    }
}
