//! WebSocket server with a client registry and ping sweep.
//!
//! Every accepted client gets a UUID and an entry in the registry. Inbound
//! text and binary frames from all clients are funnelled into the session's
//! inbound stream in arrival order, each carrying a reply channel back to
//! its client. Dropping a client's registry entry terminates the client.

use crate::config::{default_ping_pong_interval_ms, default_reconnect_interval_ms, millis};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use proxima_session::{
    tls, AdapterError, Inbound, InboundStream, IoStream, Pipeline, Result, Session, Transport,
};
use proxima_wire::{Record, WireError};
use rustls::ServerConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Protocol identifier
pub const PROTOCOL: &str = "ws_server";

fn default_host() -> String {
    "0.0.0.0".to_string()
}

/// WebSocket server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsServerConfig {
    /// Listen address
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port (0 picks an ephemeral port)
    pub port: u16,
    /// Serve `wss` using the certificate and key below
    #[serde(default)]
    pub secure: bool,
    /// PEM certificate chain
    #[serde(default)]
    pub certificate_path: Option<PathBuf>,
    /// PEM private key
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    /// Interval between pings; clients silent for a whole interval are dropped
    #[serde(default = "default_ping_pong_interval_ms")]
    pub ping_pong_interval_ms: u64,
    /// Delay between bind attempts
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

impl WsServerConfig {
    /// Plain server on all interfaces with default timings
    pub fn on_port(port: u16) -> Self {
        Self {
            host: default_host(),
            port,
            secure: false,
            certificate_path: None,
            private_key_path: None,
            ping_pong_interval_ms: default_ping_pong_interval_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
        }
    }
}

struct ClientHandle {
    outbound: mpsc::UnboundedSender<Message>,
    alive: Arc<AtomicBool>,
    /// Dropped to terminate the client
    _kill: oneshot::Sender<()>,
}

type Clients = Arc<DashMap<Uuid, ClientHandle>>;

/// Listening server behind a connected [`WsServer`]
pub struct ServerLink {
    local_addr: SocketAddr,
    accept: AbortHandle,
    sweep: AbortHandle,
}

/// Listener transport behind [`WsServer`]
pub struct WsServerTransport {
    config: WsServerConfig,
    clients: Clients,
    tls: Mutex<Option<Arc<ServerConfig>>>,
}

#[async_trait]
impl Transport for WsServerTransport {
    type Link = ServerLink;

    fn name(&self) -> &'static str {
        PROTOCOL
    }

    fn reconnect_interval(&self) -> Duration {
        millis(self.config.reconnect_interval_ms)
    }

    async fn prepare(&self) -> Result<()> {
        if !self.config.secure {
            *self.tls.lock() = None;
            return Ok(());
        }

        let (Some(cert), Some(key)) = (
            &self.config.certificate_path,
            &self.config.private_key_path,
        ) else {
            return Err(AdapterError::Config(
                "secure WebSocket server requires certificate_path and private_key_path".into(),
            ));
        };
        let config = tls::server_config(cert, key).await?;
        *self.tls.lock() = Some(config);
        Ok(())
    }

    async fn connect(&self) -> Result<(Self::Link, InboundStream)> {
        let bind = (self.config.host.as_str(), self.config.port);
        let listener = TcpListener::bind(bind).await.map_err(|e| {
            AdapterError::Connection(format!(
                "bind {}:{}: {}",
                self.config.host, self.config.port, e
            ))
        })?;
        let local_addr = listener.local_addr()?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let tls_config = self.tls.lock().clone();
        let accept = tokio::spawn(accept_loop(
            listener,
            tls_config,
            self.clients.clone(),
            inbound_tx,
        ));
        let sweep = tokio::spawn(ping_sweep(
            self.clients.clone(),
            millis(self.config.ping_pong_interval_ms),
        ));

        info!(protocol = PROTOCOL, "Listening on {}", local_addr);
        let link = ServerLink {
            local_addr,
            accept: accept.abort_handle(),
            sweep: sweep.abort_handle(),
        };
        Ok((link, UnboundedReceiverStream::new(inbound_rx).boxed()))
    }

    async fn close(&self, link: &Self::Link) {
        link.accept.abort();
        link.sweep.abort();
        let count = self.clients.len();
        self.clients.clear();
        info!(
            protocol = PROTOCOL,
            "Server on {} closed, {} clients terminated", link.local_addr, count
        );
    }
}

async fn accept_loop(
    listener: TcpListener,
    tls_config: Option<Arc<ServerConfig>>,
    clients: Clients,
    inbound: mpsc::UnboundedSender<Result<Inbound>>,
) {
    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                let _ = inbound.send(Err(AdapterError::Io(e)));
                return;
            }
        };

        let id = Uuid::new_v4();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let alive = Arc::new(AtomicBool::new(true));
        clients.insert(
            id,
            ClientHandle {
                outbound: outbound_tx,
                alive: alive.clone(),
                _kill: kill_tx,
            },
        );
        debug!(protocol = PROTOCOL, client = %id, "Accepted connection from {}", peer);

        tokio::spawn(serve_client(
            id,
            tcp,
            tls_config.clone(),
            clients.clone(),
            inbound.clone(),
            outbound_rx,
            alive,
            kill_rx,
        ));
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve_client(
    id: Uuid,
    tcp: TcpStream,
    tls_config: Option<Arc<ServerConfig>>,
    clients: Clients,
    inbound: mpsc::UnboundedSender<Result<Inbound>>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    alive: Arc<AtomicBool>,
    mut kill: oneshot::Receiver<()>,
) {
    let connection = async {
        let stream = match tls_config {
            Some(config) => tls::accept_tls(config, tcp).await?,
            None => IoStream::Plain(tcp),
        };
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| AdapterError::Connection(format!("handshake failed: {}", e)))?;
        let (mut sink, mut source) = ws.split();
        let (reply_tx, mut replies) = mpsc::unbounded_channel::<Record>();
        info!(protocol = PROTOCOL, client = %id, "Client registered");

        loop {
            tokio::select! {
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let _ = inbound.send(Ok(Inbound::Message {
                            body: text.into(),
                            topic: None,
                            reply: Some(reply_tx.clone()),
                        }));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let _ = inbound.send(Ok(Inbound::Message {
                            body: data.into(),
                            topic: None,
                            reply: Some(reply_tx.clone()),
                        }));
                    }
                    Some(Ok(Message::Pong(_))) => {
                        debug!(protocol = PROTOCOL, client = %id, "Pong");
                        alive.store(true, Ordering::SeqCst);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(AdapterError::Connection(e.to_string()));
                    }
                },
                Some(message) = outbound.recv() => {
                    sink.send(message)
                        .await
                        .map_err(|e| AdapterError::Connection(e.to_string()))?;
                }
                Some(reply) = replies.recv() => {
                    let text = serde_json::to_string(&reply).map_err(WireError::from)?;
                    sink.send(Message::Text(text))
                        .await
                        .map_err(|e| AdapterError::Connection(e.to_string()))?;
                }
            }
        }
        Ok::<(), AdapterError>(())
    };

    tokio::select! {
        result = connection => {
            if let Err(e) = result {
                warn!(protocol = PROTOCOL, client = %id, "Client error: {}", e);
            }
        }
        _ = &mut kill => {
            debug!(protocol = PROTOCOL, client = %id, "Client terminated");
        }
    }

    clients.remove(&id);
    info!(protocol = PROTOCOL, client = %id, "Client disconnected");
}

async fn ping_sweep(clients: Clients, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let mut silent = Vec::new();
        for client in clients.iter() {
            if client.alive.swap(false, Ordering::SeqCst) {
                let _ = client.outbound.send(Message::Ping(Vec::new()));
            } else {
                silent.push(*client.key());
            }
        }

        for id in silent {
            warn!(
                protocol = PROTOCOL,
                client = %id,
                "Client did not answer ping; terminating"
            );
            clients.remove(&id);
        }
    }
}

/// WebSocket server adapter
pub struct WsServer {
    session: Session<WsServerTransport>,
}

impl WsServer {
    /// Create a stopped server
    pub fn new(config: WsServerConfig, pipeline: Pipeline) -> Self {
        let transport = WsServerTransport {
            config,
            clients: Arc::new(DashMap::new()),
            tls: Mutex::new(None),
        };
        Self {
            session: Session::new(transport, pipeline),
        }
    }

    /// Configuration the server was built with
    pub fn config(&self) -> &WsServerConfig {
        &self.session.transport().config
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.session.link()?.local_addr)
    }

    /// Ids of the registered clients
    pub fn clients(&self) -> Result<Vec<Uuid>> {
        self.session.link()?;
        Ok(self
            .session
            .transport()
            .clients
            .iter()
            .map(|client| *client.key())
            .collect())
    }

    /// Send a record to every registered client; returns how many were reached
    pub fn broadcast(&self, record: &Record) -> Result<usize> {
        self.session.link()?;
        let text = serde_json::to_string(record).map_err(WireError::from)?;

        let reached = self
            .session
            .transport()
            .clients
            .iter()
            .filter(|client| client.outbound.send(Message::Text(text.clone())).is_ok())
            .count();
        debug!(protocol = PROTOCOL, "Broadcast to {} clients", reached);
        Ok(reached)
    }

    /// Send a record to one client
    pub fn send_to(&self, client: Uuid, record: &Record) -> Result<()> {
        self.session.link()?;
        let text = serde_json::to_string(record).map_err(WireError::from)?;

        let clients = &self.session.transport().clients;
        let handle = clients
            .get(&client)
            .ok_or_else(|| AdapterError::Delivery(format!("unknown client {}", client)))?;
        handle
            .outbound
            .send(Message::Text(text))
            .map_err(|_| AdapterError::Delivery(format!("client {} is gone", client)))
    }
}

delegate_adapter!(WsServer);
