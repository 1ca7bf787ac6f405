//! File transfer client behind a pluggable connector.
//!
//! File transfer has no inbound message flow, so a connected session only
//! serves the data-plane calls. A call failing with a connection error tears
//! the session down and schedules a reconnect. [`SuppaFtpConnector`] speaks
//! plain FTP.

mod connector;

pub use connector::SuppaFtpConnector;

use crate::config::{default_reconnect_interval_ms, millis};
use async_trait::async_trait;
use futures::StreamExt;
use proxima_session::{AdapterError, InboundStream, Pipeline, Result, Session, Transport};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Protocol identifier
pub const PROTOCOL: &str = "ftp_client";

fn default_port() -> u16 {
    21
}

fn default_timeout_ms() -> u64 {
    5000
}

/// FTP client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FtpClientConfig {
    /// Server host
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login user
    #[serde(default)]
    pub user: Option<String>,
    /// Login password
    #[serde(default)]
    pub password: Option<String>,
    /// Use explicit TLS
    #[serde(default)]
    pub secure: bool,
    /// Control connection timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Delay between reconnect attempts
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

/// One entry of a remote directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Entry name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Entry is a directory
    pub is_dir: bool,
}

/// Logged-in file transfer session
#[async_trait]
pub trait FileTransferSession: Send + Sync {
    /// Upload a local file to `remote`
    async fn upload(&self, local: &Path, remote: &str) -> Result<()>;

    /// Download `remote` into a local file
    async fn download(&self, remote: &str, local: &Path) -> Result<()>;

    /// List a remote directory; `None` lists the working directory
    async fn list(&self, path: Option<&str>) -> Result<Vec<RemoteEntry>>;

    /// Remove a remote file
    async fn remove(&self, path: &str) -> Result<()>;

    /// Create a remote directory and its parents
    async fn ensure_dir(&self, path: &str) -> Result<()>;

    /// Remove everything inside a remote directory
    async fn clear_dir(&self, path: &str) -> Result<()>;

    /// Log out and close the control connection
    async fn close(&self);
}

/// Opens file transfer sessions for an [`FtpClient`]
#[async_trait]
pub trait FileTransferConnector: Send + Sync {
    /// Reject configurations this connector cannot serve
    fn check(&self, _config: &FtpClientConfig) -> Result<()> {
        Ok(())
    }

    /// Connect and log in
    async fn connect(&self, config: &FtpClientConfig) -> Result<Arc<dyn FileTransferSession>>;
}

/// Session transport behind [`FtpClient`]
pub struct FtpTransport {
    config: FtpClientConfig,
    connector: Option<Arc<dyn FileTransferConnector>>,
}

impl FtpTransport {
    fn connector(&self) -> Result<&Arc<dyn FileTransferConnector>> {
        self.connector
            .as_ref()
            .ok_or_else(|| AdapterError::Config("no file transfer connector registered".into()))
    }
}

#[async_trait]
impl Transport for FtpTransport {
    type Link = Arc<dyn FileTransferSession>;

    fn name(&self) -> &'static str {
        PROTOCOL
    }

    fn reconnect_interval(&self) -> Duration {
        millis(self.config.reconnect_interval_ms)
    }

    fn connect_timeout(&self) -> Duration {
        millis(self.config.timeout_ms)
    }

    async fn prepare(&self) -> Result<()> {
        let connector = self.connector()?;
        if self.config.host.is_empty() {
            return Err(AdapterError::Config("host must not be empty".into()));
        }
        connector.check(&self.config)
    }

    async fn connect(&self) -> Result<(Self::Link, InboundStream)> {
        let session = self.connector()?.connect(&self.config).await?;

        info!(
            protocol = PROTOCOL,
            "Logged in to {}:{}", self.config.host, self.config.port
        );
        Ok((session, futures::stream::pending().boxed()))
    }

    async fn close(&self, link: &Self::Link) {
        link.close().await;
        debug!(protocol = PROTOCOL, "Session closed");
    }
}

/// FTP client adapter
pub struct FtpClient {
    session: Session<FtpTransport>,
}

impl FtpClient {
    /// Create a stopped client. Without a connector, `start` fails with a
    /// configuration error.
    pub fn new(
        config: FtpClientConfig,
        pipeline: Pipeline,
        connector: Option<Arc<dyn FileTransferConnector>>,
    ) -> Self {
        Self {
            session: Session::new(FtpTransport { config, connector }, pipeline),
        }
    }

    /// Configuration the client was built with
    pub fn config(&self) -> &FtpClientConfig {
        &self.session.transport().config
    }

    fn checked<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_connection_failure() {
                self.session.report_failure(e);
            }
        }
        result
    }

    /// Upload a local file
    pub async fn upload_file(&self, local: impl AsRef<Path>, remote: &str) -> Result<()> {
        let session = self.session.link()?;
        let local = local.as_ref();
        self.checked(session.upload(local, remote).await)?;
        info!(protocol = PROTOCOL, "Uploaded {} to {}", local.display(), remote);
        Ok(())
    }

    /// Download a remote file
    pub async fn download_file(&self, remote: &str, local: impl AsRef<Path>) -> Result<()> {
        let session = self.session.link()?;
        let local = local.as_ref();
        self.checked(session.download(remote, local).await)?;
        info!(protocol = PROTOCOL, "Downloaded {} to {}", remote, local.display());
        Ok(())
    }

    /// List a remote directory
    pub async fn list_files(&self, path: Option<&str>) -> Result<Vec<RemoteEntry>> {
        let session = self.session.link()?;
        let entries = self.checked(session.list(path).await)?;
        debug!(protocol = PROTOCOL, "Listed {} entries", entries.len());
        Ok(entries)
    }

    /// Remove a remote file
    pub async fn remove_file(&self, path: &str) -> Result<()> {
        let session = self.session.link()?;
        self.checked(session.remove(path).await)?;
        info!(protocol = PROTOCOL, "Removed {}", path);
        Ok(())
    }

    /// Create a remote directory and its parents
    pub async fn ensure_dir(&self, path: &str) -> Result<()> {
        let session = self.session.link()?;
        self.checked(session.ensure_dir(path).await)
    }

    /// Remove everything inside a remote directory
    pub async fn clear_dir(&self, path: &str) -> Result<()> {
        let session = self.session.link()?;
        self.checked(session.clear_dir(path).await)?;
        info!(protocol = PROTOCOL, "Cleared {}", path);
        Ok(())
    }
}

delegate_adapter!(FtpClient);
