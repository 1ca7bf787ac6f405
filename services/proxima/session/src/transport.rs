//! TCP and TLS plumbing shared by the socket adapters.
//!
//! [`IoStream`] unifies plain and TLS streams so the WebSocket adapters can
//! run the same code either way. The [`tls`] module turns PEM files into
//! rustls configurations; missing or unreadable material is a configuration
//! error, never a connection error.

use crate::error::{AdapterError, Result};
use socket2::SockRef;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

/// Default timeout for establishing a TCP connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Unified stream type that can be either plain TCP or TLS
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS stream accepted by a server
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    /// TLS stream opened by a client
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Socket options applied to outgoing TCP connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    /// Set `TCP_NODELAY`
    pub no_delay: bool,
    /// Set `SO_KEEPALIVE`
    pub keep_alive: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            no_delay: true,
            keep_alive: true,
        }
    }
}

/// Open a TCP connection and apply `options`
pub async fn connect_tcp(
    host: &str,
    port: u16,
    timeout: Duration,
    options: SocketOptions,
) -> Result<TcpStream> {
    let target = format!("{}:{}", host, port);
    let stream = tokio::time::timeout(timeout, TcpStream::connect(&target))
        .await
        .map_err(|_| {
            AdapterError::Connection(format!("connect to {} timed out after {:?}", target, timeout))
        })?
        .map_err(|e| AdapterError::Connection(format!("connect to {}: {}", target, e)))?;

    stream.set_nodelay(options.no_delay)?;
    SockRef::from(&stream).set_keepalive(options.keep_alive)?;
    debug!("TCP connection established to {} ({:?})", target, options);
    Ok(stream)
}

/// TLS configuration loading and handshakes
pub mod tls {
    use super::*;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore, ServerConfig};
    use std::io::BufReader;
    use std::path::Path;
    use std::sync::Arc;
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    fn install_provider() {
        // Fails only when a provider is already installed
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    async fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
        tokio::fs::read(path).await.map_err(|e| {
            AdapterError::Config(format!("cannot read {} {}: {}", what, path.display(), e))
        })
    }

    /// Load every certificate in a PEM file
    pub async fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
        let pem = read_pem(path, "certificate").await?;
        let certs = rustls_pemfile::certs(&mut BufReader::new(pem.as_slice()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| {
                AdapterError::Config(format!("invalid certificate {}: {}", path.display(), e))
            })?;

        if certs.is_empty() {
            return Err(AdapterError::Config(format!(
                "no certificates found in {}",
                path.display()
            )));
        }
        Ok(certs)
    }

    /// Load the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM file
    pub async fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
        let pem = read_pem(path, "private key").await?;
        rustls_pemfile::private_key(&mut BufReader::new(pem.as_slice()))
            .map_err(|e| {
                AdapterError::Config(format!("invalid private key {}: {}", path.display(), e))
            })?
            .ok_or_else(|| {
                AdapterError::Config(format!("no private key found in {}", path.display()))
            })
    }

    /// Server configuration from a certificate chain and private key
    pub async fn server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
        install_provider();
        let certs = load_certs(cert_path).await?;
        let key = load_private_key(key_path).await?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| AdapterError::Config(format!("server certificate rejected: {}", e)))?;

        debug!("TLS server configuration loaded from {}", cert_path.display());
        Ok(Arc::new(config))
    }

    /// Client configuration trusting the CA certificates in `ca_path`
    pub async fn client_config(ca_path: &Path) -> Result<Arc<ClientConfig>> {
        install_provider();
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_path).await? {
            roots.add(cert).map_err(|e| {
                AdapterError::Config(format!("CA certificate rejected: {}", e))
            })?;
        }

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        debug!("TLS client configuration loaded from {}", ca_path.display());
        Ok(Arc::new(config))
    }

    /// Run the server side of a TLS handshake
    pub async fn accept_tls(config: Arc<ServerConfig>, tcp_stream: TcpStream) -> Result<IoStream> {
        let peer = tcp_stream.peer_addr()?;
        let stream = TlsAcceptor::from(config)
            .accept(tcp_stream)
            .await
            .map_err(|e| AdapterError::Connection(format!("TLS handshake with {}: {}", peer, e)))?;

        debug!("TLS connection accepted from {}", peer);
        Ok(IoStream::Tls(Box::new(stream)))
    }

    /// Run the client side of a TLS handshake
    pub async fn connect_tls(
        config: Arc<ClientConfig>,
        tcp_stream: TcpStream,
        sni: &str,
    ) -> Result<IoStream> {
        let server_name = ServerName::try_from(sni.to_owned())
            .map_err(|_| AdapterError::Config(format!("invalid server name: {}", sni)))?;

        let stream = TlsConnector::from(config)
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| AdapterError::Connection(format!("TLS handshake with {}: {}", sni, e)))?;

        debug!("TLS connection established (SNI: {})", sni);
        Ok(IoStream::TlsClient(Box::new(stream)))
    }
}
