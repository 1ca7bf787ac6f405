//! Plain FTP sessions built on `suppaftp`.
//!
//! The control connection is blocking, so every call runs on the blocking
//! pool with the stream behind a mutex. Replies outside the expected status
//! become request errors; socket failures become connection errors.

use super::{FileTransferConnector, FileTransferSession, FtpClientConfig, RemoteEntry, PROTOCOL};
use crate::config::millis;
use async_trait::async_trait;
use parking_lot::Mutex;
use proxima_session::{AdapterError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use suppaftp::list::File as ListedFile;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};
use tracing::debug;

const ANONYMOUS: &str = "anonymous";

fn ftp_error(context: &str, e: FtpError) -> AdapterError {
    match e {
        FtpError::ConnectionError(e) => AdapterError::Connection(format!("{}: {}", context, e)),
        other => AdapterError::Request(format!("{}: {}", context, other)),
    }
}

fn local_error(path: &Path, e: std::io::Error) -> AdapterError {
    AdapterError::Request(format!("{}: {}", path.display(), e))
}

fn worker_error(e: tokio::task::JoinError) -> AdapterError {
    AdapterError::Connection(format!("ftp worker failed: {}", e))
}

fn child_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

/// Parse `LIST` output, skipping lines in an unknown format
fn parse_listing(lines: Vec<String>) -> Vec<RemoteEntry> {
    lines
        .iter()
        .filter_map(|line| match line.parse::<ListedFile>() {
            Ok(file) => Some(file),
            Err(e) => {
                debug!(protocol = PROTOCOL, "Skipping listing line {:?}: {}", line, e);
                None
            }
        })
        .filter(|file| !matches!(file.name(), "." | ".."))
        .map(|file| RemoteEntry {
            name: file.name().to_string(),
            size: file.size() as u64,
            is_dir: file.is_directory(),
        })
        .collect()
}

fn clear(ftp: &mut FtpStream, dir: &str) -> Result<()> {
    let listing = ftp
        .list(Some(dir))
        .map_err(|e| ftp_error(&format!("LIST {}", dir), e))?;
    for entry in parse_listing(listing) {
        let child = child_path(dir, &entry.name);
        if entry.is_dir {
            clear(ftp, &child)?;
            ftp.rmdir(&child)
                .map_err(|e| ftp_error(&format!("RMD {}", child), e))?;
        } else {
            ftp.rm(&child)
                .map_err(|e| ftp_error(&format!("DELE {}", child), e))?;
        }
    }
    Ok(())
}

fn ensure_dir(ftp: &mut FtpStream, path: &str) -> Result<()> {
    let mut prefix = String::from(if path.starts_with('/') { "/" } else { "" });
    for part in path.split('/').filter(|part| !part.is_empty()) {
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        prefix.push_str(part);
        match ftp.mkdir(&prefix) {
            Ok(()) => debug!(protocol = PROTOCOL, "Created {}", prefix),
            // Usually "550 exists"; the CWD below settles it
            Err(FtpError::UnexpectedResponse(_)) => {}
            Err(e) => return Err(ftp_error(&format!("MKD {}", prefix), e)),
        }
    }

    let home = ftp.pwd().map_err(|e| ftp_error("PWD", e))?;
    ftp.cwd(path)
        .map_err(|e| ftp_error(&format!("CWD {}", path), e))?;
    ftp.cwd(&home)
        .map_err(|e| ftp_error(&format!("CWD {}", home), e))
}

/// [`FileTransferConnector`] for plain FTP through `suppaftp`
#[derive(Debug, Default, Clone, Copy)]
pub struct SuppaFtpConnector;

impl SuppaFtpConnector {
    /// Create a connector
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileTransferConnector for SuppaFtpConnector {
    fn check(&self, config: &FtpClientConfig) -> Result<()> {
        if config.secure {
            return Err(AdapterError::Config(
                "explicit TLS is not supported by the FTP connector".into(),
            ));
        }
        Ok(())
    }

    async fn connect(&self, config: &FtpClientConfig) -> Result<Arc<dyn FileTransferSession>> {
        let addr = tokio::net::lookup_host((config.host.as_str(), config.port))
            .await
            .map_err(|e| AdapterError::Connection(format!("resolve {}: {}", config.host, e)))?
            .next()
            .ok_or_else(|| AdapterError::Connection(format!("{} has no address", config.host)))?;

        let timeout = millis(config.timeout_ms);
        let user = config.user.clone().unwrap_or_else(|| ANONYMOUS.to_string());
        let password = config.password.clone().unwrap_or_default();

        let stream = tokio::task::spawn_blocking(move || -> Result<FtpStream> {
            let mut ftp =
                FtpStream::connect_timeout(addr, timeout).map_err(|e| ftp_error("connect", e))?;
            let socket = ftp.get_ref();
            socket
                .set_read_timeout(Some(timeout))
                .and_then(|_| socket.set_write_timeout(Some(timeout)))
                .map_err(|e| AdapterError::Connection(format!("socket timeouts: {}", e)))?;
            ftp.login(user.as_str(), password.as_str())
                .map_err(|e| AdapterError::Connection(format!("login as {}: {}", user, e)))?;
            ftp.transfer_type(FileType::Binary)
                .map_err(|e| ftp_error("TYPE", e))?;
            Ok(ftp)
        })
        .await
        .map_err(worker_error)??;

        Ok(Arc::new(SuppaFtpSession {
            stream: Arc::new(Mutex::new(Some(stream))),
        }))
    }
}

/// Logged-in control connection
struct SuppaFtpSession {
    stream: Arc<Mutex<Option<FtpStream>>>,
}

impl SuppaFtpSession {
    /// Run `op` on the blocking pool against the open stream
    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> Result<T> + Send + 'static,
    {
        let stream = self.stream.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = stream.lock();
            let ftp = guard
                .as_mut()
                .ok_or_else(|| AdapterError::Connection("session closed".into()))?;
            op(ftp)
        })
        .await
        .map_err(worker_error)?
    }
}

#[async_trait]
impl FileTransferSession for SuppaFtpSession {
    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let local = local.to_path_buf();
        let remote = remote.to_string();
        self.run(move |ftp| {
            let mut file = std::fs::File::open(&local).map_err(|e| local_error(&local, e))?;
            ftp.put_file(remote.as_str(), &mut file)
                .map_err(|e| ftp_error(&format!("STOR {}", remote), e))?;
            Ok(())
        })
        .await
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        let remote = remote.to_string();
        let local: PathBuf = local.to_path_buf();
        self.run(move |ftp| {
            let buffer = ftp
                .retr_as_buffer(&remote)
                .map_err(|e| ftp_error(&format!("RETR {}", remote), e))?;
            std::fs::write(&local, buffer.into_inner()).map_err(|e| local_error(&local, e))
        })
        .await
    }

    async fn list(&self, path: Option<&str>) -> Result<Vec<RemoteEntry>> {
        let path = path.map(str::to_string);
        self.run(move |ftp| {
            let lines = ftp
                .list(path.as_deref())
                .map_err(|e| ftp_error("LIST", e))?;
            Ok(parse_listing(lines))
        })
        .await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let path = path.to_string();
        self.run(move |ftp| {
            ftp.rm(&path)
                .map_err(|e| ftp_error(&format!("DELE {}", path), e))
        })
        .await
    }

    async fn ensure_dir(&self, path: &str) -> Result<()> {
        let path = path.to_string();
        self.run(move |ftp| ensure_dir(ftp, &path)).await
    }

    async fn clear_dir(&self, path: &str) -> Result<()> {
        let path = path.to_string();
        self.run(move |ftp| clear(ftp, &path)).await
    }

    async fn close(&self) {
        let Some(mut ftp) = self.stream.lock().take() else {
            return;
        };
        let quit = tokio::task::spawn_blocking(move || ftp.quit()).await;
        match quit {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(protocol = PROTOCOL, "QUIT failed: {}", e),
            Err(e) => debug!(protocol = PROTOCOL, "QUIT worker failed: {}", e),
        }
    }
}
