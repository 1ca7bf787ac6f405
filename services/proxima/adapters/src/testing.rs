//! Fixtures shared by the adapter tests.

use parking_lot::Mutex;
use proxima_session::Pipeline;
use proxima_wire::Record;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

pub(crate) fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap()
}

/// Pipeline whose deliver hook forwards every record to the returned channel
pub(crate) fn collecting_pipeline() -> (Pipeline, mpsc::UnboundedReceiver<Record>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pipeline = Pipeline::new().with_deliver(move |r: Record| {
        let tx = tx.clone();
        async move {
            tx.send(r)?;
            Ok(())
        }
    });
    (pipeline, rx)
}

/// Receive the next record or panic after a few seconds
pub(crate) async fn next_record(rx: &mut mpsc::UnboundedReceiver<Record>) -> Record {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a record")
        .expect("pipeline channel closed")
}

/// Poll `condition` until it holds or panic after a few seconds
pub(crate) async fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Listener that accepts connections and then never reads or writes
pub(crate) struct SilentListener {
    pub addr: SocketAddr,
    held: Arc<Mutex<Vec<tokio::net::TcpStream>>>,
}

impl SilentListener {
    /// Connections accepted so far
    pub(crate) fn accepted(&self) -> usize {
        self.held.lock().len()
    }
}

pub(crate) async fn silent_listener() -> SilentListener {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let held = Arc::new(Mutex::new(Vec::new()));
    let sockets = held.clone();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            sockets.lock().push(socket);
        }
    });

    SilentListener { addr, held }
}

/// Minimal HTTP/1.1 server answering each connection with the next canned
/// response (the last one repeats)
pub(crate) struct HttpStub {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<String>>>,
}

impl HttpStub {
    pub(crate) fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

pub(crate) async fn http_stub(responses: Vec<(u16, &'static str)>) -> HttpStub {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = requests.clone();

    tokio::spawn(async move {
        let mut served = 0usize;
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let (status, body) = responses[served.min(responses.len() - 1)];
            served += 1;

            let request = read_request(&mut socket).await;
            seen.lock().push(request);

            let response = format!(
                "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    HttpStub { addr, requests }
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    let header_end = loop {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            return String::from_utf8_lossy(&buf).into_owned();
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_lowercase();
    let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    String::from_utf8_lossy(&buf).into_owned()
}
