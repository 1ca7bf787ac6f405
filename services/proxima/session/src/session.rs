//! Generic connection driver shared by every adapter.
//!
//! A [`Session`] owns one [`Transport`] and runs the connection lifecycle
//! around it: connect, pump inbound traffic through the pipeline, and on any
//! failure schedule a single retry on the [`RetryTimer`].
//!
//! Every connection is tagged with a generation number. `stop()` and every
//! connection failure bump the generation, so callbacks that belong to an
//! older connection notice they are stale and only log.

use crate::error::{AdapterError, Result};
use crate::pipeline::{LastMessage, MessageStats, Pipeline, StatsSnapshot};
use crate::state::{ConnectionState, RetryTimer, DEFAULT_RECONNECT_INTERVAL};
use crate::transport::DEFAULT_CONNECT_TIMEOUT;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use proxima_wire::{parse_record_bytes, LineDecoder, Record};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// One unit of inbound traffic produced by a transport
#[derive(Debug)]
pub enum Inbound {
    /// Raw bytes from an unframed socket; reassembled into records
    Chunk(Bytes),
    /// One complete message from a framed transport
    Message {
        /// Message payload (a JSON object)
        body: Bytes,
        /// Topic the message arrived on, for broker transports
        topic: Option<String>,
        /// Channel back to the originating peer, for reply hooks
        reply: Option<mpsc::UnboundedSender<Record>>,
    },
}

impl Inbound {
    /// Complete message with no topic and no reply channel
    pub fn message(body: impl Into<Bytes>) -> Self {
        Inbound::Message {
            body: body.into(),
            topic: None,
            reply: None,
        }
    }
}

/// Inbound traffic of one connection. The stream ending, or yielding an
/// error, means the connection is gone.
pub type InboundStream = BoxStream<'static, Result<Inbound>>;

/// External transport collaborator wrapped by a [`Session`]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Handle to an established connection, used by data-plane calls
    type Link: Send + Sync + 'static;

    /// Protocol identifier used in logs and errors
    fn name(&self) -> &'static str;

    /// Delay between a failure and the next connect attempt
    fn reconnect_interval(&self) -> Duration {
        DEFAULT_RECONNECT_INTERVAL
    }

    /// Upper bound for one whole [`connect`](Transport::connect) call,
    /// handshakes included
    fn connect_timeout(&self) -> Duration {
        DEFAULT_CONNECT_TIMEOUT
    }

    /// Check configuration and load credential material before connecting.
    ///
    /// Errors here reject `start()` and are not retried.
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Establish a connection
    async fn connect(&self) -> Result<(Self::Link, InboundStream)>;

    /// Release a connection
    async fn close(&self, link: &Self::Link);
}

struct Core<L> {
    link: Option<Arc<L>>,
    pump: Option<AbortHandle>,
}

struct Shared<T: Transport> {
    transport: T,
    pipeline: Pipeline,
    timer: RetryTimer,
    generation: AtomicU64,
    state: watch::Sender<ConnectionState>,
    core: Mutex<Core<T::Link>>,
    last: LastMessage,
    stats: MessageStats,
}

impl<T: Transport> Shared<T> {
    fn protocol(&self) -> &'static str {
        self.transport.name()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(protocol = self.protocol(), "State {} -> {}", previous, state);
        }
    }
}

/// Connection lifecycle driver for one transport
pub struct Session<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Transport> Session<T> {
    /// Create a disconnected session
    pub fn new(transport: T, pipeline: Pipeline) -> Self {
        let timer = RetryTimer::new(transport.reconnect_interval());
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                transport,
                pipeline,
                timer,
                generation: AtomicU64::new(0),
                state,
                core: Mutex::new(Core {
                    link: None,
                    pump: None,
                }),
                last: LastMessage::new(),
                stats: MessageStats::default(),
            }),
        }
    }

    /// Wrapped transport
    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    /// Protocol identifier
    pub fn protocol(&self) -> &'static str {
        self.shared.protocol()
    }

    /// Begin connecting; see [`ProtocolAdapter::start`](crate::ProtocolAdapter::start)
    pub async fn start(&self) -> Result<()> {
        let protocol = self.protocol();
        let generation = {
            let _core = self.shared.core.lock();
            let state = *self.shared.state.borrow();
            match state {
                ConnectionState::Connected => {
                    info!(protocol, "Already connected; start ignored");
                    return Ok(());
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    debug!(protocol, "Start ignored while {}", state);
                    return Ok(());
                }
                ConnectionState::Disconnected => {}
            }
            self.shared.set_state(ConnectionState::Connecting);
            self.shared.generation.load(Ordering::SeqCst)
        };

        if let Err(e) = self.shared.transport.prepare().await {
            let _core = self.shared.core.lock();
            if self.shared.is_current(generation) {
                self.shared.set_state(ConnectionState::Disconnected);
            }
            return Err(e);
        }

        info!(protocol, "Starting");
        attempt(self.shared.clone(), generation).await;
        Ok(())
    }

    /// Release the connection and cancel any pending retry.
    ///
    /// After this returns no pipeline activity or retry belonging to the
    /// previous connection can take effect.
    pub async fn stop(&self) {
        let protocol = self.protocol();
        let (link, previous) = {
            let mut core = self.shared.core.lock();
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
            self.shared.timer.cancel();
            if let Some(pump) = core.pump.take() {
                pump.abort();
            }
            let previous = self.shared.state.send_replace(ConnectionState::Disconnected);
            self.shared.last.reset();
            (core.link.take(), previous)
        };

        if previous == ConnectionState::Disconnected {
            debug!(protocol, "Already stopped");
        }
        if let Some(link) = link {
            self.shared.transport.close(&link).await;
        }
        if previous != ConnectionState::Disconnected {
            info!(protocol, "Stopped");
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Whether a reconnect attempt is waiting on its delay
    pub fn retry_pending(&self) -> bool {
        self.shared.timer.is_pending()
    }

    /// Last successfully processed inbound record
    pub fn received_parsed_message(&self) -> Record {
        self.shared.last.get()
    }

    /// Counter snapshot
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Live connection handle, or `NotConnected`
    pub fn link(&self) -> Result<Arc<T::Link>> {
        let core = self.shared.core.lock();
        match (&core.link, *self.shared.state.borrow()) {
            (Some(link), ConnectionState::Connected) => Ok(link.clone()),
            _ => Err(AdapterError::NotConnected {
                protocol: self.protocol(),
            }),
        }
    }

    /// Report a failure observed by a data-plane call on the live connection
    pub fn report_failure(&self, error: &AdapterError) {
        let generation = self.shared.generation.load(Ordering::SeqCst);
        if self.state() == ConnectionState::Connected {
            connection_lost(&self.shared, generation, &error.to_string());
        }
    }

    /// Run a record obtained by a data-plane call through the pipeline.
    ///
    /// Returns the transformed record, which also becomes the last observed
    /// message.
    pub async fn process(&self, record: Record, topic: Option<&str>) -> Result<Record> {
        let generation = self.shared.generation.load(Ordering::SeqCst);
        if self.state() != ConnectionState::Connected {
            return Err(AdapterError::NotConnected {
                protocol: self.protocol(),
            });
        }
        run_pipeline(&self.shared, generation, record, topic).await
    }
}

fn attempt<T: Transport>(shared: Arc<Shared<T>>, generation: u64) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let protocol = shared.protocol();
        {
            let _core = shared.core.lock();
            if !shared.is_current(generation) {
                debug!(protocol, "Skipping connect attempt for a stopped session");
                return;
            }
            shared.set_state(ConnectionState::Connecting);
        }
        shared.stats.record_connect_attempt();

        let limit = shared.transport.connect_timeout();
        let connected = tokio::time::timeout(limit, shared.transport.connect())
            .await
            .unwrap_or_else(|_| {
                Err(AdapterError::Connection(format!(
                    "connect timed out after {:?}",
                    limit
                )))
            });

        match connected {
            Ok((link, inbound)) => {
                let link = Arc::new(link);
                let stale = {
                    let mut core = shared.core.lock();
                    if shared.is_current(generation) {
                        let pump = tokio::spawn(pump(shared.clone(), generation, inbound));
                        core.pump = Some(pump.abort_handle());
                        core.link = Some(link.clone());
                        shared.set_state(ConnectionState::Connected);
                        false
                    } else {
                        true
                    }
                };

                if stale {
                    debug!(protocol, "Connected after stop; closing");
                    shared.transport.close(&link).await;
                } else {
                    info!(protocol, "Connected");
                }
            }
            Err(e) => {
                if let AdapterError::Config(_) = e {
                    warn!(protocol, "Connect rejected: {}", e);
                }
                connection_lost(&shared, generation, &e.to_string());
            }
        }
    })
}

/// Tear down the connection of `generation` and schedule one retry
fn connection_lost<T: Transport>(shared: &Arc<Shared<T>>, generation: u64, reason: &str) {
    let protocol = shared.protocol();
    let link = {
        let mut core = shared.core.lock();
        if !shared.is_current(generation) {
            debug!(protocol, "Ignoring failure of a stale connection: {}", reason);
            return;
        }

        let next = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(pump) = core.pump.take() {
            pump.abort();
        }
        shared.set_state(ConnectionState::Reconnecting);

        if shared.timer.schedule(attempt(shared.clone(), next)) {
            warn!(
                protocol,
                "Connection failed: {}; retrying in {:?}",
                reason,
                shared.timer.interval()
            );
        }
        core.link.take()
    };

    if let Some(link) = link {
        let shared = shared.clone();
        tokio::spawn(async move {
            shared.transport.close(&link).await;
        });
    }
}

async fn pump<T: Transport>(shared: Arc<Shared<T>>, generation: u64, mut inbound: InboundStream) {
    let protocol = shared.protocol();
    let mut decoder = LineDecoder::new();

    while let Some(item) = inbound.next().await {
        match item {
            Ok(Inbound::Chunk(chunk)) => {
                for result in decoder.feed(&chunk) {
                    match result {
                        Ok(record) => {
                            let _ = run_pipeline(&shared, generation, record, None).await;
                        }
                        Err(e) => {
                            shared.stats.record_malformed();
                            warn!(protocol, "Dropping malformed record: {}", e);
                        }
                    }
                }
            }
            Ok(Inbound::Message { body, topic, reply }) => {
                let record = match parse_record_bytes(&body) {
                    Ok(record) => record,
                    Err(e) => {
                        shared.stats.record_malformed();
                        warn!(protocol, "Dropping malformed message: {}", e);
                        continue;
                    }
                };

                let Ok(processed) =
                    run_pipeline(&shared, generation, record, topic.as_deref()).await
                else {
                    continue;
                };

                if let Some(reply) = reply.filter(|_| shared.pipeline.has_receive()) {
                    match shared.pipeline.respond(processed).await {
                        Ok(Some(response)) => {
                            if reply.send(response).is_err() {
                                debug!(protocol, "Peer gone before reply");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(protocol, "Reply hook failed: {}", e),
                    }
                }
            }
            Err(e) => {
                connection_lost(&shared, generation, &e.to_string());
                return;
            }
        }
    }

    connection_lost(&shared, generation, "connection closed by peer");
}

async fn run_pipeline<T: Transport>(
    shared: &Arc<Shared<T>>,
    generation: u64,
    record: Record,
    topic: Option<&str>,
) -> Result<Record> {
    let protocol = shared.protocol();

    let processed = match shared.pipeline.process(record).await {
        Ok(processed) => processed,
        Err(e) => {
            shared.stats.record_rejected();
            warn!(protocol, "Dropping message: {}", e);
            return Err(e);
        }
    };

    if !shared
        .last
        .set_if(processed.clone(), || shared.is_current(generation))
    {
        debug!(protocol, "Ignoring message from a stale connection");
        return Err(AdapterError::NotConnected { protocol });
    }
    shared.stats.record_processed();
    debug!(protocol, "Processed message with {} fields", processed.len());

    let mut outbound = processed.clone();
    if let Some(topic) = topic {
        outbound.insert("topic".to_string(), Value::String(topic.to_string()));
    }
    if let Err(e) = shared.pipeline.deliver(outbound).await {
        warn!(protocol, "{}", e);
    }

    Ok(processed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct FakeTransport {
        failures_left: AtomicU32,
        connects: AtomicU32,
        closes: AtomicU32,
        reject_config: bool,
        hang: bool,
        feed: Mutex<Option<fmpsc::UnboundedSender<Result<Inbound>>>>,
    }

    impl FakeTransport {
        fn failing(failures: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                ..Default::default()
            }
        }

        fn push(&self, item: Inbound) {
            let feed = self.feed.lock();
            feed.as_ref().unwrap().unbounded_send(Ok(item)).unwrap();
        }

        fn hang_up(&self) {
            self.feed.lock().take();
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        type Link = ();

        fn name(&self) -> &'static str {
            "fake"
        }

        async fn prepare(&self) -> Result<()> {
            if self.reject_config {
                return Err(AdapterError::Config("certificate_path missing".into()));
            }
            Ok(())
        }

        async fn connect(&self) -> Result<((), InboundStream)> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                return futures::future::pending().await;
            }
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(AdapterError::Connection("refused".into()));
            }
            let (tx, rx) = fmpsc::unbounded();
            *self.feed.lock() = Some(tx);
            Ok(((), rx.boxed()))
        }

        async fn close(&self, _link: &()) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_idempotent_start() {
        let session = Session::new(FakeTransport::default(), Pipeline::new());

        session.start().await.unwrap();
        session.start().await.unwrap();

        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(session.transport().connects.load(Ordering::SeqCst), 1);
        assert!(session.link().is_ok());
    }

    #[tokio::test]
    async fn test_idempotent_stop() {
        let session = Session::new(FakeTransport::default(), Pipeline::new());

        session.stop().await;
        assert_eq!(session.transport().closes.load(Ordering::SeqCst), 0);

        session.start().await.unwrap();
        session.stop().await;
        session.stop().await;

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.transport().closes.load(Ordering::SeqCst), 1);
        assert!(matches!(
            session.link(),
            Err(AdapterError::NotConnected { protocol: "fake" })
        ));
    }

    #[tokio::test]
    async fn test_config_error_rejects_start() {
        let transport = FakeTransport {
            reject_config: true,
            ..Default::default()
        };
        let session = Session::new(transport, Pipeline::new());

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, AdapterError::Config(_)));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.transport().connects.load(Ordering::SeqCst), 0);
        assert!(!session.retry_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_pending_retry_across_failures() {
        let session = Session::new(FakeTransport::failing(3), Pipeline::new());

        session.start().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Reconnecting);
        assert!(session.retry_pending());

        // Extra failure reports while retrying schedule nothing new
        session.report_failure(&AdapterError::Connection("again".into()));
        assert_eq!(session.transport().connects.load(Ordering::SeqCst), 1);

        for expected in 2..=4 {
            tokio::time::sleep(Duration::from_millis(5001)).await;
            settle().await;
            assert_eq!(
                session.transport().connects.load(Ordering::SeqCst),
                expected
            );
        }

        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(!session.retry_pending());
        assert_eq!(session.stats().connect_attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_connect_times_out() {
        let transport = FakeTransport {
            hang: true,
            ..Default::default()
        };
        let session = Session::new(transport, Pipeline::new());

        let started = tokio::time::Instant::now();
        session.start().await.unwrap();
        assert!(started.elapsed() >= DEFAULT_CONNECT_TIMEOUT);
        assert!(started.elapsed() < DEFAULT_CONNECT_TIMEOUT + Duration::from_secs(1));
        assert_eq!(session.state(), ConnectionState::Reconnecting);
        assert!(session.retry_pending());

        session.stop().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_retry() {
        let session = Session::new(FakeTransport::failing(1), Pipeline::new());

        session.start().await.unwrap();
        assert!(session.retry_pending());
        session.stop().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(session.transport().connects.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_close_reconnects() {
        let session = Session::new(FakeTransport::default(), Pipeline::new());
        session.start().await.unwrap();

        session.transport().hang_up();
        settle().await;
        assert_eq!(session.state(), ConnectionState::Reconnecting);
        assert_eq!(session.transport().closes.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(5001)).await;
        settle().await;
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(session.transport().connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stream_reframing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pipeline = Pipeline::new().with_deliver(move |r: Record| {
            let tx = tx.clone();
            async move {
                tx.send(r)?;
                Ok(())
            }
        });
        let session = Session::new(FakeTransport::default(), pipeline);
        session.start().await.unwrap();

        session
            .transport()
            .push(Inbound::Chunk(Bytes::from_static(b"{\"a\":1}\n{\"a\"")));
        session
            .transport()
            .push(Inbound::Chunk(Bytes::from_static(b":2}\n")));

        assert_eq!(rx.recv().await.unwrap(), record(json!({"a": 1})));
        assert_eq!(rx.recv().await.unwrap(), record(json!({"a": 2})));
        assert_eq!(session.received_parsed_message(), record(json!({"a": 2})));
        assert_eq!(session.stats().pipeline_runs(), 2);
    }

    #[tokio::test]
    async fn test_unterminated_record_not_processed() {
        let session = Session::new(FakeTransport::default(), Pipeline::new());
        session.start().await.unwrap();

        session
            .transport()
            .push(Inbound::Chunk(Bytes::from_static(b"{\"a\":1")));
        settle().await;

        assert!(session.received_parsed_message().is_empty());
        assert_eq!(session.stats().pipeline_runs(), 0);
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_malformed_line_isolated() {
        let session = Session::new(FakeTransport::default(), Pipeline::new());
        session.start().await.unwrap();

        session
            .transport()
            .push(Inbound::Chunk(Bytes::from_static(b"not json\n{\"b\":1}\n")));
        settle().await;

        let stats = session.stats();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.processed, 1);
        assert_eq!(session.received_parsed_message(), record(json!({"b": 1})));
    }

    #[tokio::test]
    async fn test_rejected_message_keeps_last_value() {
        let pipeline = Pipeline::new().with_validate(|r: Record| async move {
            anyhow::ensure!(r.contains_key("id"), "missing id");
            Ok(())
        });
        let session = Session::new(FakeTransport::default(), pipeline);
        session.start().await.unwrap();

        session.transport().push(Inbound::message(&b"{\"id\":1}"[..]));
        session.transport().push(Inbound::message(&b"{\"x\":2}"[..]));
        settle().await;

        assert_eq!(session.received_parsed_message(), record(json!({"id": 1})));
        assert_eq!(session.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_topic_tagging_and_reply() {
        let (deliver_tx, mut delivered) = mpsc::unbounded_channel();
        let pipeline = Pipeline::new()
            .with_deliver(move |r: Record| {
                let tx = deliver_tx.clone();
                async move {
                    tx.send(r)?;
                    Ok(())
                }
            })
            .with_receive(|mut r: Record| async move {
                r.insert("ack".into(), json!(true));
                Ok(r)
            });
        let session = Session::new(FakeTransport::default(), pipeline);
        session.start().await.unwrap();

        let (reply_tx, mut replies) = mpsc::unbounded_channel();
        session.transport().push(Inbound::Message {
            body: Bytes::from_static(b"{\"n\":1}"),
            topic: Some("sensors".into()),
            reply: Some(reply_tx),
        });

        let out = delivered.recv().await.unwrap();
        assert_eq!(out, record(json!({"n": 1, "topic": "sensors"})));
        assert_eq!(session.received_parsed_message(), record(json!({"n": 1})));
        assert_eq!(
            replies.recv().await.unwrap(),
            record(json!({"n": 1, "ack": true}))
        );
    }

    #[tokio::test]
    async fn test_no_pipeline_after_stop() {
        let session = Session::new(FakeTransport::default(), Pipeline::new());
        session.start().await.unwrap();
        let feed = session.transport().feed.lock().clone().unwrap();

        session.stop().await;
        let _ = feed.unbounded_send(Ok(Inbound::message(&b"{\"late\":true}"[..])));
        settle().await;

        assert!(session.received_parsed_message().is_empty());
        assert_eq!(session.stats().pipeline_runs(), 0);
    }

    #[tokio::test]
    async fn test_process_requires_connection() {
        let session = Session::new(FakeTransport::default(), Pipeline::new());
        let err = session.process(Record::new(), None).await.unwrap_err();
        assert!(matches!(err, AdapterError::NotConnected { .. }));

        session.start().await.unwrap();
        let out = session
            .process(record(json!({"r": 1})), None)
            .await
            .unwrap();
        assert_eq!(out, record(json!({"r": 1})));
        assert_eq!(session.received_parsed_message(), out);
    }
}
