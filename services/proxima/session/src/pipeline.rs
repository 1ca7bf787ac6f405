//! Data pipeline applied to every inbound message.
//!
//! Order is fixed: validate, transform, observable update, deliver. A
//! validate or transform failure drops the message without touching the
//! observable state. A deliver failure is reported but the observable update
//! stands.

use crate::error::AdapterError;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use proxima_wire::Record;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Future returned by a pipeline hook
pub type HookFuture<T> = BoxFuture<'static, anyhow::Result<T>>;

type Hook<T> = Arc<dyn Fn(Record) -> HookFuture<T> + Send + Sync>;

fn boxed<F, Fut, T>(f: F) -> Hook<T>
where
    F: Fn(Record) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    Arc::new(move |record| Box::pin(f(record)))
}

/// Optional hook chain shared by all adapters
///
/// Every hook is independently optional. A missing validate or deliver hook
/// is a no-op, a missing transform passes the record through unchanged.
#[derive(Clone, Default)]
pub struct Pipeline {
    validate: Option<Hook<()>>,
    transform: Option<Hook<Record>>,
    deliver: Option<Hook<()>>,
    receive: Option<Hook<Record>>,
}

impl Pipeline {
    /// Empty pipeline (records pass through, nothing is delivered)
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the validate hook
    pub fn with_validate<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Record) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.validate = Some(boxed(f));
        self
    }

    /// Set the transform hook
    pub fn with_transform<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Record) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Record>> + Send + 'static,
    {
        self.transform = Some(boxed(f));
        self
    }

    /// Set the deliver hook, which forwards processed records downstream
    pub fn with_deliver<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Record) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.deliver = Some(boxed(f));
        self
    }

    /// Set the receive hook, which builds a reply for the originating peer
    pub fn with_receive<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Record) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Record>> + Send + 'static,
    {
        self.receive = Some(boxed(f));
        self
    }

    /// Validate and transform a record
    pub async fn process(&self, record: Record) -> Result<Record, AdapterError> {
        if let Some(validate) = &self.validate {
            validate(record.clone())
                .await
                .map_err(|e| AdapterError::Validation(format!("{:#}", e)))?;
        }

        match &self.transform {
            Some(transform) => transform(record)
                .await
                .map_err(|e| AdapterError::Transform(format!("{:#}", e))),
            None => Ok(record),
        }
    }

    /// Hand a processed record to the deliver hook
    pub async fn deliver(&self, record: Record) -> Result<(), AdapterError> {
        if let Some(deliver) = &self.deliver {
            deliver(record)
                .await
                .map_err(|e| AdapterError::Delivery(format!("{:#}", e)))?;
        }
        Ok(())
    }

    /// Build a reply for a processed record, if a receive hook is set
    pub async fn respond(&self, record: Record) -> Result<Option<Record>, AdapterError> {
        match &self.receive {
            Some(receive) => receive(record)
                .await
                .map(Some)
                .map_err(|e| AdapterError::Delivery(format!("{:#}", e))),
            None => Ok(None),
        }
    }

    /// Whether a receive hook is set
    pub fn has_receive(&self) -> bool {
        self.receive.is_some()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("validate", &self.validate.is_some())
            .field("transform", &self.transform.is_some())
            .field("deliver", &self.deliver.is_some())
            .field("receive", &self.receive.is_some())
            .finish()
    }
}

/// Last successfully processed inbound record of one adapter
#[derive(Clone, Debug, Default)]
pub struct LastMessage(Arc<RwLock<Record>>);

impl LastMessage {
    /// Create an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value (empty record if nothing was processed yet)
    pub fn get(&self) -> Record {
        self.0.read().clone()
    }

    /// Overwrite the value if `is_current` still holds under the write lock
    pub fn set_if(&self, record: Record, is_current: impl FnOnce() -> bool) -> bool {
        let mut slot = self.0.write();
        if !is_current() {
            return false;
        }
        *slot = record;
        true
    }

    /// Reset to the empty record
    pub fn reset(&self) {
        self.0.write().clear();
    }
}

/// Message counters kept per adapter
#[derive(Debug, Default)]
pub struct MessageStats {
    processed: AtomicU64,
    rejected: AtomicU64,
    malformed: AtomicU64,
    connect_attempts: AtomicU64,
}

/// Point-in-time copy of [`MessageStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Messages that passed validate and transform
    pub processed: u64,
    /// Messages dropped by validate or transform
    pub rejected: u64,
    /// Payloads that failed to parse into a record
    pub malformed: u64,
    /// Connection attempts made
    pub connect_attempts: u64,
}

impl StatsSnapshot {
    /// Number of pipeline invocations (processed plus rejected)
    pub fn pipeline_runs(&self) -> u64 {
        self.processed + self.rejected
    }
}

impl MessageStats {
    pub(crate) fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
        }
    }
}
