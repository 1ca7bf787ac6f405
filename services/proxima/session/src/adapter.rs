//! The lifecycle contract every protocol adapter implements.

use crate::error::Result;
use crate::pipeline::StatsSnapshot;
use crate::state::ConnectionState;
use async_trait::async_trait;
use proxima_wire::Record;

/// Uniform lifecycle surface the controller drives
///
/// `start` and `stop` are idempotent and safe to call blindly. Transport
/// specific data-plane calls live on the concrete adapter types and fail
/// with [`AdapterError::NotConnected`](crate::AdapterError::NotConnected)
/// unless the adapter is connected.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// Protocol identifier, e.g. `tcp_client`
    fn protocol(&self) -> &'static str;

    /// Begin connecting.
    ///
    /// Returns once the first attempt has either connected or scheduled a
    /// retry. Only configuration problems are returned as errors; transient
    /// connection failures are retried internally.
    async fn start(&self) -> Result<()>;

    /// Release the connection and cancel any pending retry
    async fn stop(&self);

    /// Current connection state
    fn state(&self) -> ConnectionState;

    /// Last successfully processed inbound record
    fn received_parsed_message(&self) -> Record;

    /// Message and connection counters
    fn stats(&self) -> StatsSnapshot;
}
