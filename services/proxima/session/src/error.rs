//! Adapter error taxonomy.

use proxima_wire::WireError;
use thiserror::Error;

/// Errors raised by protocol adapters
///
/// Connection errors never leave an adapter's lifecycle calls; they feed the
/// reconnection state machine instead. Config errors reject `start()`.
/// `NotConnected`, `Request` and `RetriesExhausted` are returned to whoever
/// invoked a data-plane operation. Validation, transform, parse and delivery
/// errors are isolated to a single message.
#[derive(Error, Debug)]
pub enum AdapterError {
    /// Transport connect, read, or write failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Missing or unusable configuration or credential material
    #[error("configuration error: {0}")]
    Config(String),

    /// Data-plane operation invoked while not connected
    #[error("{protocol} is not connected")]
    NotConnected {
        /// Protocol identifier of the adapter
        protocol: &'static str,
    },

    /// Validate hook rejected a message
    #[error("validation failed: {0}")]
    Validation(String),

    /// Transform hook failed
    #[error("transform failed: {0}")]
    Transform(String),

    /// Inbound payload could not be parsed into a record
    #[error("malformed record: {0}")]
    Parse(#[from] WireError),

    /// Deliver or reply hook failed
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// Single request attempt failed
    #[error("request failed: {0}")]
    Request(String),

    /// Bounded retries of a request exhausted
    #[error("request failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error from the final attempt
        last_error: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    /// Whether this error should trigger the reconnection state machine
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, AdapterError::Connection(_) | AdapterError::Io(_))
    }
}

/// Result alias for adapter operations
pub type Result<T> = std::result::Result<T, AdapterError>;
