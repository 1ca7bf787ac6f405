//! Controller error types.

use crate::protocol::ProtocolId;
use proxima_session::AdapterError;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while reconciling one protocol
#[derive(Error, Debug)]
pub enum ControlError {
    /// Identifier does not name a known protocol
    #[error("unknown protocol identifier: {0}")]
    UnknownProtocol(String),

    /// Protocol is desired but the bundle has no configuration for it
    #[error("no configuration for {0}")]
    MissingConfig(ProtocolId),

    /// Factory could not build the adapter
    #[error("cannot build {protocol}: {reason}")]
    Factory {
        /// Protocol being built
        protocol: ProtocolId,
        /// Factory failure
        reason: String,
    },

    /// Adapter rejected `start`
    #[error("{protocol} failed to start: {source}")]
    Start {
        /// Protocol being started
        protocol: ProtocolId,
        /// Start failure
        #[source]
        source: AdapterError,
    },

    /// Adapter did not finish `start` in time
    #[error("{protocol} did not start within {after:?}")]
    StartTimeout {
        /// Protocol being started
        protocol: ProtocolId,
        /// Limit that elapsed
        after: Duration,
    },
}

/// Result alias for controller operations
pub type Result<T> = std::result::Result<T, ControlError>;
