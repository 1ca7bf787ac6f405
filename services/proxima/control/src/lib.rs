//! Desired-state reconciliation for proxima.
//!
//! The [`Controller`] owns every live protocol adapter. Callers declare which
//! protocols should run ([`DesiredState`]) and how each is configured
//! ([`ConfigBundle`]); each reconcile tick stops, restarts or starts adapters
//! until the live set matches. Adapters are built by the [`Registry`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bundle;
pub mod controller;
pub mod error;
pub mod protocol;
pub mod registry;

pub use bundle::{ConfigBundle, ProtocolConfig, ProtocolConfigs, DEFAULT_RECONCILE_INTERVAL_MS};
pub use controller::{Controller, ReconcileReport, START_TIMEOUT, STOP_TIMEOUT};
pub use error::{ControlError, Result};
pub use protocol::{DesiredState, ProtocolId};
pub use registry::{Adapter, AdapterFactory, Registry};
