//! Adapter lifecycle, reconnection and data pipeline for proxima.
//!
//! Every protocol adapter is built from the same parts:
//!
//! - **[`ProtocolAdapter`]**: the lifecycle contract the controller drives
//! - **[`Session`]**: generic driver that connects a [`Transport`], pumps
//!   inbound traffic through the pipeline, and reconnects on failure
//! - **[`RetryTimer`]**: fixed-delay, single-flight reconnect timer
//! - **[`Pipeline`]**: validate, transform, deliver and reply hooks
//! - **[`RetryPolicy`]**: bounded retries for request/response calls
//! - **[`IoStream`]** and [`tls`]: plain and TLS socket plumbing
//!
//! ## Example
//!
//! ```rust,no_run
//! use proxima_session::{Inbound, InboundStream, Pipeline, Result, Session, Transport};
//! use async_trait::async_trait;
//! use futures::StreamExt;
//!
//! struct Loopback;
//!
//! #[async_trait]
//! impl Transport for Loopback {
//!     type Link = ();
//!
//!     fn name(&self) -> &'static str {
//!         "loopback"
//!     }
//!
//!     async fn connect(&self) -> Result<((), InboundStream)> {
//!         let chunks = futures::stream::iter(vec![Ok(Inbound::Chunk("{\"a\":1}\n".into()))]);
//!         Ok(((), chunks.chain(futures::stream::pending()).boxed()))
//!     }
//!
//!     async fn close(&self, _link: &()) {}
//! }
//!
//! # async fn example() -> Result<()> {
//! let pipeline = Pipeline::new().with_deliver(|record| async move {
//!     println!("received {:?}", record);
//!     Ok(())
//! });
//! let session = Session::new(Loopback, pipeline);
//! session.start().await?;
//! session.stop().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod error;
pub mod pipeline;
pub mod retry;
pub mod session;
pub mod state;
pub mod transport;

// Re-export main types
pub use adapter::ProtocolAdapter;
pub use error::{AdapterError, Result};
pub use pipeline::{HookFuture, LastMessage, MessageStats, Pipeline, StatsSnapshot};
pub use retry::{RetryPolicy, DEFAULT_ATTEMPTS, DEFAULT_RETRY_DELAY};
pub use session::{Inbound, InboundStream, Session, Transport};
pub use state::{ConnectionState, RetryTimer, DEFAULT_RECONNECT_INTERVAL};
pub use transport::{connect_tcp, tls, IoStream, SocketOptions, DEFAULT_CONNECT_TIMEOUT};
