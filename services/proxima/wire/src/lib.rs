//! Line-delimited JSON record framing for proxima.
//!
//! The stream and datagram socket adapters exchange application messages as
//! UTF-8 JSON objects, one per line. Nothing else on those sockets marks a
//! message boundary, so the receiving side keeps a per-connection buffer and
//! reassembles records out of whatever chunks the socket hands it.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------------+------+----------------------------+------+
//! | compact JSON object (UTF-8)| 0x0A | compact JSON object (UTF-8)| 0x0A | ...
//! +----------------------------+------+----------------------------+------+
//! ```
//!
//! A record never contains a raw line feed: compact JSON escapes control
//! characters inside strings, and the encoder never pretty-prints.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;

pub use codec::{encode_record, parse_record, parse_record_bytes, Record};
pub use error::WireError;
pub use frame::{LineDecoder, DEFAULT_MAX_BUFFER_SIZE, DELIMITER};
