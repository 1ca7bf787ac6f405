//! Frame reassembly for byte-stream sockets.
//!
//! [`LineDecoder`] is the per-connection frame buffer. Each read is appended
//! to it; every complete line is split off and parsed, and the trailing
//! partial line stays buffered until more bytes arrive.

use crate::codec::{parse_record_bytes, Record};
use crate::error::WireError;
use bytes::BytesMut;
use tracing::trace;

/// Record delimiter (line feed)
pub const DELIMITER: u8 = b'\n';

/// Default cap on buffered bytes that have not yet seen a delimiter (16 MiB)
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Reassembles delimited JSON records from arbitrarily chunked input
#[derive(Debug)]
pub struct LineDecoder {
    buffer: BytesMut,
    /// Bytes at the front of `buffer` already known to hold no delimiter
    scanned: usize,
    max_buffer_size: usize,
}

impl LineDecoder {
    /// Create a new decoder with the default buffer limit
    pub fn new() -> Self {
        Self::with_max_buffer_size(DEFAULT_MAX_BUFFER_SIZE)
    }

    /// Create a new decoder with a custom buffer limit
    pub fn with_max_buffer_size(max_buffer_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            scanned: 0,
            max_buffer_size,
        }
    }

    /// Append a chunk and decode every record it completes.
    ///
    /// Results come back in receipt order. A record that fails to parse is
    /// reported in place and does not affect the records around it. Blank
    /// lines are skipped silently.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<Record, WireError>> {
        self.buffer.extend_from_slice(chunk);
        let mut records = Vec::new();

        while let Some(offset) = self.buffer[self.scanned..]
            .iter()
            .position(|b| *b == DELIMITER)
        {
            let line = self.buffer.split_to(self.scanned + offset + 1);
            self.scanned = 0;

            let body = &line[..line.len() - 1];
            if body.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            records.push(parse_record_bytes(body));
        }

        // Whatever is left is an incomplete tail
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.max_buffer_size {
            let dropped = self.buffer.len();
            self.clear();
            records.push(Err(WireError::Size(dropped)));
        }

        trace!(
            "Decoded {} records, {} bytes buffered",
            records.len(),
            self.buffer.len()
        );
        records
    }

    /// Bytes received but not yet resolved into a record
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Discard any partial record
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}
