//! Wire framing error types.

use thiserror::Error;

/// Framing and record decoding errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Record bytes are not valid UTF-8
    #[error("record is not valid utf-8")]
    Utf8(#[from] std::str::Utf8Error),

    /// Record is not valid JSON
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),

    /// Record parsed, but is not a JSON object
    #[error("record is not a json object (got {0})")]
    NotAnObject(&'static str),

    /// Unterminated data grew past the buffer limit
    #[error("buffer limit exceeded: {0} bytes without a delimiter")]
    Size(usize),
}
