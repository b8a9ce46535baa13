//! Newline-delimited JSON codec for control lines.
//!
//! Each control message is one JSON value followed by `\n`. Lines longer
//! than [`MAX_LINE_LENGTH`] are rejected before parsing.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ProtocolError, Result};

/// Maximum accepted length of a control line, newline excluded.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Serialize a message into a single `\n`-terminated line.
pub fn encode_line<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(message)?;
    if line.len() > MAX_LINE_LENGTH {
        return Err(ProtocolError::LineTooLong {
            size: line.len(),
            max: MAX_LINE_LENGTH,
        });
    }
    line.push(b'\n');
    Ok(line)
}

/// Parse one line (with or without its trailing newline).
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.len() > MAX_LINE_LENGTH {
        return Err(ProtocolError::LineTooLong {
            size: trimmed.len(),
            max: MAX_LINE_LENGTH,
        });
    }
    Ok(serde_json::from_str(trimmed)?)
}
