//! Encoding/decoding of newline-framed records

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("empty frame")]
    EmptyFrame,
}

/// Encode a record as one wire line, including the trailing newline.
pub fn encode<T: Serialize>(msg: &T) -> Result<String, CodecError> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

/// Decode one wire line into a record. Line terminators are stripped before
/// parsing; a line that is empty after stripping is an error.
pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T, CodecError> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        return Err(CodecError::EmptyFrame);
    }
    Ok(serde_json::from_str(trimmed)?)
}
