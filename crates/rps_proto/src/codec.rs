//! Record framing — length-prefixed binary records carrying UTF-8 JSON.
//!
//! Layout on the socket:
//!   [ length (4 bytes, big-endian unsigned) | record bytes ]
//!
//! The record bytes are either a plaintext handshake message (first two
//! records of a connection) or an encrypted channel record (everything
//! after). The length prefix is checked against the configured maximum
//! BEFORE the body is read, so an oversized claim never allocates.

use serde::{de::DeserializeOwned, Serialize};

use crate::frame::Frame;

/// Default maximum record size: 1 MiB.
pub const DEFAULT_MAX_RECORD_SIZE: usize = 1024 * 1024;

/// Floor for the configurable maximum — file-descriptor payloads need at
/// least this much.
pub const MIN_MAX_RECORD_SIZE: usize = 256 * 1024;

pub const LEN_PREFIX_SIZE: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Malformed pairing token: {0}")]
    TokenFormat(String),

    #[error("Pairing token expired")]
    TokenExpired,

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}

/// Clamp a configured maximum to the protocol floor.
pub fn effective_max_record_size(configured: usize) -> usize {
    configured.max(MIN_MAX_RECORD_SIZE)
}

/// Serialize a value and prepend the 4-byte length.
pub fn encode_record<T: Serialize>(value: &T, max: usize) -> Result<Vec<u8>, ProtoError> {
    let body = serde_json::to_vec(value)?;
    frame_record(&body, max)
}

/// Prepend the length prefix to pre-built record bytes (used for encrypted
/// records, whose body is ciphertext rather than JSON).
pub fn frame_record(body: &[u8], max: usize) -> Result<Vec<u8>, ProtoError> {
    let max = effective_max_record_size(max);
    if body.len() > max {
        return Err(ProtoError::FrameTooLarge { size: body.len(), max });
    }
    let mut out = Vec::with_capacity(LEN_PREFIX_SIZE + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Parse a length prefix; errors if the claimed size exceeds the maximum.
pub fn parse_len_prefix(prefix: [u8; LEN_PREFIX_SIZE], max: usize) -> Result<usize, ProtoError> {
    let size = u32::from_be_bytes(prefix) as usize;
    let max = effective_max_record_size(max);
    if size > max {
        return Err(ProtoError::FrameTooLarge { size, max });
    }
    Ok(size)
}

/// Decode record bytes as a typed value.
pub fn decode_record<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProtoError> {
    serde_json::from_slice(body).map_err(|e| ProtoError::Decode(e.to_string()))
}

/// Decode record bytes as a channel frame.
pub fn decode_frame(body: &[u8]) -> Result<Frame, ProtoError> {
    decode_record(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_decode_roundtrip() {
        let frame = Frame::Cmd { id: 7, cmd: json!({"type": "apiSendMessage"}) };
        let wire = encode_record(&frame, DEFAULT_MAX_RECORD_SIZE).unwrap();
        let len = parse_len_prefix(wire[..4].try_into().unwrap(), DEFAULT_MAX_RECORD_SIZE).unwrap();
        assert_eq!(len, wire.len() - 4);
        assert_eq!(decode_frame(&wire[4..]).unwrap(), frame);
    }

    #[test]
    fn oversize_body_is_rejected_before_framing() {
        let body = vec![0u8; MIN_MAX_RECORD_SIZE + 1];
        let err = frame_record(&body, MIN_MAX_RECORD_SIZE).unwrap_err();
        assert!(matches!(err, ProtoError::FrameTooLarge { .. }));
    }

    #[test]
    fn oversize_prefix_is_rejected_before_read() {
        let prefix = (u32::MAX).to_be_bytes();
        let err = parse_len_prefix(prefix, DEFAULT_MAX_RECORD_SIZE).unwrap_err();
        assert!(matches!(err, ProtoError::FrameTooLarge { .. }));
    }

    #[test]
    fn configured_max_never_drops_below_floor() {
        assert_eq!(effective_max_record_size(1024), MIN_MAX_RECORD_SIZE);
        assert_eq!(
            effective_max_record_size(2 * 1024 * 1024),
            2 * 1024 * 1024
        );
    }

    #[test]
    fn garbage_body_is_a_decode_error() {
        assert!(matches!(
            decode_frame(b"not json"),
            Err(ProtoError::Decode(_))
        ));
    }
}
