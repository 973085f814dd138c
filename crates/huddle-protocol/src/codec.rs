//! Codec for encoding and decoding Huddle frames.
//!
//! Frames travel as JSON text. Inbound frames are size-checked before
//! parsing so an oversized payload never reaches the deserializer.

use thiserror::Error;

use crate::frames::{InboundFrame, OutboundFrame};

/// Default maximum inbound frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// JSON encoding or decoding error.
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode an inbound frame using the default size limit.
///
/// # Errors
///
/// Returns an error if the data is too large or not a valid frame.
pub fn decode_inbound(data: &[u8]) -> Result<InboundFrame, ProtocolError> {
    FrameCodec::default().decode_inbound(data)
}

/// Encode an outbound frame to JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_outbound(frame: &OutboundFrame) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

/// Frame codec with a configurable inbound size limit.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    /// Create a codec that rejects inbound frames larger than `max_frame_size`.
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// The inbound size limit in bytes.
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Decode an inbound frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is too large or not a valid frame.
    pub fn decode_inbound(&self, data: &[u8]) -> Result<InboundFrame, ProtocolError> {
        if data.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: data.len(),
                max: self.max_frame_size,
            });
        }
        Ok(serde_json::from_slice(data)?)
    }

    /// Encode an outbound frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode_outbound(&self, frame: &OutboundFrame) -> Result<String, ProtocolError> {
        encode_outbound(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::Address;

    #[test]
    fn test_decode_partial_frame() {
        let frame = decode_inbound(br#"{"recipient_id": 4, "content": "yo"}"#).unwrap();
        assert_eq!(frame.address(), Some(Address::Recipient(4)));
        assert_eq!(frame.content, "yo");
    }

    #[test]
    fn test_decode_missing_content_defaults_empty() {
        let frame = decode_inbound(br#"{"conversation_id": 1}"#).unwrap();
        assert!(frame.is_blank());
    }

    #[test]
    fn test_decode_malformed() {
        match decode_inbound(b"not json") {
            Err(ProtocolError::Json(_)) => {}
            other => panic!("Expected Json error, got {:?}", other),
        }
        assert!(decode_inbound(br#"{"conversation_id": "seven"}"#).is_err());
    }

    #[test]
    fn test_frame_too_large() {
        let codec = FrameCodec::new(16);
        let data = br#"{"conversation_id": 1, "content": "way past the limit"}"#;

        match codec.decode_inbound(data) {
            Err(ProtocolError::FrameTooLarge { size, max }) => {
                assert_eq!(size, data.len());
                assert_eq!(max, 16);
            }
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }
}
