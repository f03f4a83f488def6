//! Message codec contract.
//!
//! The PER encoding of H.225.0 lives outside this crate; it plugs in by
//! implementing [`RasCodec`]. [`JsonCodec`] is the codec used for
//! development, tooling and tests.

use bytes::Bytes;
use serde::Deserialize;
use tracing::trace;

use crate::error::CodecError;
use crate::message::{RasMessage, SequenceNumber};

/// Largest datagram a RAS channel will encode or accept.
pub const MAX_DATAGRAM_SIZE: usize = 8192;

/// Turns datagrams into typed messages and back.
pub trait RasCodec: Send + Sync + 'static {
    /// Decode a complete datagram.
    fn decode(&self, data: &[u8]) -> Result<RasMessage, CodecError>;

    /// Encode a message into a datagram.
    fn encode(&self, message: &RasMessage) -> Result<Bytes, CodecError>;

    /// Recover just the sequence number from a datagram that failed to
    /// decode, so the receiver can still answer with an unknown-message
    /// response.
    fn peek_sequence_number(&self, _data: &[u8]) -> Option<SequenceNumber> {
        None
    }

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// JSON encoding of [`RasMessage`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }
}

/// Just enough of a message to read the framing.
#[derive(Deserialize)]
struct Framing {
    sequence_number: SequenceNumber,
}

impl RasCodec for JsonCodec {
    fn decode(&self, data: &[u8]) -> Result<RasMessage, CodecError> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(CodecError::TooLarge {
                size: data.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }
        serde_json::from_slice(data).map_err(|e| CodecError::DecodingFailed {
            reason: e.to_string(),
        })
    }

    fn encode(&self, message: &RasMessage) -> Result<Bytes, CodecError> {
        let encoded = serde_json::to_vec(message).map_err(|e| CodecError::EncodingFailed {
            reason: e.to_string(),
        })?;
        if encoded.len() > MAX_DATAGRAM_SIZE {
            return Err(CodecError::TooLarge {
                size: encoded.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }
        trace!("Encoded {} into {} bytes", message, encoded.len());
        Ok(Bytes::from(encoded))
    }

    fn peek_sequence_number(&self, data: &[u8]) -> Option<SequenceNumber> {
        serde_json::from_slice::<Framing>(data)
            .ok()
            .map(|framing| framing.sequence_number)
            .filter(|seq| *seq != 0)
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CryptoToken, RasBody, RasKind, RequestInProgress};

    #[test]
    fn test_decode_preserves_tokens_and_body() {
        let codec = JsonCodec::new();
        let mut message = RasMessage::new(
            17,
            RasBody::RequestInProgress(RequestInProgress { delay_ms: 5000 }),
        );
        message.tokens.push(CryptoToken::new("test", vec![1, 2, 3]));

        let bytes = codec.encode(&message).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.kind(), RasKind::Rip);
    }

    #[test]
    fn test_unknown_body_still_yields_sequence_number() {
        let codec = JsonCodec::new();
        let garbage = br#"{"sequence_number":99,"body":{"LocationRequest":{}}}"#;
        assert!(codec.decode(garbage).is_err());
        assert_eq!(codec.peek_sequence_number(garbage), Some(99));
        assert_eq!(codec.peek_sequence_number(b"not json"), None);
    }

    #[test]
    fn test_oversized_datagram_rejected() {
        let codec = JsonCodec::new();
        let data = vec![b' '; MAX_DATAGRAM_SIZE + 1];
        assert!(matches!(codec.decode(&data), Err(CodecError::TooLarge { .. })));
    }
}
