//! Error types for the RAS core crate

use std::net::SocketAddr;

use thiserror::Error;

/// Result type for RAS core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by transports, codecs and the transaction engine.
///
/// Protocol outcomes (rejects, timeouts, security failures reported by a
/// peer) are not errors; they are reported through
/// [`TransactionOutcome`](crate::transaction::TransactionOutcome).
#[derive(Debug, Error)]
pub enum Error {
    /// Socket level I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to bind a listener
    #[error("Failed to bind {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The address is already bound on the in-memory network
    #[error("Address already in use: {0}")]
    AddressInUse(SocketAddr),

    /// Transport has been closed
    #[error("Transport closed")]
    TransportClosed,

    /// Sending a datagram failed
    #[error("Failed to send to {destination}: {message}")]
    SendFailed {
        destination: SocketAddr,
        message: String,
    },

    /// Message could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// A request body was passed where a reply is not expected, or similar
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// The channel is shutting down and accepts no new requests
    #[error("Channel is shutting down")]
    ShuttingDown,

    /// All 65535 sequence numbers are pending
    #[error("No free sequence number")]
    SequenceExhausted,
}

impl Error {
    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a send failure error
    pub fn send_failed(destination: SocketAddr, message: impl Into<String>) -> Self {
        Self::SendFailed {
            destination,
            message: message.into(),
        }
    }
}

/// Errors raised by a [`RasCodec`](crate::codec::RasCodec).
#[derive(Debug, Error)]
pub enum CodecError {
    /// The buffer is not a valid message
    #[error("Decoding failed: {reason}")]
    DecodingFailed { reason: String },

    /// The message could not be serialized
    #[error("Encoding failed: {reason}")]
    EncodingFailed { reason: String },

    /// The buffer exceeds the maximum datagram size
    #[error("Message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}
