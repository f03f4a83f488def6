//! H.225.0 RAS building blocks for the h323 stack
//!
//! This crate provides the RAS message model, datagram transports, the
//! authenticator chain contract and the transaction engine shared by the
//! gatekeeper and by endpoints.

pub mod auth;
pub mod codec;
pub mod error;
pub mod message;
pub mod serde_duration;
pub mod transaction;
pub mod transport;

pub use auth::{Authenticator, AuthenticatorChain, ValidationResult};
pub use codec::{JsonCodec, RasCodec};
pub use error::{CodecError, Error, Result};
pub use message::{RasBody, RasKind, RasMessage, RejectReason};
pub use transaction::{
    InboundRequest, RasChannel, RasChannelBuilder, RasRequestHandler, TransactionConfig,
    TransactionOutcome,
};
pub use transport::{MemoryNetwork, MemoryTransport, Transport, TransportEvent, UdpTransport};

/// Bind a UDP transport and start a RAS channel on it.
pub async fn bind_udp_channel(
    addr: std::net::SocketAddr,
    config: TransactionConfig,
    authenticators: AuthenticatorChain,
    handler: Option<std::sync::Arc<dyn RasRequestHandler>>,
) -> Result<RasChannel> {
    let (transport, events) = UdpTransport::bind(addr, None).await?;
    let mut builder = RasChannel::builder(std::sync::Arc::new(transport), events)
        .with_config(config)
        .with_authenticators(authenticators);
    if let Some(handler) = handler {
        builder = builder.with_handler(handler);
    }
    builder.start()
}

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::message::*;
    pub use crate::{
        Authenticator, AuthenticatorChain, Error, InboundRequest, JsonCodec, MemoryNetwork,
        RasChannel, RasCodec, RasRequestHandler, Result, TransactionConfig, TransactionOutcome,
        Transport, TransportEvent, UdpTransport, ValidationResult,
    };
}
