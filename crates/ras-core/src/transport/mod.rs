//! Datagram transports for RAS.
//!
//! A transport sends raw datagrams and reports received ones as
//! [`TransportEvent`]s on the channel returned when it is bound. Each bound
//! transport runs exactly one receive loop task.

pub mod memory;
pub mod udp;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

use bytes::Bytes;

use crate::error::Result;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use udp::UdpTransport;

/// Well-known unicast RAS port.
pub const RAS_UNICAST_PORT: u16 = 1719;

/// Well-known gatekeeper discovery port.
pub const RAS_DISCOVERY_PORT: u16 = 1718;

/// Multicast group for gatekeeper discovery.
pub const RAS_DISCOVERY_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 41);

/// Default capacity of a transport's event channel
pub(crate) const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Events reported by a transport's receive loop.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A datagram arrived
    DatagramReceived {
        data: Bytes,
        source: SocketAddr,
        destination: SocketAddr,
    },
    /// A non-fatal receive error
    Error { error: String },
    /// The transport was closed; no further events follow
    Closed,
}

/// A connectionless datagram transport.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Local address the transport is bound to
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Send one datagram
    async fn send_datagram(&self, data: &[u8], destination: SocketAddr) -> Result<()>;

    /// Stop the receive loop and refuse further sends
    async fn close(&self) -> Result<()>;

    /// Whether the transport has been closed
    fn is_closed(&self) -> bool;
}
