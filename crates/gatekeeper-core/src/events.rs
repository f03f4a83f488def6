//! Gatekeeper events
//!
//! Published on a `tokio::sync::broadcast` channel; subscribe through
//! [`GatekeeperServer::subscribe`](crate::GatekeeperServer::subscribe).

use std::net::SocketAddr;

use h323_ras_core::message::Bandwidth;

use crate::admission::{CallInfo, CallKey};

/// Why an endpoint left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    /// The endpoint sent URQ
    Unregistered,
    /// URQ removed its last alias
    AliasesRemoved,
    /// TTL lapsed and the liveness probe failed
    Expired,
    /// Another registration took over its signal address
    Replaced,
    /// One of its calls failed the heartbeat probe
    HeartbeatFailure,
    /// Removed through the gatekeeper API
    Administrative,
}

#[derive(Debug, Clone)]
pub enum GatekeeperEvent {
    /// A full registration was accepted
    EndpointRegistered {
        endpoint_identifier: String,
        aliases: Vec<String>,
        ras_address: SocketAddr,
        created: bool,
    },

    EndpointUnregistered {
        endpoint_identifier: String,
        cause: RemovalCause,
    },

    CallAdmitted {
        call: CallInfo,
    },

    BandwidthChanged {
        key: CallKey,
        bandwidth: Bandwidth,
    },

    /// Carries the record as it was when the call ended
    CallEnded {
        call: CallInfo,
    },
}
