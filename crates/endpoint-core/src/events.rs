//! Events published by the gatekeeper client.

use std::net::SocketAddr;

use h323_ras_core::message::{CallIdentifier, DisengageReason};

use crate::alternates::AlternateEntry;
use crate::state::{ClientState, RegistrationFailure};

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged {
        old: ClientState,
        new: ClientState,
    },
    /// A gatekeeper confirmed discovery
    Discovered {
        address: SocketAddr,
        identifier: Option<String>,
    },
    Registered {
        endpoint_identifier: String,
        gatekeeper: SocketAddr,
        time_to_live: Option<u32>,
    },
    RegistrationFailed {
        failure: RegistrationFailure,
    },
    Unregistered {
        failure: RegistrationFailure,
    },
    /// Failover moved the client to another gatekeeper
    GatekeeperChanged {
        from: SocketAddr,
        to: SocketAddr,
    },
    /// The gatekeeper dropped a call with a DRQ
    CallDisengaged {
        call_identifier: CallIdentifier,
        reason: DisengageReason,
    },
    AlternatesUpdated {
        alternates: Vec<AlternateEntry>,
    },
}
