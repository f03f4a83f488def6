use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use h323_ras_core::message::{CallIdentifier, EndpointKind};
use parking_lot::Mutex;
use tokio::time::Instant;

/// An endpoint known to the gatekeeper.
///
/// The identifier never changes; everything else lives behind the
/// endpoint's own lock so concurrent requests from one endpoint serialise
/// without blocking other endpoints.
pub struct RegisteredEndpoint {
    identifier: String,
    registered_at: DateTime<Utc>,
    state: Mutex<EndpointState>,
}

#[derive(Debug, Clone)]
pub(crate) struct EndpointState {
    pub aliases: Vec<String>,
    pub call_signal_addresses: Vec<SocketAddr>,
    pub ras_addresses: Vec<SocketAddr>,
    pub voice_prefixes: Vec<String>,
    pub kind: EndpointKind,
    pub time_to_live: Duration,
    pub last_seen: Instant,
    pub active_calls: HashSet<CallIdentifier>,
    /// An IRQ liveness probe is outstanding
    pub probing: bool,
    /// Set once the endpoint has left the registry
    pub removed: bool,
}

/// Point-in-time copy of a registered endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointInfo {
    pub identifier: String,
    pub aliases: Vec<String>,
    pub call_signal_addresses: Vec<SocketAddr>,
    pub ras_addresses: Vec<SocketAddr>,
    pub voice_prefixes: Vec<String>,
    pub kind: EndpointKind,
    pub time_to_live: Duration,
    pub registered_at: DateTime<Utc>,
    pub active_calls: usize,
}

impl RegisteredEndpoint {
    pub(crate) fn new(identifier: String, state: EndpointState) -> Self {
        Self {
            identifier,
            registered_at: Utc::now(),
            state: Mutex::new(state),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn aliases(&self) -> Vec<String> {
        self.state.lock().aliases.clone()
    }

    pub fn call_signal_addresses(&self) -> Vec<SocketAddr> {
        self.state.lock().call_signal_addresses.clone()
    }

    pub fn ras_addresses(&self) -> Vec<SocketAddr> {
        self.state.lock().ras_addresses.clone()
    }

    /// First call signalling address, used as the route to this endpoint.
    pub fn signal_address(&self) -> Option<SocketAddr> {
        self.state.lock().call_signal_addresses.first().copied()
    }

    pub fn time_to_live(&self) -> Duration {
        self.state.lock().time_to_live
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    pub fn has_alias(&self, alias: &str) -> bool {
        self.state.lock().aliases.iter().any(|a| a == alias)
    }

    pub fn active_calls(&self) -> Vec<CallIdentifier> {
        self.state.lock().active_calls.iter().copied().collect()
    }

    /// Record a call of this endpoint. Refused once the endpoint has left
    /// the registry.
    pub(crate) fn add_call(&self, call: CallIdentifier) -> bool {
        let mut state = self.state.lock();
        if state.removed {
            return false;
        }
        state.active_calls.insert(call);
        true
    }

    pub(crate) fn remove_call(&self, call: &CallIdentifier) {
        self.state.lock().active_calls.remove(call);
    }

    /// Record that the endpoint was heard from.
    pub fn touch(&self) {
        let mut state = self.state.lock();
        state.last_seen = Instant::now();
        state.probing = false;
    }

    /// Whether the TTL has lapsed at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        let state = self.state.lock();
        !state.removed && now.saturating_duration_since(state.last_seen) > state.time_to_live
    }

    /// Claim the liveness probe for an expired endpoint. Returns false when
    /// one is already outstanding.
    pub(crate) fn begin_probe(&self) -> bool {
        let mut state = self.state.lock();
        if state.probing || state.removed {
            return false;
        }
        state.probing = true;
        true
    }

    pub(crate) fn end_probe(&self) {
        self.state.lock().probing = false;
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, EndpointState> {
        self.state.lock()
    }

    pub fn info(&self) -> EndpointInfo {
        let state = self.state.lock();
        EndpointInfo {
            identifier: self.identifier.clone(),
            aliases: state.aliases.clone(),
            call_signal_addresses: state.call_signal_addresses.clone(),
            ras_addresses: state.ras_addresses.clone(),
            voice_prefixes: state.voice_prefixes.clone(),
            kind: state.kind,
            time_to_live: state.time_to_live,
            registered_at: self.registered_at,
            active_calls: state.active_calls.len(),
        }
    }
}

impl fmt::Debug for RegisteredEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RegisteredEndpoint")
            .field("identifier", &self.identifier)
            .field("aliases", &state.aliases)
            .field("call_signal_addresses", &state.call_signal_addresses)
            .finish()
    }
}
