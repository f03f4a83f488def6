use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use h323_ras_core::message::{Bandwidth, CallIdentifier, DisengageReason, PerCallInfo};
use parking_lot::Mutex;
use tokio::time::Instant;

/// Which side of a call an admission was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallDirection {
    Originating,
    Answering,
}

impl CallDirection {
    pub fn from_answer_call(answer_call: bool) -> Self {
        if answer_call {
            CallDirection::Answering
        } else {
            CallDirection::Originating
        }
    }

    pub fn is_answering(&self) -> bool {
        matches!(self, CallDirection::Answering)
    }
}

/// A call leg as seen by the gatekeeper. Both parties of a call admitted by
/// the same gatekeeper produce two records under one call identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallKey {
    pub call_identifier: CallIdentifier,
    pub direction: CallDirection,
}

impl CallKey {
    pub fn new(call_identifier: CallIdentifier, answered_call: bool) -> Self {
        Self {
            call_identifier,
            direction: CallDirection::from_answer_call(answered_call),
        }
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = if self.direction.is_answering() { "in" } else { "out" };
        write!(f, "{}/{}", self.call_identifier, side)
    }
}

/// Why a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEndReason {
    /// The endpoint sent DRQ
    Disengaged(DisengageReason),
    /// No heartbeat and the IRQ probe failed
    HeartbeatFailure,
    /// Cleared through the gatekeeper API
    AdministrativeClear,
    /// The owning endpoint unregistered
    EndpointUnregistered,
    /// The owning endpoint's registration lapsed
    EndpointExpired,
}

#[derive(Debug)]
struct CallState {
    bandwidth: Bandwidth,
    alerting_time: Option<DateTime<Utc>>,
    connected_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    end_reason: Option<CallEndReason>,
    last_heartbeat: Instant,
    drq_received: bool,
    /// A heartbeat IRQ is outstanding
    probing: bool,
}

/// Call record kept from admission until the call ends.
pub struct GatekeeperCall {
    key: CallKey,
    call_reference: u16,
    endpoint_identifier: String,
    ras_address: SocketAddr,
    source_aliases: Vec<String>,
    destination_aliases: Vec<String>,
    destination_signal_address: SocketAddr,
    /// Call signalling goes through the gatekeeper
    gatekeeper_routed: bool,
    start_time: DateTime<Utc>,
    state: Mutex<CallState>,
}

/// Point-in-time copy of a call record.
#[derive(Debug, Clone, PartialEq)]
pub struct CallInfo {
    pub key: CallKey,
    pub call_reference: u16,
    pub endpoint_identifier: String,
    pub source_aliases: Vec<String>,
    pub destination_aliases: Vec<String>,
    pub destination_signal_address: SocketAddr,
    pub bandwidth: Bandwidth,
    pub start_time: DateTime<Utc>,
    pub alerting_time: Option<DateTime<Utc>>,
    pub connected_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub end_reason: Option<CallEndReason>,
    pub drq_received: bool,
}

pub(crate) struct NewCall {
    pub key: CallKey,
    pub call_reference: u16,
    pub endpoint_identifier: String,
    pub ras_address: SocketAddr,
    pub source_aliases: Vec<String>,
    pub destination_aliases: Vec<String>,
    pub destination_signal_address: SocketAddr,
    pub gatekeeper_routed: bool,
    pub bandwidth: Bandwidth,
}

impl GatekeeperCall {
    pub(crate) fn new(call: NewCall) -> Self {
        Self {
            key: call.key,
            call_reference: call.call_reference,
            endpoint_identifier: call.endpoint_identifier,
            ras_address: call.ras_address,
            source_aliases: call.source_aliases,
            destination_aliases: call.destination_aliases,
            destination_signal_address: call.destination_signal_address,
            gatekeeper_routed: call.gatekeeper_routed,
            start_time: Utc::now(),
            state: Mutex::new(CallState {
                bandwidth: call.bandwidth,
                alerting_time: None,
                connected_time: None,
                end_time: None,
                end_reason: None,
                last_heartbeat: Instant::now(),
                drq_received: false,
                probing: false,
            }),
        }
    }

    pub fn key(&self) -> CallKey {
        self.key
    }

    pub fn call_identifier(&self) -> CallIdentifier {
        self.key.call_identifier
    }

    pub fn call_reference(&self) -> u16 {
        self.call_reference
    }

    pub fn endpoint_identifier(&self) -> &str {
        &self.endpoint_identifier
    }

    /// Where the owning endpoint receives RAS messages.
    pub fn ras_address(&self) -> SocketAddr {
        self.ras_address
    }

    pub fn destination_signal_address(&self) -> SocketAddr {
        self.destination_signal_address
    }

    pub fn is_gatekeeper_routed(&self) -> bool {
        self.gatekeeper_routed
    }

    pub fn bandwidth(&self) -> Bandwidth {
        self.state.lock().bandwidth
    }

    pub fn end_reason(&self) -> Option<CallEndReason> {
        self.state.lock().end_reason
    }

    pub fn is_ended(&self) -> bool {
        self.state.lock().end_reason.is_some()
    }

    pub fn drq_received(&self) -> bool {
        self.state.lock().drq_received
    }

    /// Run `change` against the held bandwidth under the call's lock and
    /// store whatever it grants. Returns `None` once the call has ended.
    pub(crate) fn change_bandwidth<E>(
        &self,
        change: impl FnOnce(Bandwidth) -> Result<Bandwidth, E>,
    ) -> Option<Result<Bandwidth, E>> {
        let mut state = self.state.lock();
        if state.end_reason.is_some() {
            return None;
        }
        Some(change(state.bandwidth).map(|granted| {
            state.bandwidth = granted;
            granted
        }))
    }

    pub(crate) fn mark_drq_received(&self) {
        self.state.lock().drq_received = true;
    }

    /// End the call. Only the first terminal event counts: it gets back the
    /// bandwidth to release, later ones get `None`.
    pub(crate) fn end(&self, reason: CallEndReason) -> Option<Bandwidth> {
        let mut state = self.state.lock();
        if state.end_reason.is_some() {
            return None;
        }
        state.end_reason = Some(reason);
        state.end_time = Some(Utc::now());
        Some(state.bandwidth)
    }

    /// Apply the call's entry of an IRR.
    pub(crate) fn on_heartbeat(&self, info: &PerCallInfo) {
        let mut state = self.state.lock();
        state.last_heartbeat = Instant::now();
        state.probing = false;
        let now = Utc::now();
        if info.alerting && state.alerting_time.is_none() {
            state.alerting_time = Some(now);
        }
        if info.connected && state.connected_time.is_none() {
            state.connected_time = Some(now);
        }
    }

    /// Whether no heartbeat arrived for two reporting periods. Calls with a
    /// probe outstanding are not stale again until it resolves.
    pub(crate) fn is_stale(&self, now: Instant, rate: Duration) -> bool {
        let state = self.state.lock();
        state.end_reason.is_none()
            && !state.probing
            && now.saturating_duration_since(state.last_heartbeat) > rate * 2
    }

    pub(crate) fn begin_probe(&self) -> bool {
        let mut state = self.state.lock();
        if state.probing || state.end_reason.is_some() {
            return false;
        }
        state.probing = true;
        true
    }

    pub(crate) fn end_probe(&self) {
        self.state.lock().probing = false;
    }

    pub fn info(&self) -> CallInfo {
        let state = self.state.lock();
        CallInfo {
            key: self.key,
            call_reference: self.call_reference,
            endpoint_identifier: self.endpoint_identifier.clone(),
            source_aliases: self.source_aliases.clone(),
            destination_aliases: self.destination_aliases.clone(),
            destination_signal_address: self.destination_signal_address,
            bandwidth: state.bandwidth,
            start_time: self.start_time,
            alerting_time: state.alerting_time,
            connected_time: state.connected_time,
            end_time: state.end_time,
            end_reason: state.end_reason,
            drq_received: state.drq_received,
        }
    }
}

impl fmt::Debug for GatekeeperCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatekeeperCall")
            .field("key", &self.key)
            .field("endpoint", &self.endpoint_identifier)
            .field("bandwidth", &self.bandwidth())
            .finish()
    }
}
