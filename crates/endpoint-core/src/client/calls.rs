//! Calls admitted by the gatekeeper and still in progress.

use std::net::SocketAddr;
use std::time::Duration;

use dashmap::DashMap;
use h323_ras_core::message::{Bandwidth, CallIdentifier, CallModel, PerCallInfo};
use tokio::time::Instant;

/// Parameters of an ARQ.
///
/// ```rust
/// use h323_endpoint_core::AdmissionParams;
///
/// let params = AdmissionParams::outgoing(vec!["bob".to_string()], 640);
/// assert!(!params.answer_call);
/// assert!(params.call_reference.is_none());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionParams {
    pub call_identifier: CallIdentifier,
    /// Allocated by the client when `None`
    pub call_reference: Option<u16>,
    pub answer_call: bool,
    pub destination_info: Vec<String>,
    pub dest_call_signal_address: Option<SocketAddr>,
    /// Defaults to the client's aliases for outgoing calls
    pub src_info: Vec<String>,
    pub src_call_signal_address: Option<SocketAddr>,
    /// Requested bandwidth; zero asks for the gatekeeper default
    pub bandwidth: Bandwidth,
}

impl AdmissionParams {
    /// Admission for a call we place.
    pub fn outgoing(destination_info: Vec<String>, bandwidth: Bandwidth) -> Self {
        Self {
            call_identifier: CallIdentifier::new(),
            call_reference: None,
            answer_call: false,
            destination_info,
            dest_call_signal_address: None,
            src_info: Vec::new(),
            src_call_signal_address: None,
            bandwidth,
        }
    }

    /// Admission to answer a call signalled to us.
    pub fn incoming(
        call_identifier: CallIdentifier,
        call_reference: u16,
        src_info: Vec<String>,
        src_call_signal_address: Option<SocketAddr>,
        bandwidth: Bandwidth,
    ) -> Self {
        Self {
            call_identifier,
            call_reference: Some(call_reference),
            answer_call: true,
            destination_info: Vec::new(),
            dest_call_signal_address: None,
            src_info,
            src_call_signal_address,
            bandwidth,
        }
    }

    pub fn with_destination_address(mut self, addr: SocketAddr) -> Self {
        self.dest_call_signal_address = Some(addr);
        self
    }

    pub fn with_call_identifier(mut self, call_identifier: CallIdentifier) -> Self {
        self.call_identifier = call_identifier;
        self
    }
}

/// A call the gatekeeper admitted.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveCall {
    pub call_identifier: CallIdentifier,
    pub call_reference: u16,
    pub answered_call: bool,
    pub bandwidth: Bandwidth,
    /// Where to send call signalling
    pub destination: SocketAddr,
    pub call_model: CallModel,
    /// Interval for unsolicited IRRs, if the gatekeeper asked for them
    pub irr_frequency: Option<Duration>,
}

impl ActiveCall {
    pub fn per_call_info(&self) -> PerCallInfo {
        PerCallInfo {
            call_identifier: self.call_identifier,
            call_reference: self.call_reference,
            bandwidth: self.bandwidth,
            answered_call: self.answered_call,
            alerting: true,
            connected: true,
        }
    }
}

/// Calls are keyed by identifier and direction; both legs of a call between
/// two endpoints of the same client share an identifier.
pub(crate) type CallKey = (CallIdentifier, bool);

struct CallEntry {
    call: ActiveCall,
    last_heartbeat: Instant,
}

#[derive(Default)]
pub(crate) struct CallTable {
    calls: DashMap<CallKey, CallEntry>,
}

impl CallTable {
    pub(crate) fn insert(&self, call: ActiveCall) {
        let key = (call.call_identifier, call.answered_call);
        self.calls.insert(
            key,
            CallEntry {
                call,
                last_heartbeat: Instant::now(),
            },
        );
    }

    pub(crate) fn get(&self, key: &CallKey) -> Option<ActiveCall> {
        self.calls.get(key).map(|entry| entry.call.clone())
    }

    pub(crate) fn remove(&self, key: &CallKey) -> Option<ActiveCall> {
        self.calls.remove(key).map(|(_, entry)| entry.call)
    }

    pub(crate) fn set_bandwidth(&self, key: &CallKey, bandwidth: Bandwidth) {
        if let Some(mut entry) = self.calls.get_mut(key) {
            entry.call.bandwidth = bandwidth;
        }
    }

    pub(crate) fn clear(&self) -> Vec<ActiveCall> {
        let keys: Vec<CallKey> = self.calls.iter().map(|entry| *entry.key()).collect();
        keys.iter().filter_map(|key| self.remove(key)).collect()
    }

    pub(crate) fn all(&self) -> Vec<ActiveCall> {
        self.calls.iter().map(|entry| entry.call.clone()).collect()
    }

    /// Per-call info for an IRR; a nil identifier selects every call.
    pub(crate) fn per_call_info(&self, call_identifier: CallIdentifier) -> Vec<PerCallInfo> {
        self.calls
            .iter()
            .filter(|entry| call_identifier.is_nil() || entry.call.call_identifier == call_identifier)
            .map(|entry| entry.call.per_call_info())
            .collect()
    }

    /// Calls whose heartbeat interval has elapsed; their timers restart.
    pub(crate) fn claim_heartbeats(&self, now: Instant) -> Vec<PerCallInfo> {
        let mut due = Vec::new();
        for mut entry in self.calls.iter_mut() {
            let Some(frequency) = entry.call.irr_frequency else {
                continue;
            };
            if now.saturating_duration_since(entry.last_heartbeat) >= frequency {
                entry.last_heartbeat = now;
                due.push(entry.call.per_call_info());
            }
        }
        due
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }
}
