//! # Call Admission Controller
//!
//! Decides ARQs, BRQs and DRQs, and owns the call records and the bandwidth
//! ledger. Calls live in a map keyed by [`CallKey`]; a record leaves the map
//! exactly once, and whoever removes it releases its bandwidth.

mod call;
mod ledger;
mod resolver;

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use h323_ras_core::message::{
    AdmissionConfirm, AdmissionRejectReason, AdmissionRequest, Bandwidth, BandwidthRejectReason,
    BandwidthRequest, CallIdentifier, CallModel, DisengageRejectReason, DisengageRequest,
    InfoRequestResponse,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{AdmissionPolicy, BandwidthConfig};
use crate::registry::{EndpointRegistry, RegisteredEndpoint};

pub use call::{CallDirection, CallEndReason, CallInfo, CallKey, GatekeeperCall};
pub use ledger::BandwidthLedger;
pub use resolver::{AliasResolver, RegistryResolver, Route};

use call::NewCall;

/// An accepted ARQ.
#[derive(Debug, Clone)]
pub struct Admission {
    pub call: Arc<GatekeeperCall>,
    pub confirm: AdmissionConfirm,
    /// False when the ARQ repeated an already admitted call
    pub created: bool,
}

pub struct AdmissionController {
    policy: AdmissionPolicy,
    bandwidth: BandwidthConfig,
    registry: Arc<EndpointRegistry>,
    resolver: Arc<dyn AliasResolver>,
    ledger: BandwidthLedger,
    calls: DashMap<CallKey, Arc<GatekeeperCall>>,
}

impl AdmissionController {
    pub fn new(
        policy: AdmissionPolicy,
        bandwidth: BandwidthConfig,
        registry: Arc<EndpointRegistry>,
        resolver: Arc<dyn AliasResolver>,
    ) -> Self {
        Self {
            ledger: BandwidthLedger::new(bandwidth.total),
            policy,
            bandwidth,
            registry,
            resolver,
            calls: DashMap::new(),
        }
    }

    /// Controller routing through the registry.
    pub fn with_registry(
        policy: AdmissionPolicy,
        bandwidth: BandwidthConfig,
        registry: Arc<EndpointRegistry>,
    ) -> Self {
        let resolver = Arc::new(RegistryResolver::new(registry.clone()));
        Self::new(policy, bandwidth, registry, resolver)
    }

    pub fn ledger(&self) -> &BandwidthLedger {
        &self.ledger
    }

    pub fn call_count(&self) -> usize {
        self.calls.len()
    }

    pub fn calls(&self) -> Vec<Arc<GatekeeperCall>> {
        self.calls.iter().map(|c| c.value().clone()).collect()
    }

    pub fn find_call(&self, key: &CallKey) -> Option<Arc<GatekeeperCall>> {
        self.calls.get(key).map(|c| c.value().clone())
    }

    /// Both legs of a call, when present.
    pub fn find_calls(&self, call_identifier: CallIdentifier) -> Vec<Arc<GatekeeperCall>> {
        [false, true]
            .into_iter()
            .filter_map(|answered| self.find_call(&CallKey::new(call_identifier, answered)))
            .collect()
    }

    pub fn calls_for_endpoint(&self, endpoint_identifier: &str) -> Vec<Arc<GatekeeperCall>> {
        self.calls()
            .into_iter()
            .filter(|call| call.endpoint_identifier() == endpoint_identifier)
            .collect()
    }

    /// Decide an ARQ received from `source`.
    pub fn admit(
        &self,
        request: &AdmissionRequest,
        source: SocketAddr,
    ) -> Result<Admission, AdmissionRejectReason> {
        let endpoint = self.registry.find_by_identifier(&request.endpoint_identifier);
        if endpoint.is_none() && !self.policy.admit_unregistered {
            debug!(endpoint = %request.endpoint_identifier, "ARQ from unregistered endpoint");
            return Err(AdmissionRejectReason::CallerNotRegistered);
        }

        let key = CallKey::new(request.call_identifier, request.answer_call);
        if let Some(call) = self.find_call(&key) {
            return self.reconfirm(call, request);
        }

        let (destination, destination_aliases, routed) = if request.answer_call {
            self.route_answer(request, endpoint.as_deref())?
        } else {
            self.route_call(request)?
        };

        let requested = if request.bandwidth == 0 {
            self.bandwidth.default_call
        } else {
            request.bandwidth
        }
        .min(self.bandwidth.maximum_call);
        let granted = self.ledger.reserve(requested, self.bandwidth.policy).map_err(|available| {
            warn!(call = %key, "No bandwidth for {}, {} available", requested, available);
            AdmissionRejectReason::RequestDenied
        })?;

        let ras_address = endpoint
            .as_ref()
            .and_then(|e| e.ras_addresses().first().copied())
            .unwrap_or(source);
        let call = Arc::new(GatekeeperCall::new(NewCall {
            key,
            call_reference: request.call_reference,
            endpoint_identifier: request.endpoint_identifier.clone(),
            ras_address,
            source_aliases: request.src_info.clone(),
            destination_aliases,
            destination_signal_address: destination,
            gatekeeper_routed: routed,
            bandwidth: granted,
        }));

        match self.calls.entry(key) {
            Entry::Occupied(existing) => {
                // Lost a race with a retransmitted ARQ for the same leg
                let existing = existing.get().clone();
                self.ledger.release(granted);
                return self.reconfirm(existing, request);
            }
            Entry::Vacant(slot) => {
                slot.insert(call.clone());
            }
        }
        if let Some(endpoint) = &endpoint {
            if !endpoint.add_call(key.call_identifier) {
                // The endpoint left the registry while the ARQ was decided
                debug!(call = %key, "Caller unregistered during admission, rolling back");
                self.end_call(&key, CallEndReason::EndpointUnregistered);
                return Err(AdmissionRejectReason::CallerNotRegistered);
            }
        }

        info!(
            call = %key,
            endpoint = %request.endpoint_identifier,
            "Admitted call to {} with bandwidth {}",
            destination,
            granted
        );
        Ok(Admission {
            confirm: self.confirm(&call),
            call,
            created: true,
        })
    }

    /// Answer an ARQ repeating an admitted call.
    fn reconfirm(
        &self,
        call: Arc<GatekeeperCall>,
        request: &AdmissionRequest,
    ) -> Result<Admission, AdmissionRejectReason> {
        if call.endpoint_identifier() != request.endpoint_identifier {
            warn!(
                call = %call.key(),
                endpoint = %request.endpoint_identifier,
                "ARQ for a call owned by {}",
                call.endpoint_identifier()
            );
            return Err(AdmissionRejectReason::InvalidPermission);
        }
        debug!(call = %call.key(), "Repeated ARQ, confirming again");
        Ok(Admission {
            confirm: self.confirm(&call),
            call,
            created: false,
        })
    }

    fn route_call(
        &self,
        request: &AdmissionRequest,
    ) -> Result<(SocketAddr, Vec<String>, bool), AdmissionRejectReason> {
        if request.destination_info.is_empty() && request.dest_call_signal_address.is_none() {
            return Err(AdmissionRejectReason::IncompleteAddress);
        }

        if !request.destination_info.is_empty() {
            if let Some(route) = self.resolver.resolve(&request.destination_info) {
                return Ok((route.signal_address, route.aliases, route.gatekeeper_routed));
            }
        }

        match request.dest_call_signal_address {
            Some(addr) => {
                if self.policy.can_only_call_registered && self.registry.find_by_signal_address(&addr).is_none() {
                    return Err(AdmissionRejectReason::CalledPartyNotRegistered);
                }
                Ok((addr, request.destination_info.clone(), false))
            }
            None => Err(AdmissionRejectReason::CalledPartyNotRegistered),
        }
    }

    fn route_answer(
        &self,
        request: &AdmissionRequest,
        endpoint: Option<&RegisteredEndpoint>,
    ) -> Result<(SocketAddr, Vec<String>, bool), AdmissionRejectReason> {
        if self.policy.can_only_answer_registered {
            let caller_registered = request
                .src_call_signal_address
                .and_then(|addr| self.registry.find_by_signal_address(&addr))
                .is_some()
                || (!request.src_info.is_empty() && self.registry.resolve(&request.src_info).is_some());
            if !caller_registered {
                return Err(AdmissionRejectReason::CallerNotRegistered);
            }
        }

        let destination = request
            .dest_call_signal_address
            .or_else(|| endpoint.and_then(|e| e.signal_address()))
            .ok_or(AdmissionRejectReason::IncompleteAddress)?;
        let aliases = match endpoint {
            Some(endpoint) if request.destination_info.is_empty() => endpoint.aliases(),
            _ => request.destination_info.clone(),
        };
        Ok((destination, aliases, false))
    }

    fn confirm(&self, call: &GatekeeperCall) -> AdmissionConfirm {
        let routed = call.is_gatekeeper_routed() || self.policy.gatekeeper_routed;
        let (call_model, dest_call_signal_address) = match self.policy.routed_signal_address {
            Some(gatekeeper) if routed => (CallModel::GatekeeperRouted, gatekeeper),
            _ => (CallModel::Direct, call.destination_signal_address()),
        };
        AdmissionConfirm {
            bandwidth: call.bandwidth(),
            call_model,
            dest_call_signal_address,
            destination_info: call.info().destination_aliases,
            irr_frequency: self
                .policy
                .info_response_rate
                .map(|rate| rate.as_secs().min(u16::MAX as u64) as u16),
        }
    }

    /// Decide a BRQ. A reject carries the most bandwidth that could have
    /// been granted.
    pub fn change_bandwidth(
        &self,
        request: &BandwidthRequest,
    ) -> Result<Bandwidth, (BandwidthRejectReason, Bandwidth)> {
        if self.registry.find_by_identifier(&request.endpoint_identifier).is_none()
            && !self.policy.admit_unregistered
        {
            return Err((BandwidthRejectReason::NotBound, 0));
        }

        let key = CallKey::new(request.call_identifier, request.answered_call);
        let call = self
            .find_call(&key)
            .ok_or((BandwidthRejectReason::InvalidConferenceId, 0))?;
        if call.endpoint_identifier() != request.endpoint_identifier {
            return Err((BandwidthRejectReason::InvalidPermission, 0));
        }

        let requested = request.bandwidth.min(self.bandwidth.maximum_call);
        let policy = self.bandwidth.policy;
        match call.change_bandwidth(|held| self.ledger.adjust(held, requested, policy)) {
            Some(Ok(granted)) => {
                debug!(call = %key, "Bandwidth changed to {}", granted);
                Ok(granted)
            }
            Some(Err(allowed)) => {
                warn!(call = %key, "Bandwidth change to {} refused, {} allowed", requested, allowed);
                Err((BandwidthRejectReason::InsufficientResources, allowed))
            }
            None => Err((BandwidthRejectReason::InvalidConferenceId, 0)),
        }
    }

    /// Decide a DRQ. Returns the ended call, or `None` when it was already
    /// gone (a retransmission, or a call already cleared).
    pub fn disengage(
        &self,
        request: &DisengageRequest,
    ) -> Result<Option<Arc<GatekeeperCall>>, DisengageRejectReason> {
        if self.registry.find_by_identifier(&request.endpoint_identifier).is_none()
            && !self.policy.admit_unregistered
        {
            return Err(DisengageRejectReason::NotRegistered);
        }

        let key = CallKey::new(request.call_identifier, request.answered_call);
        let Some(call) = self.find_call(&key) else {
            debug!(call = %key, "DRQ for unknown call");
            return Ok(None);
        };
        if call.endpoint_identifier() != request.endpoint_identifier {
            return Err(DisengageRejectReason::RequestToDropOther);
        }

        call.mark_drq_received();
        Ok(self.end_call(&key, CallEndReason::Disengaged(request.reason)))
    }

    /// Remove a call and release its bandwidth. Returns `None` if the call
    /// was already gone.
    pub fn end_call(&self, key: &CallKey, reason: CallEndReason) -> Option<Arc<GatekeeperCall>> {
        let (_, call) = self.calls.remove(key)?;
        if let Some(bandwidth) = call.end(reason) {
            self.ledger.release(bandwidth);
        }
        if let Some(endpoint) = self.registry.find_by_identifier(call.endpoint_identifier()) {
            endpoint.remove_call(&key.call_identifier);
        }
        info!(call = %key, "Call ended: {:?}", reason);
        Some(call)
    }

    /// End every call of an endpoint.
    pub fn end_endpoint_calls(&self, endpoint_identifier: &str, reason: CallEndReason) -> Vec<Arc<GatekeeperCall>> {
        self.calls_for_endpoint(endpoint_identifier)
            .into_iter()
            .filter_map(|call| self.end_call(&call.key(), reason))
            .collect()
    }

    /// Apply an unsolicited IRR: refresh the endpoint and the heartbeat of
    /// every call it lists. Returns whether the endpoint is registered.
    pub fn on_info_response(&self, response: &InfoRequestResponse) -> bool {
        let endpoint = self.registry.find_by_identifier(&response.endpoint_identifier);
        if let Some(endpoint) = &endpoint {
            endpoint.touch();
        }
        for info in &response.per_call_info {
            let key = CallKey::new(info.call_identifier, info.answered_call);
            if let Some(call) = self.find_call(&key) {
                if call.endpoint_identifier() == response.endpoint_identifier {
                    call.on_heartbeat(info);
                }
            }
        }
        endpoint.is_some()
    }

    /// Calls whose heartbeat is overdue, each claimed for one probe.
    pub fn claim_stale_calls(&self, now: Instant) -> Vec<Arc<GatekeeperCall>> {
        let Some(rate) = self.policy.info_response_rate else {
            return Vec::new();
        };
        self.calls()
            .into_iter()
            .filter(|call| call.is_stale(now, rate) && call.begin_probe())
            .collect()
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("calls", &self.calls.len())
            .field("ledger", &self.ledger)
            .finish()
    }
}
