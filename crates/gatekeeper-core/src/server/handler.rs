use std::net::SocketAddr;
use std::sync::Arc;

use h323_ras_core::message::{
    AdmissionReject, AdmissionRejectReason, AdmissionRequest, BandwidthConfirm, BandwidthReject,
    BandwidthRequest, DisengageReject, DisengageRequest, GatekeeperConfirm, GatekeeperReject,
    GatekeeperRejectReason, GatekeeperRequest, InfoRequestNak, InfoRequestNakReason,
    InfoRequestResponse, PreGrantedArq, RasBody, RegistrationConfirm, RegistrationReject,
    RegistrationRejectReason, RegistrationRequest, UnregistrationReject, UnregistrationRejectReason,
    UnregistrationRequest,
};
use h323_ras_core::{InboundRequest, RasChannel, RasRequestHandler};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::admission::{AdmissionController, CallEndReason, CallKey, GatekeeperCall};
use crate::config::GatekeeperConfig;
use crate::events::{GatekeeperEvent, RemovalCause};
use crate::registry::{AliasRemoval, EndpointRegistry, RegisteredEndpoint};

/// State shared by the RAS handler, the supervision sweeps and the server
/// API.
pub(crate) struct GatekeeperCore {
    pub(crate) config: GatekeeperConfig,
    pub(crate) registry: Arc<EndpointRegistry>,
    pub(crate) admission: Arc<AdmissionController>,
    pub(crate) events: broadcast::Sender<GatekeeperEvent>,
    /// Address announced in GCF and IRQ
    pub(crate) ras_address: SocketAddr,
}

impl GatekeeperCore {
    pub(crate) fn emit(&self, event: GatekeeperEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn names_us(&self, gatekeeper_identifier: &Option<String>) -> bool {
        gatekeeper_identifier
            .as_deref()
            .is_none_or(|identifier| identifier == self.config.identifier)
    }

    pub(crate) fn end_call(&self, key: &CallKey, reason: CallEndReason) -> Option<Arc<GatekeeperCall>> {
        let call = self.admission.end_call(key, reason)?;
        self.emit(GatekeeperEvent::CallEnded { call: call.info() });
        Some(call)
    }

    pub(crate) fn end_endpoint_calls(&self, endpoint_identifier: &str, reason: CallEndReason) {
        for call in self.admission.end_endpoint_calls(endpoint_identifier, reason) {
            self.emit(GatekeeperEvent::CallEnded { call: call.info() });
        }
    }

    /// Drop an endpoint from the registry, then disengage its calls.
    ///
    /// Once unregistered the endpoint refuses new calls, so no admission can
    /// slip in after its calls are ended.
    pub(crate) fn remove_endpoint(
        &self,
        endpoint_identifier: &str,
        cause: RemovalCause,
        call_reason: CallEndReason,
    ) -> Option<Arc<RegisteredEndpoint>> {
        let endpoint = self.registry.unregister(endpoint_identifier)?;
        self.retire_endpoint(&endpoint, cause, call_reason);
        Some(endpoint)
    }

    /// Disengage the calls of an endpoint already out of the registry.
    pub(crate) fn retire_endpoint(
        &self,
        endpoint: &RegisteredEndpoint,
        cause: RemovalCause,
        call_reason: CallEndReason,
    ) {
        let identifier = endpoint.identifier();
        self.end_endpoint_calls(identifier, call_reason);
        info!(endpoint = %identifier, "Endpoint removed: {:?}", cause);
        self.emit(GatekeeperEvent::EndpointUnregistered {
            endpoint_identifier: identifier.to_string(),
            cause,
        });
    }

    fn on_gatekeeper_request(&self, request: &GatekeeperRequest) -> RasBody {
        if !self.names_us(&request.gatekeeper_identifier) {
            debug!("GRQ for gatekeeper {:?}, not us", request.gatekeeper_identifier);
            return RasBody::GatekeeperReject(GatekeeperReject {
                reason: GatekeeperRejectReason::UndefinedReason,
                gatekeeper_identifier: Some(self.config.identifier.clone()),
                alternate_gatekeepers: Vec::new(),
            });
        }
        RasBody::GatekeeperConfirm(GatekeeperConfirm {
            gatekeeper_identifier: Some(self.config.identifier.clone()),
            ras_address: self.ras_address,
            alternate_gatekeepers: self.config.alternate_gatekeepers.clone(),
            alt_gk_is_permanent: self.config.alt_gk_is_permanent,
        })
    }

    fn on_registration_request(&self, request: &RegistrationRequest, source: SocketAddr) -> RasBody {
        let reject = |reason| {
            RasBody::RegistrationReject(RegistrationReject {
                reason,
                gatekeeper_identifier: Some(self.config.identifier.clone()),
                alternate_gatekeepers: self.config.alternate_gatekeepers.clone(),
            })
        };
        if !self.names_us(&request.gatekeeper_identifier) {
            return reject(RegistrationRejectReason::UndefinedReason);
        }

        let registration = match self.registry.register(request, source) {
            Ok(registration) => registration,
            Err(reason) => {
                debug!(%source, "RRQ rejected: {:?}", reason);
                return reject(reason);
            }
        };

        for replaced in &registration.replaced {
            self.end_endpoint_calls(replaced.identifier(), CallEndReason::EndpointUnregistered);
            self.emit(GatekeeperEvent::EndpointUnregistered {
                endpoint_identifier: replaced.identifier().to_string(),
                cause: RemovalCause::Replaced,
            });
        }

        let endpoint = &registration.endpoint;
        if !registration.keep_alive {
            self.emit(GatekeeperEvent::EndpointRegistered {
                endpoint_identifier: endpoint.identifier().to_string(),
                aliases: endpoint.aliases(),
                ras_address: endpoint.ras_addresses().first().copied().unwrap_or(source),
                created: registration.created,
            });
        }

        let policy = &self.config.admission;
        RasBody::RegistrationConfirm(RegistrationConfirm {
            endpoint_identifier: endpoint.identifier().to_string(),
            gatekeeper_identifier: Some(self.config.identifier.clone()),
            call_signal_addresses: endpoint.call_signal_addresses(),
            terminal_aliases: endpoint.aliases(),
            time_to_live: Some(u32::try_from(registration.time_to_live.as_secs()).unwrap_or(u32::MAX)),
            alternate_gatekeepers: self.config.alternate_gatekeepers.clone(),
            alt_gk_is_permanent: self.config.alt_gk_is_permanent,
            pre_granted_arq: PreGrantedArq {
                make_call: policy.make_call_pregranted,
                answer_call: policy.answer_call_pregranted,
            },
        })
    }

    fn on_unregistration_request(&self, request: &UnregistrationRequest) -> RasBody {
        let endpoint = request
            .endpoint_identifier
            .as_deref()
            .and_then(|id| self.registry.find_by_identifier(id))
            .or_else(|| {
                request
                    .call_signal_addresses
                    .iter()
                    .find_map(|addr| self.registry.find_by_signal_address(addr))
            });
        let Some(endpoint) = endpoint else {
            return RasBody::UnregistrationReject(UnregistrationReject {
                reason: UnregistrationRejectReason::NotCurrentlyRegistered,
            });
        };
        let identifier = endpoint.identifier();

        if request.endpoint_aliases.is_empty() {
            self.remove_endpoint(identifier, RemovalCause::Unregistered, CallEndReason::EndpointUnregistered);
            return RasBody::UnregistrationConfirm;
        }

        match self.registry.remove_aliases(identifier, &request.endpoint_aliases) {
            Some(AliasRemoval::Shrunk { remaining }) => {
                debug!(endpoint = %identifier, "Aliases removed, {} left", remaining.len());
            }
            Some(AliasRemoval::Removed(removed)) => {
                self.retire_endpoint(&removed, RemovalCause::AliasesRemoved, CallEndReason::EndpointUnregistered);
            }
            None => {
                return RasBody::UnregistrationReject(UnregistrationReject {
                    reason: UnregistrationRejectReason::NotCurrentlyRegistered,
                });
            }
        }
        RasBody::UnregistrationConfirm
    }

    fn on_admission_request(&self, request: &AdmissionRequest, source: SocketAddr) -> RasBody {
        if !self.names_us(&request.gatekeeper_identifier) {
            return RasBody::AdmissionReject(AdmissionReject {
                reason: AdmissionRejectReason::UndefinedReason,
            });
        }
        match self.admission.admit(request, source) {
            Ok(admission) => {
                if admission.created {
                    self.emit(GatekeeperEvent::CallAdmitted {
                        call: admission.call.info(),
                    });
                }
                RasBody::AdmissionConfirm(admission.confirm)
            }
            Err(reason) => {
                debug!(endpoint = %request.endpoint_identifier, "ARQ rejected: {:?}", reason);
                RasBody::AdmissionReject(AdmissionReject { reason })
            }
        }
    }

    fn on_bandwidth_request(&self, request: &BandwidthRequest) -> RasBody {
        match self.admission.change_bandwidth(request) {
            Ok(bandwidth) => {
                self.emit(GatekeeperEvent::BandwidthChanged {
                    key: CallKey::new(request.call_identifier, request.answered_call),
                    bandwidth,
                });
                RasBody::BandwidthConfirm(BandwidthConfirm { bandwidth })
            }
            Err((reason, allowed_bandwidth)) => RasBody::BandwidthReject(BandwidthReject {
                reason,
                allowed_bandwidth,
            }),
        }
    }

    fn on_disengage_request(&self, request: &DisengageRequest) -> RasBody {
        match self.admission.disengage(request) {
            Ok(Some(call)) => {
                self.emit(GatekeeperEvent::CallEnded { call: call.info() });
                RasBody::DisengageConfirm
            }
            Ok(None) => RasBody::DisengageConfirm,
            Err(reason) => {
                warn!(endpoint = %request.endpoint_identifier, "DRQ rejected: {:?}", reason);
                RasBody::DisengageReject(DisengageReject { reason })
            }
        }
    }

    fn on_info_response(&self, response: &InfoRequestResponse) -> Option<RasBody> {
        let registered = self.admission.on_info_response(response);
        trace!(endpoint = %response.endpoint_identifier, registered, "Unsolicited IRR");
        if !response.need_response {
            return None;
        }
        Some(if registered {
            RasBody::InfoRequestAck
        } else {
            RasBody::InfoRequestNak(InfoRequestNak {
                reason: InfoRequestNakReason::NotRegistered,
            })
        })
    }
}

#[async_trait::async_trait]
impl RasRequestHandler for GatekeeperCore {
    async fn handle_request(&self, _channel: RasChannel, request: InboundRequest) -> Option<RasBody> {
        let source = request.source;
        trace!(%source, "Handling {}", request.message);

        let reply = match &request.message.body {
            RasBody::GatekeeperRequest(grq) => self.on_gatekeeper_request(grq),
            RasBody::RegistrationRequest(rrq) => self.on_registration_request(rrq, source),
            RasBody::UnregistrationRequest(urq) => self.on_unregistration_request(urq),
            RasBody::AdmissionRequest(arq) => self.on_admission_request(arq, source),
            RasBody::BandwidthRequest(brq) => self.on_bandwidth_request(brq),
            RasBody::DisengageRequest(drq) => self.on_disengage_request(drq),
            RasBody::InfoRequestResponse(irr) => return self.on_info_response(irr),
            other => {
                debug!(%source, "Ignoring {} request", other.kind());
                return None;
            }
        };
        Some(reply)
    }
}
