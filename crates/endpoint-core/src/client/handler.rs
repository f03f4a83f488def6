use std::net::SocketAddr;
use std::sync::Arc;

use h323_ras_core::message::{
    DisengageRequest, InfoRequest, InfoRequestResponse, RasBody, UnregistrationReject,
    UnregistrationRejectReason, UnregistrationRequest,
};
use h323_ras_core::{InboundRequest, RasChannel, RasRequestHandler};
use tracing::{debug, info};

use super::{ClientShared, GatekeeperClient};
use crate::events::ClientEvent;
use crate::state::{ClientState, RegistrationFailure};

/// Answers the requests a gatekeeper sends to its endpoints.
pub(crate) struct ClientHandler {
    shared: Arc<ClientShared>,
}

impl ClientHandler {
    pub(crate) fn new(shared: Arc<ClientShared>) -> Self {
        Self { shared }
    }

    fn on_info_request(&self, irq: &InfoRequest) -> RasBody {
        let endpoint_identifier = self
            .shared
            .session
            .lock()
            .endpoint_identifier
            .clone()
            .unwrap_or_default();
        let per_call_info = self.shared.calls.per_call_info(irq.call_identifier);
        debug!("IRQ for {} calls, reporting {}", irq.call_identifier, per_call_info.len());

        RasBody::InfoRequestResponse(InfoRequestResponse {
            endpoint_identifier,
            ras_address: self.shared.ras_address,
            call_signal_addresses: self.shared.config.call_signal_addresses.clone(),
            endpoint_aliases: self.shared.config.aliases.clone(),
            per_call_info,
            unsolicited: false,
            need_response: false,
        })
    }

    fn on_unregistration_request(
        &self,
        client: &GatekeeperClient,
        urq: &UnregistrationRequest,
        source: SocketAddr,
    ) -> RasBody {
        let ours = {
            let session = self.shared.session.lock();
            match (&session.endpoint_identifier, &urq.endpoint_identifier) {
                (Some(ours), Some(theirs)) => ours == theirs,
                // Without an identifier only our gatekeeper is believed
                (Some(_), None) => session.gatekeeper == Some(source),
                (None, _) => false,
            }
        };
        if !ours {
            debug!("URQ from {} for {:?}, not registered as that", source, urq.endpoint_identifier);
            return RasBody::UnregistrationReject(UnregistrationReject {
                reason: UnregistrationRejectReason::NotCurrentlyRegistered,
            });
        }

        info!("Gatekeeper {} unregistered us ({:?})", source, urq.reason);
        self.shared.clear_registration(
            ClientState::Unregistered,
            RegistrationFailure::UnregisteredByGatekeeper,
        );
        client.spawn_reregistration("unregistered by gatekeeper");
        RasBody::UnregistrationConfirm
    }

    fn on_disengage_request(&self, drq: &DisengageRequest) -> RasBody {
        match self.shared.calls.remove(&(drq.call_identifier, drq.answered_call)) {
            Some(call) => {
                info!(call = %call.call_identifier, "Gatekeeper dropped call ({:?})", drq.reason);
                self.shared.emit(ClientEvent::CallDisengaged {
                    call_identifier: call.call_identifier,
                    reason: drq.reason,
                });
            }
            None => debug!(call = %drq.call_identifier, "DRQ for unknown call"),
        }
        RasBody::DisengageConfirm
    }
}

#[async_trait::async_trait]
impl RasRequestHandler for ClientHandler {
    async fn handle_request(&self, channel: RasChannel, request: InboundRequest) -> Option<RasBody> {
        let InboundRequest { message, source } = request;
        match &message.body {
            RasBody::InfoRequest(irq) => Some(self.on_info_request(irq)),
            RasBody::UnregistrationRequest(urq) => {
                let client = GatekeeperClient {
                    shared: self.shared.clone(),
                    channel,
                };
                Some(self.on_unregistration_request(&client, urq, source))
            }
            RasBody::DisengageRequest(drq) => Some(self.on_disengage_request(drq)),
            other => {
                debug!("Ignoring {:?} from {}", other.kind(), source);
                None
            }
        }
    }
}
