//! RAS message model.
//!
//! A [`RasMessage`] is a sequence number, a list of security tokens and a
//! [`RasBody`], one variant per H.225.0 RAS message kind. Everything the
//! transaction engine needs to know about a kind (is it a request, what
//! confirm/reject answers it, how is it rejected for security reasons) is
//! answered by matching on the body.

mod reasons;
mod types;

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

pub use reasons::{
    AdmissionRejectReason, BandwidthRejectReason, DisengageRejectReason, GatekeeperRejectReason,
    InfoRequestNakReason, RegistrationRejectReason, RejectReason, UnregistrationRejectReason,
};
pub use types::{
    AlternateGatekeeper, Bandwidth, CallIdentifier, CallModel, CryptoToken, DisengageReason,
    EndpointKind, PerCallInfo, SequenceNumber, UnregistrationReason,
};

/// Kind tag of a RAS message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RasKind {
    Grq,
    Gcf,
    Grj,
    Rrq,
    Rcf,
    Rrj,
    Urq,
    Ucf,
    Urj,
    Arq,
    Acf,
    Arj,
    Brq,
    Bcf,
    Brj,
    Drq,
    Dcf,
    Drj,
    Irq,
    Irr,
    Iack,
    Inak,
    Rip,
    Xrs,
}

impl fmt::Display for RasKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RasKind::Grq => "GRQ",
            RasKind::Gcf => "GCF",
            RasKind::Grj => "GRJ",
            RasKind::Rrq => "RRQ",
            RasKind::Rcf => "RCF",
            RasKind::Rrj => "RRJ",
            RasKind::Urq => "URQ",
            RasKind::Ucf => "UCF",
            RasKind::Urj => "URJ",
            RasKind::Arq => "ARQ",
            RasKind::Acf => "ACF",
            RasKind::Arj => "ARJ",
            RasKind::Brq => "BRQ",
            RasKind::Bcf => "BCF",
            RasKind::Brj => "BRJ",
            RasKind::Drq => "DRQ",
            RasKind::Dcf => "DCF",
            RasKind::Drj => "DRJ",
            RasKind::Irq => "IRQ",
            RasKind::Irr => "IRR",
            RasKind::Iack => "IACK",
            RasKind::Inak => "INAK",
            RasKind::Rip => "RIP",
            RasKind::Xrs => "XRS",
        };
        f.write_str(name)
    }
}

/// The confirm and (optional) reject kinds that terminate a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedReply {
    pub confirm: RasKind,
    pub reject: Option<RasKind>,
}

impl ExpectedReply {
    fn new(confirm: RasKind, reject: RasKind) -> Self {
        Self {
            confirm,
            reject: Some(reject),
        }
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatekeeperRequest {
    pub ras_address: SocketAddr,
    pub endpoint_kind: EndpointKind,
    pub gatekeeper_identifier: Option<String>,
    pub endpoint_aliases: Vec<String>,
    pub supports_alt_gk: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatekeeperConfirm {
    pub gatekeeper_identifier: Option<String>,
    pub ras_address: SocketAddr,
    pub alternate_gatekeepers: Vec<AlternateGatekeeper>,
    pub alt_gk_is_permanent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatekeeperReject {
    pub reason: GatekeeperRejectReason,
    pub gatekeeper_identifier: Option<String>,
    pub alternate_gatekeepers: Vec<AlternateGatekeeper>,
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub discovery_complete: bool,
    /// Lightweight TTL refresh; carries no alias or address changes
    pub keep_alive: bool,
    pub endpoint_identifier: Option<String>,
    pub gatekeeper_identifier: Option<String>,
    pub call_signal_addresses: Vec<SocketAddr>,
    pub ras_addresses: Vec<SocketAddr>,
    pub endpoint_kind: EndpointKind,
    pub terminal_aliases: Vec<String>,
    /// Dialled-number prefixes served by a gateway
    pub voice_prefixes: Vec<String>,
    /// Requested time to live in seconds
    pub time_to_live: Option<u32>,
    pub supports_alt_gk: bool,
}

impl RegistrationRequest {
    /// Build a keep-alive RRQ for an existing registration.
    pub fn keep_alive(
        endpoint_identifier: impl Into<String>,
        gatekeeper_identifier: Option<String>,
        ras_addresses: Vec<SocketAddr>,
        time_to_live: Option<u32>,
    ) -> Self {
        Self {
            discovery_complete: true,
            keep_alive: true,
            endpoint_identifier: Some(endpoint_identifier.into()),
            gatekeeper_identifier,
            call_signal_addresses: Vec::new(),
            ras_addresses,
            endpoint_kind: EndpointKind::Terminal,
            terminal_aliases: Vec::new(),
            voice_prefixes: Vec::new(),
            time_to_live,
            supports_alt_gk: true,
        }
    }
}

/// Admission requests the gatekeeper grants without an ARQ round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PreGrantedArq {
    pub make_call: bool,
    pub answer_call: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationConfirm {
    pub endpoint_identifier: String,
    pub gatekeeper_identifier: Option<String>,
    pub call_signal_addresses: Vec<SocketAddr>,
    pub terminal_aliases: Vec<String>,
    /// Granted time to live in seconds
    pub time_to_live: Option<u32>,
    pub alternate_gatekeepers: Vec<AlternateGatekeeper>,
    pub alt_gk_is_permanent: bool,
    pub pre_granted_arq: PreGrantedArq,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationReject {
    pub reason: RegistrationRejectReason,
    pub gatekeeper_identifier: Option<String>,
    pub alternate_gatekeepers: Vec<AlternateGatekeeper>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnregistrationRequest {
    pub call_signal_addresses: Vec<SocketAddr>,
    pub endpoint_identifier: Option<String>,
    /// When non-empty, only these aliases are removed
    pub endpoint_aliases: Vec<String>,
    pub gatekeeper_identifier: Option<String>,
    pub reason: Option<UnregistrationReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnregistrationReject {
    pub reason: UnregistrationRejectReason,
}

// ---------------------------------------------------------------------------
// Admission, bandwidth, disengage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    pub call_identifier: CallIdentifier,
    pub call_reference: u16,
    pub endpoint_identifier: String,
    pub answer_call: bool,
    pub destination_info: Vec<String>,
    pub dest_call_signal_address: Option<SocketAddr>,
    pub src_info: Vec<String>,
    pub src_call_signal_address: Option<SocketAddr>,
    pub bandwidth: Bandwidth,
    pub gatekeeper_identifier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionConfirm {
    pub bandwidth: Bandwidth,
    pub call_model: CallModel,
    pub dest_call_signal_address: SocketAddr,
    pub destination_info: Vec<String>,
    /// Seconds between unsolicited IRRs the endpoint must send
    pub irr_frequency: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionReject {
    pub reason: AdmissionRejectReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandwidthRequest {
    pub endpoint_identifier: String,
    pub call_identifier: CallIdentifier,
    pub call_reference: u16,
    pub answered_call: bool,
    pub bandwidth: Bandwidth,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandwidthConfirm {
    pub bandwidth: Bandwidth,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandwidthReject {
    pub reason: BandwidthRejectReason,
    pub allowed_bandwidth: Bandwidth,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisengageRequest {
    pub endpoint_identifier: String,
    pub call_identifier: CallIdentifier,
    pub call_reference: u16,
    pub answered_call: bool,
    pub reason: DisengageReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisengageReject {
    pub reason: DisengageRejectReason,
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoRequest {
    pub call_reference: u16,
    /// Nil means "report every call"
    pub call_identifier: CallIdentifier,
    pub reply_address: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoRequestResponse {
    pub endpoint_identifier: String,
    pub ras_address: SocketAddr,
    pub call_signal_addresses: Vec<SocketAddr>,
    pub endpoint_aliases: Vec<String>,
    pub per_call_info: Vec<PerCallInfo>,
    /// Sent without an IRQ, as a heartbeat
    pub unsolicited: bool,
    /// Asks the gatekeeper to answer with IACK/INAK
    pub need_response: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoRequestNak {
    pub reason: InfoRequestNakReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestInProgress {
    /// Extra time, in milliseconds, the requester should wait
    pub delay_ms: u32,
}

/// Body of a RAS message, one variant per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RasBody {
    GatekeeperRequest(GatekeeperRequest),
    GatekeeperConfirm(GatekeeperConfirm),
    GatekeeperReject(GatekeeperReject),
    RegistrationRequest(RegistrationRequest),
    RegistrationConfirm(RegistrationConfirm),
    RegistrationReject(RegistrationReject),
    UnregistrationRequest(UnregistrationRequest),
    UnregistrationConfirm,
    UnregistrationReject(UnregistrationReject),
    AdmissionRequest(AdmissionRequest),
    AdmissionConfirm(AdmissionConfirm),
    AdmissionReject(AdmissionReject),
    BandwidthRequest(BandwidthRequest),
    BandwidthConfirm(BandwidthConfirm),
    BandwidthReject(BandwidthReject),
    DisengageRequest(DisengageRequest),
    DisengageConfirm,
    DisengageReject(DisengageReject),
    InfoRequest(InfoRequest),
    InfoRequestResponse(InfoRequestResponse),
    InfoRequestAck,
    InfoRequestNak(InfoRequestNak),
    RequestInProgress(RequestInProgress),
    UnknownMessageResponse,
}

impl RasBody {
    pub fn kind(&self) -> RasKind {
        match self {
            RasBody::GatekeeperRequest(_) => RasKind::Grq,
            RasBody::GatekeeperConfirm(_) => RasKind::Gcf,
            RasBody::GatekeeperReject(_) => RasKind::Grj,
            RasBody::RegistrationRequest(_) => RasKind::Rrq,
            RasBody::RegistrationConfirm(_) => RasKind::Rcf,
            RasBody::RegistrationReject(_) => RasKind::Rrj,
            RasBody::UnregistrationRequest(_) => RasKind::Urq,
            RasBody::UnregistrationConfirm => RasKind::Ucf,
            RasBody::UnregistrationReject(_) => RasKind::Urj,
            RasBody::AdmissionRequest(_) => RasKind::Arq,
            RasBody::AdmissionConfirm(_) => RasKind::Acf,
            RasBody::AdmissionReject(_) => RasKind::Arj,
            RasBody::BandwidthRequest(_) => RasKind::Brq,
            RasBody::BandwidthConfirm(_) => RasKind::Bcf,
            RasBody::BandwidthReject(_) => RasKind::Brj,
            RasBody::DisengageRequest(_) => RasKind::Drq,
            RasBody::DisengageConfirm => RasKind::Dcf,
            RasBody::DisengageReject(_) => RasKind::Drj,
            RasBody::InfoRequest(_) => RasKind::Irq,
            RasBody::InfoRequestResponse(_) => RasKind::Irr,
            RasBody::InfoRequestAck => RasKind::Iack,
            RasBody::InfoRequestNak(_) => RasKind::Inak,
            RasBody::RequestInProgress(_) => RasKind::Rip,
            RasBody::UnknownMessageResponse => RasKind::Xrs,
        }
    }

    /// Whether this body opens a transaction at the receiver.
    ///
    /// An IRR is a request only when it was sent unsolicited; otherwise it
    /// answers an IRQ.
    pub fn is_request(&self) -> bool {
        match self {
            RasBody::GatekeeperRequest(_)
            | RasBody::RegistrationRequest(_)
            | RasBody::UnregistrationRequest(_)
            | RasBody::AdmissionRequest(_)
            | RasBody::BandwidthRequest(_)
            | RasBody::DisengageRequest(_)
            | RasBody::InfoRequest(_) => true,
            RasBody::InfoRequestResponse(irr) => irr.unsolicited,
            _ => false,
        }
    }

    /// The replies that terminate a transaction opened by this body, or
    /// `None` when no reply is expected.
    pub fn expected_reply(&self) -> Option<ExpectedReply> {
        match self {
            RasBody::GatekeeperRequest(_) => Some(ExpectedReply::new(RasKind::Gcf, RasKind::Grj)),
            RasBody::RegistrationRequest(_) => Some(ExpectedReply::new(RasKind::Rcf, RasKind::Rrj)),
            RasBody::UnregistrationRequest(_) => Some(ExpectedReply::new(RasKind::Ucf, RasKind::Urj)),
            RasBody::AdmissionRequest(_) => Some(ExpectedReply::new(RasKind::Acf, RasKind::Arj)),
            RasBody::BandwidthRequest(_) => Some(ExpectedReply::new(RasKind::Bcf, RasKind::Brj)),
            RasBody::DisengageRequest(_) => Some(ExpectedReply::new(RasKind::Dcf, RasKind::Drj)),
            RasBody::InfoRequest(_) => Some(ExpectedReply {
                confirm: RasKind::Irr,
                reject: None,
            }),
            RasBody::InfoRequestResponse(irr) if irr.need_response => {
                Some(ExpectedReply::new(RasKind::Iack, RasKind::Inak))
            }
            _ => None,
        }
    }

    /// Reject reason carried by a reject body.
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            RasBody::GatekeeperReject(grj) => Some(RejectReason::Gatekeeper(grj.reason)),
            RasBody::RegistrationReject(rrj) => Some(RejectReason::Registration(rrj.reason.clone())),
            RasBody::UnregistrationReject(urj) => Some(RejectReason::Unregistration(urj.reason)),
            RasBody::AdmissionReject(arj) => Some(RejectReason::Admission(arj.reason)),
            RasBody::BandwidthReject(brj) => Some(RejectReason::Bandwidth(brj.reason)),
            RasBody::DisengageReject(drj) => Some(RejectReason::Disengage(drj.reason)),
            RasBody::InfoRequestNak(inak) => Some(RejectReason::InfoRequestNak(inak.reason)),
            _ => None,
        }
    }

    /// The kind-specific reject sent when a request fails token validation.
    ///
    /// Returns `None` for bodies that cannot be rejected (confirms, IRQ,
    /// IRRs that do not ask for a response).
    pub fn security_reject(&self) -> Option<RasBody> {
        let body = match self {
            RasBody::GatekeeperRequest(_) => RasBody::GatekeeperReject(GatekeeperReject {
                reason: GatekeeperRejectReason::SecurityDenial,
                gatekeeper_identifier: None,
                alternate_gatekeepers: Vec::new(),
            }),
            RasBody::RegistrationRequest(_) => RasBody::RegistrationReject(RegistrationReject {
                reason: RegistrationRejectReason::SecurityDenial,
                gatekeeper_identifier: None,
                alternate_gatekeepers: Vec::new(),
            }),
            RasBody::UnregistrationRequest(_) => RasBody::UnregistrationReject(UnregistrationReject {
                reason: UnregistrationRejectReason::SecurityDenial,
            }),
            RasBody::AdmissionRequest(_) => RasBody::AdmissionReject(AdmissionReject {
                reason: AdmissionRejectReason::SecurityDenial,
            }),
            RasBody::BandwidthRequest(_) => RasBody::BandwidthReject(BandwidthReject {
                reason: BandwidthRejectReason::SecurityDenial,
                allowed_bandwidth: 0,
            }),
            RasBody::DisengageRequest(_) => RasBody::DisengageReject(DisengageReject {
                reason: DisengageRejectReason::SecurityDenial,
            }),
            RasBody::InfoRequestResponse(irr) if irr.need_response => {
                RasBody::InfoRequestNak(InfoRequestNak {
                    reason: InfoRequestNakReason::SecurityDenial,
                })
            }
            _ => return None,
        };
        Some(body)
    }
}

/// A complete RAS message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasMessage {
    pub sequence_number: SequenceNumber,
    #[serde(default)]
    pub tokens: Vec<CryptoToken>,
    pub body: RasBody,
}

impl RasMessage {
    pub fn new(sequence_number: SequenceNumber, body: RasBody) -> Self {
        Self {
            sequence_number,
            tokens: Vec::new(),
            body,
        }
    }

    pub fn kind(&self) -> RasKind {
        self.body.kind()
    }

    pub fn is_request(&self) -> bool {
        self.body.is_request()
    }

    /// Build a reply carrying this message's sequence number.
    pub fn reply(&self, body: RasBody) -> RasMessage {
        RasMessage::new(self.sequence_number, body)
    }
}

impl fmt::Display for RasMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} seq={}", self.kind(), self.sequence_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arq() -> RasBody {
        RasBody::AdmissionRequest(AdmissionRequest {
            call_identifier: CallIdentifier::new(),
            call_reference: 7,
            endpoint_identifier: "ep".into(),
            answer_call: false,
            destination_info: vec!["2000".into()],
            dest_call_signal_address: None,
            src_info: vec!["1000".into()],
            src_call_signal_address: None,
            bandwidth: 640,
            gatekeeper_identifier: None,
        })
    }

    fn irr(unsolicited: bool, need_response: bool) -> RasBody {
        RasBody::InfoRequestResponse(InfoRequestResponse {
            endpoint_identifier: "ep".into(),
            ras_address: "127.0.0.1:1719".parse().unwrap(),
            call_signal_addresses: vec![],
            endpoint_aliases: vec![],
            per_call_info: vec![],
            unsolicited,
            need_response,
        })
    }

    #[test]
    fn test_expected_reply_per_kind() {
        let expected = arq().expected_reply().unwrap();
        assert_eq!(expected.confirm, RasKind::Acf);
        assert_eq!(expected.reject, Some(RasKind::Arj));

        let irq = RasBody::InfoRequest(InfoRequest {
            call_reference: 0,
            call_identifier: CallIdentifier::nil(),
            reply_address: None,
        });
        assert_eq!(irq.expected_reply().unwrap().confirm, RasKind::Irr);
        assert!(irq.expected_reply().unwrap().reject.is_none());

        assert!(irr(true, false).expected_reply().is_none());
        assert_eq!(irr(true, true).expected_reply().unwrap().confirm, RasKind::Iack);
        assert!(RasBody::DisengageConfirm.expected_reply().is_none());
    }

    #[test]
    fn test_irr_is_request_only_when_unsolicited() {
        assert!(irr(true, false).is_request());
        assert!(!irr(false, false).is_request());
        assert!(arq().is_request());
        assert!(!RasBody::InfoRequestAck.is_request());
    }

    #[test]
    fn test_security_reject_matches_request_kind() {
        let reject = arq().security_reject().unwrap();
        assert_eq!(reject.kind(), RasKind::Arj);
        assert_eq!(
            reject.reject_reason(),
            Some(RejectReason::Admission(AdmissionRejectReason::SecurityDenial))
        );
        assert!(irr(true, false).security_reject().is_none());
        assert_eq!(irr(true, true).security_reject().unwrap().kind(), RasKind::Inak);
    }

    #[test]
    fn test_reply_keeps_sequence_number() {
        let request = RasMessage::new(42, arq());
        let reply = request.reply(RasBody::DisengageConfirm);
        assert_eq!(reply.sequence_number, 42);
        assert_eq!(format!("{}", request), "ARQ seq=42");
    }
}
