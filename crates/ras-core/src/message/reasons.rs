//! Reject reasons, one enum per reject message kind.
//!
//! Names follow H.225.0. Only the reasons the gatekeeper produces or the
//! client reacts to are modelled; anything else decodes as `UndefinedReason`.

use serde::{Deserialize, Serialize};

/// GRJ reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatekeeperRejectReason {
    ResourceUnavailable,
    TerminalExcluded,
    InvalidRevision,
    UndefinedReason,
    SecurityDenial,
    SecurityError,
}

/// RRJ reasons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationRejectReason {
    DiscoveryRequired,
    InvalidRevision,
    InvalidCallSignalAddress,
    InvalidRasAddress,
    /// Aliases already registered by another endpoint
    DuplicateAlias(Vec<String>),
    InvalidTerminalType,
    UndefinedReason,
    TransportNotSupported,
    ResourceUnavailable,
    InvalidAlias,
    SecurityDenial,
    FullRegistrationRequired,
    SecurityError,
}

/// URJ reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnregistrationRejectReason {
    NotCurrentlyRegistered,
    CallInProgress,
    UndefinedReason,
    PermissionDenied,
    SecurityDenial,
    SecurityError,
}

/// ARJ reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdmissionRejectReason {
    CalledPartyNotRegistered,
    InvalidPermission,
    /// No bandwidth available
    RequestDenied,
    UndefinedReason,
    CallerNotRegistered,
    RouteCallToGatekeeper,
    InvalidEndpointIdentifier,
    ResourceUnavailable,
    SecurityDenial,
    IncompleteAddress,
    AliasesInconsistent,
    ExceedsCallCapacity,
    SecurityError,
    NoRouteToDestination,
}

/// BRJ reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BandwidthRejectReason {
    NotBound,
    InvalidConferenceId,
    InvalidPermission,
    InsufficientResources,
    InvalidRevision,
    UndefinedReason,
    SecurityDenial,
    SecurityError,
}

/// DRJ reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisengageRejectReason {
    NotRegistered,
    RequestToDropOther,
    SecurityDenial,
    SecurityError,
}

/// INAK reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InfoRequestNakReason {
    NotRegistered,
    UndefinedReason,
    RequestDenied,
    SecurityDenial,
    SecurityError,
}

/// Reject reason of a finished transaction, tagged by the reject kind that
/// carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    Gatekeeper(GatekeeperRejectReason),
    Registration(RegistrationRejectReason),
    Unregistration(UnregistrationRejectReason),
    Admission(AdmissionRejectReason),
    Bandwidth(BandwidthRejectReason),
    Disengage(DisengageRejectReason),
    InfoRequestNak(InfoRequestNakReason),
    /// The reply kind did not belong to the request; there is no meaningful
    /// reason code.
    Mismatched,
}

impl RejectReason {
    /// Whether this reject tells the requester to try an alternate
    /// gatekeeper rather than give up.
    pub fn is_try_alternate(&self) -> bool {
        matches!(
            self,
            RejectReason::Gatekeeper(GatekeeperRejectReason::ResourceUnavailable)
                | RejectReason::Registration(RegistrationRejectReason::ResourceUnavailable)
                | RejectReason::Admission(
                    AdmissionRejectReason::ResourceUnavailable
                        | AdmissionRejectReason::CallerNotRegistered
                )
                | RejectReason::Bandwidth(BandwidthRejectReason::NotBound)
                | RejectReason::Disengage(DisengageRejectReason::NotRegistered)
                | RejectReason::InfoRequestNak(InfoRequestNakReason::NotRegistered)
        )
    }

    /// Whether the reject means the gatekeeper has lost the registration and
    /// a full re-registration is needed.
    pub fn is_lost_registration(&self) -> bool {
        matches!(
            self,
            RejectReason::Registration(
                RegistrationRejectReason::FullRegistrationRequired
                    | RegistrationRejectReason::DiscoveryRequired
            ) | RejectReason::Admission(AdmissionRejectReason::CallerNotRegistered)
                | RejectReason::Unregistration(UnregistrationRejectReason::NotCurrentlyRegistered)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_alternate_table() {
        assert!(RejectReason::Gatekeeper(GatekeeperRejectReason::ResourceUnavailable).is_try_alternate());
        assert!(RejectReason::Registration(RegistrationRejectReason::ResourceUnavailable).is_try_alternate());
        assert!(RejectReason::Admission(AdmissionRejectReason::CallerNotRegistered).is_try_alternate());
        assert!(RejectReason::Bandwidth(BandwidthRejectReason::NotBound).is_try_alternate());
        assert!(RejectReason::Disengage(DisengageRejectReason::NotRegistered).is_try_alternate());
        assert!(RejectReason::InfoRequestNak(InfoRequestNakReason::NotRegistered).is_try_alternate());

        assert!(!RejectReason::Admission(AdmissionRejectReason::RequestDenied).is_try_alternate());
        assert!(!RejectReason::Registration(RegistrationRejectReason::DuplicateAlias(vec![])).is_try_alternate());
        assert!(!RejectReason::Mismatched.is_try_alternate());
    }

    #[test]
    fn test_lost_registration_class() {
        assert!(RejectReason::Registration(RegistrationRejectReason::FullRegistrationRequired).is_lost_registration());
        assert!(RejectReason::Registration(RegistrationRejectReason::DiscoveryRequired).is_lost_registration());
        assert!(!RejectReason::Registration(RegistrationRejectReason::SecurityDenial).is_lost_registration());
    }
}
