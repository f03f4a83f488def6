//! Registration state of the client and the reasons it can fail.

use std::fmt;

use h323_ras_core::message::RegistrationRejectReason;
use serde::{Deserialize, Serialize};

/// Where the client stands with its gatekeeper.
///
/// ```text
/// Unregistered ─▶ Discovering ─▶ Registering ─▶ Registered ─┬─▶ Unregistering ─▶ Unregistered
///                                                          ├─▶ ReRegistering ─▶ Registered
///                                                          └─▶ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ClientState {
    #[default]
    Unregistered,
    Discovering,
    Registering,
    Registered,
    Unregistering,
    ReRegistering,
    Failed,
}

impl ClientState {
    pub fn is_registered(&self) -> bool {
        matches!(self, ClientState::Registered)
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Unregistered => "unregistered",
            ClientState::Discovering => "discovering",
            ClientState::Registering => "registering",
            ClientState::Registered => "registered",
            ClientState::Unregistering => "unregistering",
            ClientState::ReRegistering => "re-registering",
            ClientState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why the client is not (or no longer) registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationFailure {
    /// The application unregistered
    UnregisteredLocally,
    /// The gatekeeper sent a URQ
    UnregisteredByGatekeeper,
    /// A keep-alive or request showed the gatekeeper forgot us
    GatekeeperLostRegistration,
    /// The gatekeeper refused our RAS or call signalling address
    InvalidListener,
    /// Aliases already registered by another endpoint
    DuplicateAlias(Vec<String>),
    /// Token validation failed in either direction
    SecurityDenied,
    /// No gatekeeper answered
    TransportError,
    /// Any other RRJ
    Rejected(RegistrationRejectReason),
}

impl RegistrationFailure {
    /// Classify an RRJ reason.
    pub fn from_reject(reason: RegistrationRejectReason) -> Self {
        match reason {
            RegistrationRejectReason::DuplicateAlias(aliases) => Self::DuplicateAlias(aliases),
            RegistrationRejectReason::SecurityDenial | RegistrationRejectReason::SecurityError => {
                Self::SecurityDenied
            }
            RegistrationRejectReason::InvalidCallSignalAddress
            | RegistrationRejectReason::InvalidRasAddress
            | RegistrationRejectReason::TransportNotSupported => Self::InvalidListener,
            RegistrationRejectReason::FullRegistrationRequired
            | RegistrationRejectReason::DiscoveryRequired => Self::GatekeeperLostRegistration,
            other => Self::Rejected(other),
        }
    }

    /// Whether registering again without changing anything may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::UnregisteredByGatekeeper
                | Self::GatekeeperLostRegistration
                | Self::TransportError
                | Self::Rejected(RegistrationRejectReason::ResourceUnavailable)
        )
    }
}

impl fmt::Display for RegistrationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnregisteredLocally => f.write_str("unregistered locally"),
            Self::UnregisteredByGatekeeper => f.write_str("unregistered by gatekeeper"),
            Self::GatekeeperLostRegistration => f.write_str("gatekeeper lost registration"),
            Self::InvalidListener => f.write_str("invalid listener address"),
            Self::DuplicateAlias(aliases) => write!(f, "duplicate alias {:?}", aliases),
            Self::SecurityDenied => f.write_str("security denied"),
            Self::TransportError => f.write_str("transport error"),
            Self::Rejected(reason) => write!(f, "rejected ({:?})", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_classification() {
        assert_eq!(
            RegistrationFailure::from_reject(RegistrationRejectReason::DuplicateAlias(vec!["alice".into()])),
            RegistrationFailure::DuplicateAlias(vec!["alice".into()])
        );
        assert_eq!(
            RegistrationFailure::from_reject(RegistrationRejectReason::SecurityError),
            RegistrationFailure::SecurityDenied
        );
        assert_eq!(
            RegistrationFailure::from_reject(RegistrationRejectReason::InvalidRasAddress),
            RegistrationFailure::InvalidListener
        );
        assert_eq!(
            RegistrationFailure::from_reject(RegistrationRejectReason::InvalidAlias),
            RegistrationFailure::Rejected(RegistrationRejectReason::InvalidAlias)
        );
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ClientState::ReRegistering.to_string(), "re-registering");
        assert!(ClientState::Registered.is_registered());
        assert!(!ClientState::Failed.is_registered());
    }
}
