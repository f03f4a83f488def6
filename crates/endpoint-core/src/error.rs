//! Error types for the gatekeeper client
//!
//! Transport and engine failures come from `h323-ras-core`; everything a
//! gatekeeper can answer with that is not a confirm is turned into one of
//! the protocol variants below by [`ClientError::from_outcome`].

use h323_ras_core::message::{Bandwidth, CallIdentifier};
use h323_ras_core::{RejectReason, TransactionOutcome, ValidationResult};
use thiserror::Error;

use crate::state::RegistrationFailure;

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors raised by [`GatekeeperClient`](crate::GatekeeperClient) operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport, codec or transaction engine failure
    #[error("RAS error: {0}")]
    Ras(#[from] h323_ras_core::Error),

    /// The client configuration is unusable
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    /// No gatekeeper confirmed discovery before the timeout
    #[error("Gatekeeper discovery failed: {reason}")]
    DiscoveryFailed { reason: String },

    /// Registration ended in the failed state
    #[error("Registration failed: {0}")]
    RegistrationFailed(RegistrationFailure),

    /// The operation needs a registration the client does not hold
    #[error("Not registered with a gatekeeper")]
    NotRegistered,

    /// The gatekeeper rejected the request
    #[error("Request rejected: {reason:?}")]
    Rejected { reason: RejectReason },

    /// No gatekeeper answered within the attempt limit
    #[error("No response from gatekeeper")]
    NoResponse,

    /// The reply failed token validation
    #[error("Reply failed security validation: {0}")]
    SecurityFailure(ValidationResult),

    /// BRJ for lack of bandwidth, with what the gatekeeper could grant
    #[error("Insufficient bandwidth, {allowed} available")]
    InsufficientBandwidth { allowed: Bandwidth },

    /// The call is not known to the client
    #[error("Unknown call {0}")]
    CallNotFound(CallIdentifier),
}

/// Coarse classification of a [`ClientError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Network,
    Protocol,
    Security,
    State,
}

impl ClientError {
    /// Create an invalid configuration error
    pub fn invalid_configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a discovery failure
    pub fn discovery_failed(reason: impl Into<String>) -> Self {
        Self::DiscoveryFailed {
            reason: reason.into(),
        }
    }

    /// Map a transaction that did not confirm to an error.
    ///
    /// A confirm of the wrong body kind is reported as a mismatched reject.
    pub fn from_outcome(outcome: TransactionOutcome) -> Self {
        match outcome {
            TransactionOutcome::Rejected { reason, .. }
            | TransactionOutcome::TryAlternate { reason, .. } => Self::Rejected { reason },
            TransactionOutcome::BadCryptoTokens { result, .. } => Self::SecurityFailure(result),
            TransactionOutcome::NoResponse => Self::NoResponse,
            TransactionOutcome::Confirmed(_) => Self::Rejected {
                reason: RejectReason::Mismatched,
            },
        }
    }

    /// The reject reason, if the gatekeeper answered with a reject.
    pub fn reject_reason(&self) -> Option<&RejectReason> {
        match self {
            Self::Rejected { reason } => Some(reason),
            _ => None,
        }
    }

    /// Check if retrying the operation later may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::InvalidConfiguration { .. } | Self::SecurityFailure(_) | Self::CallNotFound(_) => false,

            Self::Ras(_)
            | Self::DiscoveryFailed { .. }
            | Self::NoResponse
            | Self::NotRegistered
            | Self::InsufficientBandwidth { .. } => true,

            Self::Rejected { reason } => reason.is_try_alternate() || reason.is_lost_registration(),
            Self::RegistrationFailed(failure) => failure.is_recoverable(),
        }
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidConfiguration { .. } => ErrorCategory::Configuration,
            Self::Ras(_) | Self::NoResponse | Self::DiscoveryFailed { .. } => ErrorCategory::Network,
            Self::Rejected { .. } | Self::RegistrationFailed(_) | Self::InsufficientBandwidth { .. } => {
                ErrorCategory::Protocol
            }
            Self::SecurityFailure(_) => ErrorCategory::Security,
            Self::NotRegistered | Self::CallNotFound(_) => ErrorCategory::State,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use h323_ras_core::message::{AdmissionRejectReason, RegistrationRejectReason};

    #[test]
    fn test_outcome_mapping() {
        let error = ClientError::from_outcome(TransactionOutcome::NoResponse);
        assert!(matches!(error, ClientError::NoResponse));
        assert_eq!(error.category(), ErrorCategory::Network);
        assert!(error.is_recoverable());
    }

    #[test]
    fn test_reject_recoverability() {
        let denied = ClientError::Rejected {
            reason: RejectReason::Admission(AdmissionRejectReason::RequestDenied),
        };
        assert!(!denied.is_recoverable());

        let lost = ClientError::Rejected {
            reason: RejectReason::Registration(RegistrationRejectReason::FullRegistrationRequired),
        };
        assert!(lost.is_recoverable());
        assert_eq!(
            lost.reject_reason(),
            Some(&RejectReason::Registration(RegistrationRejectReason::FullRegistrationRequired))
        );
    }
}
