//! Authenticator chain.
//!
//! Individual mechanisms (password hashes, challenge-response, keyed-hash
//! signatures) implement [`Authenticator`]. The transaction engine only talks
//! to an [`AuthenticatorChain`]: it asks the chain to add tokens to every
//! outgoing message and to validate the tokens of every incoming one.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::message::RasMessage;

/// Result of validating the tokens of a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    /// Tokens present and valid
    Ok,
    /// The mechanism found no token it understands
    Absent,
    /// Token malformed or unusable
    Error,
    /// Credentials did not match
    BadPassword,
    /// Token was replayed
    ReplayAttack,
    /// Timestamp outside the accepted window
    InvalidTime,
    /// The mechanism is switched off
    Disabled,
    /// Validation failed for another reason
    Failed,
}

impl ValidationResult {
    /// Whether the result is an explicit failure, as opposed to a mechanism
    /// that simply had nothing to check.
    pub fn is_failure(&self) -> bool {
        !matches!(
            self,
            ValidationResult::Ok | ValidationResult::Absent | ValidationResult::Disabled
        )
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One security mechanism.
pub trait Authenticator: Send + Sync {
    /// Mechanism name, matched against [`CryptoToken::mechanism`](crate::message::CryptoToken).
    fn name(&self) -> &str;

    /// Whether the mechanism takes part in the chain.
    fn is_active(&self) -> bool {
        true
    }

    /// Attach this mechanism's tokens to an outgoing message.
    fn prepare_tokens(&self, message: &mut RasMessage);

    /// Validate the tokens of an incoming message. `raw` is the datagram as
    /// received, for mechanisms that sign the encoded bytes.
    fn validate_tokens(&self, message: &RasMessage, raw: &[u8]) -> ValidationResult;
}

/// Ordered set of authenticators consulted as a unit.
#[derive(Clone, Default)]
pub struct AuthenticatorChain {
    authenticators: Vec<Arc<dyn Authenticator>>,
    require_tokens: bool,
}

impl AuthenticatorChain {
    /// An empty chain that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an authenticator at the end of the chain.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticators.push(authenticator);
        self
    }

    /// Treat messages without any valid token as failures.
    pub fn with_required_tokens(mut self, required: bool) -> Self {
        self.require_tokens = required;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.authenticators.is_empty()
    }

    pub fn requires_tokens(&self) -> bool {
        self.require_tokens
    }

    /// Let every active authenticator add its tokens.
    pub fn prepare_tokens(&self, message: &mut RasMessage) {
        for authenticator in self.authenticators.iter().filter(|a| a.is_active()) {
            authenticator.prepare_tokens(message);
        }
    }

    /// Validate an incoming message against the chain.
    ///
    /// The first explicit failure wins. If no mechanism accepted a token the
    /// result is `Absent`, which is only a failure when tokens are required.
    pub fn validate_tokens(&self, message: &RasMessage, raw: &[u8]) -> ValidationResult {
        let mut accepted = false;
        for authenticator in self.authenticators.iter().filter(|a| a.is_active()) {
            match authenticator.validate_tokens(message, raw) {
                ValidationResult::Ok => {
                    debug!("{} accepted by {}", message, authenticator.name());
                    accepted = true;
                }
                ValidationResult::Absent | ValidationResult::Disabled => {}
                failure => {
                    warn!("{} failed {} validation: {}", message, authenticator.name(), failure);
                    return failure;
                }
            }
        }

        if accepted {
            ValidationResult::Ok
        } else if self.require_tokens {
            warn!("{} carries no acceptable security token", message);
            ValidationResult::Absent
        } else if self.authenticators.is_empty() {
            ValidationResult::Disabled
        } else {
            ValidationResult::Absent
        }
    }

    /// Validate and reduce the result to pass/fail under the chain's policy.
    pub fn accepts(&self, message: &RasMessage, raw: &[u8]) -> Result<(), ValidationResult> {
        let result = self.validate_tokens(message, raw);
        if result.is_failure() || (self.require_tokens && result != ValidationResult::Ok) {
            Err(result)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for AuthenticatorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.authenticators.iter().map(|a| a.name()).collect();
        f.debug_struct("AuthenticatorChain")
            .field("authenticators", &names)
            .field("require_tokens", &self.require_tokens)
            .finish()
    }
}
