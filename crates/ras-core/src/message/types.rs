//! Field types shared by several RAS message bodies.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// RAS sequence number. Zero is reserved and never allocated.
pub type SequenceNumber = u16;

/// Bandwidth in units of 100 bits/s, as carried on the wire.
pub type Bandwidth = u32;

/// Globally unique call identifier (H.225.0 `CallIdentifier`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallIdentifier(pub Uuid);

impl CallIdentifier {
    /// Generate a fresh random call identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The all-zero identifier, used by IRQ to mean "every call".
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for CallIdentifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque security token attached to a RAS message.
///
/// The content is produced and interpreted only by an [`Authenticator`];
/// the transaction engine carries tokens around without looking inside.
///
/// [`Authenticator`]: crate::auth::Authenticator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoToken {
    /// Name of the authenticator (mechanism) that produced the token
    pub mechanism: String,
    /// Sender identity claimed by the token, if any
    pub sender_id: Option<String>,
    /// Timestamp in seconds since the epoch, if the mechanism uses one
    pub timestamp: Option<u32>,
    /// Mechanism-specific payload
    pub payload: Vec<u8>,
}

impl CryptoToken {
    pub fn new(mechanism: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            mechanism: mechanism.into(),
            sender_id: None,
            timestamp: None,
            payload,
        }
    }
}

/// Alternate gatekeeper as advertised in GCF/RCF/RRJ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternateGatekeeper {
    /// RAS address of the alternate
    pub ras_address: SocketAddr,
    /// Gatekeeper identifier of the alternate
    pub gatekeeper_identifier: Option<String>,
    /// Lower value means higher priority
    pub priority: u8,
    /// Whether the endpoint must register with the alternate before using it
    pub need_to_register: bool,
}

impl AlternateGatekeeper {
    pub fn new(ras_address: SocketAddr, priority: u8) -> Self {
        Self {
            ras_address,
            gatekeeper_identifier: None,
            priority,
            need_to_register: true,
        }
    }
}

/// Kind of endpoint registering with the gatekeeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EndpointKind {
    #[default]
    Terminal,
    Gateway,
    Mcu,
    Gatekeeper,
}

/// Call signalling model granted in ACF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CallModel {
    #[default]
    Direct,
    GatekeeperRouted,
}

/// Per-call entry of an IRR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerCallInfo {
    pub call_identifier: CallIdentifier,
    pub call_reference: u16,
    pub bandwidth: Bandwidth,
    /// True when the reporting endpoint answered the call
    pub answered_call: bool,
    /// Set once the call has been alerted
    pub alerting: bool,
    /// Set once the call has been connected
    pub connected: bool,
}

/// Reason carried by a DRQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DisengageReason {
    ForcedDrop,
    #[default]
    NormalDrop,
    UndefinedReason,
}

/// Reason carried by a gatekeeper or endpoint initiated URQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UnregistrationReason {
    ReregistrationRequired,
    TtlExpired,
    SecurityDenial,
    #[default]
    UndefinedReason,
    Maintenance,
}
