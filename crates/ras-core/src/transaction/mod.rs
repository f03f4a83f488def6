//! # RAS Transaction Engine
//!
//! Turns every RAS exchange into what looks like a synchronous call with a
//! bounded latency, over a datagram transport that may drop, duplicate or
//! reorder packets.
//!
//! ## Client side
//!
//! [`RasChannel::request`] allocates a sequence number, registers the
//! request in the pending table and sends it to every candidate address.
//! The calling task then waits on its own signal channel:
//!
//! ```text
//!                ┌──────────────── RIP(delay): extend deadline ─────┐
//!                ▼                                                  │
//!   send ──▶ AwaitingResponse ──timeout, attempts left──▶ resend ───┘
//!                │
//!                ├── confirm kind ─────────────▶ Confirmed
//!                ├── reject kind ──────────────▶ Rejected / TryAlternate
//!                ├── other kind ───────────────▶ Rejected(Mismatched)
//!                ├── token validation fails ───▶ BadCryptoTokens
//!                └── attempts exhausted ───────▶ NoResponse
//! ```
//!
//! ## Server side
//!
//! Inbound requests are looked up by `(source, sequence)` in the response
//! cache first. A cached reply is resent verbatim; a request whose first copy
//! is still being handled is held until that reply exists. New requests are
//! validated by the authenticator chain, then handed to the
//! [`RasRequestHandler`]. A handler slower than the fast-response budget
//! makes the channel send a RIP and keep waiting in the background.

mod cache;
mod channel;
mod pending;
mod sequence;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::ValidationResult;
use crate::message::{RasMessage, RejectReason};

pub use channel::{InboundRequest, RasChannel, RasChannelBuilder, RasRequestHandler};
pub use sequence::SequenceAllocator;

/// Timing and retry parameters of a RAS channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Number of times a request is sent before giving up
    pub max_attempts: u32,
    /// Time to wait for a reply after each send
    #[serde(with = "crate::serde_duration::millis")]
    pub request_timeout: Duration,
    /// Time a handler may take before a RIP is sent on its behalf
    #[serde(with = "crate::serde_duration::millis")]
    pub fast_response_budget: Duration,
    /// Delay announced in RIP messages
    #[serde(with = "crate::serde_duration::millis")]
    pub request_in_progress_delay: Duration,
    /// Idle time after which a cached reply is discarded
    #[serde(with = "crate::serde_duration::millis")]
    pub response_retire_period: Duration,
    /// How often the response cache is swept
    #[serde(with = "crate::serde_duration::millis")]
    pub cache_sweep_interval: Duration,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            request_timeout: Duration::from_secs(3),
            fast_response_budget: Duration::from_millis(500),
            request_in_progress_delay: Duration::from_secs(8),
            response_retire_period: Duration::from_secs(30),
            cache_sweep_interval: Duration::from_secs(5),
        }
    }
}

impl TransactionConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_fast_response_budget(mut self, budget: Duration) -> Self {
        self.fast_response_budget = budget;
        self
    }

    pub fn with_request_in_progress_delay(mut self, delay: Duration) -> Self {
        // RIP carries the delay in a 16-bit millisecond field
        self.request_in_progress_delay = delay.min(Duration::from_millis(u16::MAX as u64));
        self
    }

    pub fn with_response_retire_period(mut self, period: Duration) -> Self {
        self.response_retire_period = period;
        self
    }
}

/// How a client transaction ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome {
    /// The expected confirm arrived
    Confirmed(RasMessage),
    /// A reject arrived, or a reply of the wrong kind
    Rejected { reply: RasMessage, reason: RejectReason },
    /// A reject asking the requester to use another gatekeeper
    TryAlternate { reply: RasMessage, reason: RejectReason },
    /// The reply failed token validation
    BadCryptoTokens {
        reply: RasMessage,
        result: ValidationResult,
    },
    /// Every attempt timed out
    NoResponse,
}

impl TransactionOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, TransactionOutcome::Confirmed(_))
    }

    /// The confirm message, if the transaction succeeded.
    pub fn confirmed(&self) -> Option<&RasMessage> {
        match self {
            TransactionOutcome::Confirmed(message) => Some(message),
            _ => None,
        }
    }

    pub fn into_confirmed(self) -> Option<RasMessage> {
        match self {
            TransactionOutcome::Confirmed(message) => Some(message),
            _ => None,
        }
    }

    pub fn reject_reason(&self) -> Option<&RejectReason> {
        match self {
            TransactionOutcome::Rejected { reason, .. }
            | TransactionOutcome::TryAlternate { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Whether a client should walk its alternate gatekeeper list.
    pub fn should_try_alternate(&self) -> bool {
        matches!(
            self,
            TransactionOutcome::TryAlternate { .. } | TransactionOutcome::NoResponse
        )
    }
}

impl fmt::Display for TransactionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionOutcome::Confirmed(reply) => write!(f, "confirmed ({})", reply),
            TransactionOutcome::Rejected { reason, .. } => write!(f, "rejected ({:?})", reason),
            TransactionOutcome::TryAlternate { reason, .. } => {
                write!(f, "try alternate ({:?})", reason)
            }
            TransactionOutcome::BadCryptoTokens { result, .. } => {
                write!(f, "bad crypto tokens ({})", result)
            }
            TransactionOutcome::NoResponse => write!(f, "no response"),
        }
    }
}
