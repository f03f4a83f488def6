//! # Alternate Gatekeepers
//!
//! The list of gatekeepers the client may fail over to. Gatekeepers
//! advertise alternates in GCF and RCF; the client merges every new
//! advertisement into its list:
//!
//! 1. entries marked permanent are kept,
//! 2. every other entry is replaced by the advertisement,
//! 3. the result is ordered by priority (lowest value first), ties keeping
//!    their previous order.
//!
//! ```rust
//! use h323_endpoint_core::AlternateList;
//! use h323_ras_core::message::AlternateGatekeeper;
//!
//! let a = AlternateGatekeeper::new("10.0.0.2:1719".parse().unwrap(), 1);
//! let b = AlternateGatekeeper::new("10.0.0.3:1719".parse().unwrap(), 2);
//! let c = AlternateGatekeeper::new("10.0.0.4:1719".parse().unwrap(), 0);
//!
//! let mut list = AlternateList::new();
//! list.merge(&[b.clone()], true);
//! list.merge(&[a.clone()], false);
//! list.merge(&[c.clone()], false);
//!
//! // b survived both refreshes, a was replaced by c
//! let addresses: Vec<_> = list.entries().iter().map(|e| e.address).collect();
//! assert_eq!(addresses, vec![c.ras_address, b.ras_address]);
//! ```

use std::net::SocketAddr;

use h323_ras_core::message::AlternateGatekeeper;
use serde::{Deserialize, Serialize};

/// Whether the client holds a registration with an alternate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlternateRegistrationState {
    /// The alternate shares registrations with the current gatekeeper
    NotNeeded,
    NeedToRegister,
    Registering,
    Registered,
    Failed,
}

/// One alternate gatekeeper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternateEntry {
    pub address: SocketAddr,
    pub identifier: Option<String>,
    pub priority: u8,
    /// Kept across refreshes
    pub permanent: bool,
    pub registration_state: AlternateRegistrationState,
}

impl AlternateEntry {
    pub fn from_advertised(alternate: &AlternateGatekeeper, permanent: bool) -> Self {
        Self {
            address: alternate.ras_address,
            identifier: alternate.gatekeeper_identifier.clone(),
            priority: alternate.priority,
            permanent,
            registration_state: if alternate.need_to_register {
                AlternateRegistrationState::NeedToRegister
            } else {
                AlternateRegistrationState::NotNeeded
            },
        }
    }

    /// Whether a registration must be made before other requests are sent
    /// to this alternate.
    pub fn needs_registration(&self) -> bool {
        matches!(
            self.registration_state,
            AlternateRegistrationState::NeedToRegister | AlternateRegistrationState::Failed
        )
    }
}

/// Priority ordered alternate gatekeepers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlternateList {
    entries: Vec<AlternateEntry>,
}

impl AlternateList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an advertisement into the list.
    pub fn merge(&mut self, advertised: &[AlternateGatekeeper], permanent: bool) {
        let mut merged: Vec<AlternateEntry> = self.entries.drain(..).filter(|e| e.permanent).collect();

        for alternate in advertised {
            if let Some(existing) = merged.iter_mut().find(|e| e.address == alternate.ras_address) {
                // Re-advertised permanent entry: refresh details, stay permanent
                existing.priority = alternate.priority;
                if alternate.gatekeeper_identifier.is_some() {
                    existing.identifier = alternate.gatekeeper_identifier.clone();
                }
                continue;
            }
            merged.push(AlternateEntry::from_advertised(alternate, permanent));
        }

        merged.sort_by_key(|e| e.priority);
        self.entries = merged;
    }

    pub fn entries(&self) -> &[AlternateEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Alternates to try, in priority order, skipping `current`.
    pub fn candidates(&self, current: SocketAddr) -> Vec<AlternateEntry> {
        self.entries
            .iter()
            .filter(|e| e.address != current)
            .cloned()
            .collect()
    }

    pub fn set_state(&mut self, address: SocketAddr, state: AlternateRegistrationState) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.address == address) {
            entry.registration_state = state;
        }
    }

    pub fn find(&self, address: SocketAddr) -> Option<&AlternateEntry> {
        self.entries.iter().find(|e| e.address == address)
    }
}
