//! H.323 endpoint side of RAS for the h323 stack
//!
//! This crate provides [`GatekeeperClient`]: gatekeeper discovery,
//! registration with keep-alive renewal, call admission, bandwidth and
//! disengage requests, and failover to alternate gatekeepers. It is built on
//! the transaction engine of `h323-ras-core`.

pub mod alternates;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod state;

// Re-export commonly used types
pub use alternates::{AlternateEntry, AlternateList, AlternateRegistrationState};
pub use client::{ActiveCall, AdmissionParams, GatekeeperClient};
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult, ErrorCategory};
pub use events::ClientEvent;
pub use state::{ClientState, RegistrationFailure};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        ActiveCall, AdmissionParams, ClientConfig, ClientError, ClientEvent, ClientResult,
        ClientState, GatekeeperClient, RegistrationFailure,
    };
}
