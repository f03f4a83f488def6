//! H.323 gatekeeper for the h323 stack
//!
//! This crate provides the endpoint registry, the call admission controller
//! with its bandwidth ledger, and the RAS server that ties them to the
//! transaction engine of `h323-ras-core`.

pub mod admission;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod registry;
pub mod server;

// Re-export commonly used types
pub use admission::{
    Admission, AdmissionController, AliasResolver, BandwidthLedger, CallDirection, CallEndReason,
    CallInfo, CallKey, GatekeeperCall, RegistryResolver, Route,
};
pub use config::{
    AdmissionPolicy, BandwidthConfig, BandwidthPolicy, DiscoveryConfig, GatekeeperConfig,
    RegistrationPolicy,
};
pub use error::{GatekeeperError, Result};
pub use events::{GatekeeperEvent, RemovalCause};
pub use logging::{LoggingConfig, parse_log_level, setup_logging};
pub use registry::{AliasRemoval, EndpointInfo, EndpointRegistry, RegisteredEndpoint, Registration};
pub use server::{GatekeeperServer, Listener};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        AdmissionController, BandwidthPolicy, CallEndReason, CallInfo, EndpointRegistry,
        GatekeeperConfig, GatekeeperError, GatekeeperEvent, GatekeeperServer, RemovalCause, Result,
    };
}
