//! Gatekeeper configuration.
//!
//! One [`GatekeeperConfig`] value is built (from defaults, a TOML file or the
//! fluent builders) and handed to [`GatekeeperServer`](crate::GatekeeperServer)
//! at construction.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use h323_ras_core::TransactionConfig;
use h323_ras_core::message::{AlternateGatekeeper, Bandwidth};
use h323_ras_core::serde_duration;
use h323_ras_core::transport::{RAS_DISCOVERY_GROUP, RAS_DISCOVERY_PORT, RAS_UNICAST_PORT};
use serde::{Deserialize, Serialize};

use crate::error::{GatekeeperError, Result};

/// What to do with an admission or bandwidth request that does not fit in
/// the remaining budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandwidthPolicy {
    /// Reject the request
    #[default]
    Reject,
    /// Grant whatever is left, if anything
    CapToRemaining,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthConfig {
    /// Budget shared by all calls, in 100 bit/s units
    pub total: Bandwidth,
    /// Granted when an ARQ asks for zero
    pub default_call: Bandwidth,
    /// Upper bound granted to a single call
    pub maximum_call: Bandwidth,
    pub policy: BandwidthPolicy,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            total: 100_000,
            default_call: 1_280,
            maximum_call: 20_000,
            policy: BandwidthPolicy::Reject,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationPolicy {
    /// Let two endpoints register the same alias
    pub allow_duplicate_alias: bool,
    /// Let a new registration take over the signal address of an existing one
    pub overwrite_on_same_signal_address: bool,
    /// Reject messages that carry no valid security token
    pub require_security: bool,
    /// Granted when the RRQ asks for nothing, and the upper bound otherwise
    #[serde(with = "serde_duration::secs")]
    pub time_to_live: Duration,
    #[serde(with = "serde_duration::secs")]
    pub minimum_time_to_live: Duration,
}

impl Default for RegistrationPolicy {
    fn default() -> Self {
        Self {
            allow_duplicate_alias: false,
            overwrite_on_same_signal_address: true,
            require_security: false,
            time_to_live: Duration::from_secs(600),
            minimum_time_to_live: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionPolicy {
    /// Admit ARQs from endpoints that are not registered
    pub admit_unregistered: bool,
    /// Destination must be a registered endpoint
    pub can_only_call_registered: bool,
    /// Caller of an answered call must be a registered endpoint
    pub can_only_answer_registered: bool,
    /// Advertised in RCF
    pub make_call_pregranted: bool,
    /// Advertised in RCF
    pub answer_call_pregranted: bool,
    /// Route call signalling through `routed_signal_address`
    pub gatekeeper_routed: bool,
    pub routed_signal_address: Option<SocketAddr>,
    /// Unsolicited IRR rate demanded from endpoints in a call; `None`
    /// disables heartbeat supervision
    #[serde(with = "serde_duration::secs_opt")]
    pub info_response_rate: Option<Duration>,
    /// Also unregister an endpoint whose call failed its heartbeat probe
    pub unregister_on_heartbeat_failure: bool,
}

/// Multicast discovery listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub group: Ipv4Addr,
    pub port: u16,
    pub interface: Ipv4Addr,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            group: RAS_DISCOVERY_GROUP,
            port: RAS_DISCOVERY_PORT,
            interface: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// Complete gatekeeper configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatekeeperConfig {
    /// Gatekeeper identifier announced in GCF/RCF and checked in requests
    pub identifier: String,
    /// Unicast RAS listener
    pub ras_address: SocketAddr,
    /// Address announced to endpoints, when the listener is a wildcard
    pub advertised_ras_address: Option<SocketAddr>,
    pub discovery: DiscoveryConfig,
    pub registration: RegistrationPolicy,
    pub admission: AdmissionPolicy,
    pub bandwidth: BandwidthConfig,
    /// How often endpoint TTLs are checked
    #[serde(with = "serde_duration::secs")]
    pub ttl_sweep_interval: Duration,
    /// How often call heartbeats are checked
    #[serde(with = "serde_duration::secs")]
    pub heartbeat_sweep_interval: Duration,
    /// Alternates advertised in GCF/RCF/RRJ
    pub alternate_gatekeepers: Vec<AlternateGatekeeper>,
    pub alt_gk_is_permanent: bool,
    pub transaction: TransactionConfig,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            identifier: "h323-gatekeeper".to_string(),
            ras_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, RAS_UNICAST_PORT)),
            advertised_ras_address: None,
            discovery: DiscoveryConfig::default(),
            registration: RegistrationPolicy::default(),
            admission: AdmissionPolicy::default(),
            bandwidth: BandwidthConfig::default(),
            ttl_sweep_interval: Duration::from_secs(1),
            heartbeat_sweep_interval: Duration::from_secs(1),
            alternate_gatekeepers: Vec::new(),
            alt_gk_is_permanent: false,
            transaction: TransactionConfig::default(),
        }
    }
}

impl GatekeeperConfig {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Default::default()
        }
    }

    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: GatekeeperConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| GatekeeperError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        if self.identifier.is_empty() {
            return Err(GatekeeperError::config("gatekeeper identifier must not be empty"));
        }
        if self.bandwidth.maximum_call == 0 {
            return Err(GatekeeperError::config("maximum call bandwidth must be positive"));
        }
        if self.bandwidth.default_call > self.bandwidth.maximum_call {
            return Err(GatekeeperError::config(
                "default call bandwidth exceeds the per-call maximum",
            ));
        }
        if self.registration.minimum_time_to_live > self.registration.time_to_live {
            return Err(GatekeeperError::config(
                "minimum time to live exceeds the granted time to live",
            ));
        }
        if self.admission.gatekeeper_routed && self.admission.routed_signal_address.is_none() {
            return Err(GatekeeperError::config(
                "gatekeeper routed calls need a routed signal address",
            ));
        }
        if self.ttl_sweep_interval.is_zero() || self.heartbeat_sweep_interval.is_zero() {
            return Err(GatekeeperError::config("sweep intervals must be positive"));
        }
        Ok(())
    }

    pub fn with_ras_address(mut self, addr: SocketAddr) -> Self {
        self.ras_address = addr;
        self
    }

    pub fn with_advertised_ras_address(mut self, addr: SocketAddr) -> Self {
        self.advertised_ras_address = Some(addr);
        self
    }

    pub fn with_discovery(mut self, interface: Ipv4Addr) -> Self {
        self.discovery.enabled = true;
        self.discovery.interface = interface;
        self
    }

    pub fn with_total_bandwidth(mut self, total: Bandwidth) -> Self {
        self.bandwidth.total = total;
        self
    }

    pub fn with_call_bandwidth(mut self, default_call: Bandwidth, maximum_call: Bandwidth) -> Self {
        self.bandwidth.default_call = default_call;
        self.bandwidth.maximum_call = maximum_call;
        self
    }

    pub fn with_bandwidth_policy(mut self, policy: BandwidthPolicy) -> Self {
        self.bandwidth.policy = policy;
        self
    }

    pub fn with_registration_policy(mut self, policy: RegistrationPolicy) -> Self {
        self.registration = policy;
        self
    }

    pub fn with_admission_policy(mut self, policy: AdmissionPolicy) -> Self {
        self.admission = policy;
        self
    }

    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.registration.time_to_live = ttl;
        self.registration.minimum_time_to_live = self.registration.minimum_time_to_live.min(ttl);
        self
    }

    pub fn with_info_response_rate(mut self, rate: Duration) -> Self {
        self.admission.info_response_rate = Some(rate);
        self
    }

    pub fn with_alternate(mut self, alternate: AlternateGatekeeper) -> Self {
        self.alternate_gatekeepers.push(alternate);
        self
    }

    pub fn with_transaction_config(mut self, transaction: TransactionConfig) -> Self {
        self.transaction = transaction;
        self
    }
}
