//! Client configuration.
//!
//! ```rust
//! use std::time::Duration;
//! use h323_endpoint_core::ClientConfig;
//!
//! let config = ClientConfig::new(vec!["alice".to_string()])
//!     .with_call_signal_address("192.168.1.10:1720".parse().unwrap())
//!     .with_gatekeeper("192.168.1.1:1719".parse().unwrap(), Some("gk1".to_string()))
//!     .with_time_to_live(Some(Duration::from_secs(120)));
//!
//! assert!(config.validate().is_ok());
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use h323_ras_core::TransactionConfig;
use h323_ras_core::message::{AlternateGatekeeper, EndpointKind};
use h323_ras_core::serde_duration;
use h323_ras_core::transport::{RAS_DISCOVERY_GROUP, RAS_DISCOVERY_PORT};
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Aliases to register; the gatekeeper assigns one if empty
    pub aliases: Vec<String>,
    pub endpoint_kind: EndpointKind,
    /// Local RAS socket address
    pub ras_address: SocketAddr,
    /// RAS address put in requests, when different from the bound one
    pub advertised_ras_address: Option<SocketAddr>,
    pub call_signal_addresses: Vec<SocketAddr>,
    pub voice_prefixes: Vec<String>,

    /// Gatekeeper to discover with a unicast GRQ; multicast otherwise
    pub gatekeeper_address: Option<SocketAddr>,
    /// Identifier the gatekeeper must answer with
    pub gatekeeper_identifier: Option<String>,
    pub discovery_group: SocketAddr,
    #[serde(with = "serde_duration::secs")]
    pub discovery_timeout: Duration,

    /// Requested registration lifetime; `None` asks for no expiry
    #[serde(with = "serde_duration::secs_opt")]
    pub time_to_live: Option<Duration>,
    /// Keep-alives are sent this long before the granted lifetime ends
    #[serde(with = "serde_duration::secs")]
    pub renewal_margin: Duration,

    /// Alternates kept regardless of what gatekeepers advertise
    pub permanent_alternates: Vec<AlternateGatekeeper>,
    /// Walk the alternate list when the gatekeeper is unavailable
    pub failover: bool,
    /// Register again when the gatekeeper has forgotten us
    pub reregister_on_lost_registration: bool,
    /// First pause before registering again after a failure; doubles on
    /// each further failure
    #[serde(with = "serde_duration::secs")]
    pub reregistration_delay: Duration,
    #[serde(with = "serde_duration::secs")]
    pub max_reregistration_delay: Duration,

    pub transaction: TransactionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            aliases: Vec::new(),
            endpoint_kind: EndpointKind::Terminal,
            ras_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            advertised_ras_address: None,
            call_signal_addresses: Vec::new(),
            voice_prefixes: Vec::new(),
            gatekeeper_address: None,
            gatekeeper_identifier: None,
            discovery_group: SocketAddr::new(IpAddr::V4(RAS_DISCOVERY_GROUP), RAS_DISCOVERY_PORT),
            discovery_timeout: Duration::from_secs(5),
            time_to_live: Some(Duration::from_secs(300)),
            renewal_margin: Duration::from_secs(10),
            permanent_alternates: Vec::new(),
            failover: true,
            reregister_on_lost_registration: true,
            reregistration_delay: Duration::from_secs(5),
            max_reregistration_delay: Duration::from_secs(60),
            transaction: TransactionConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(aliases: Vec<String>) -> Self {
        Self {
            aliases,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> ClientResult<()> {
        if self.call_signal_addresses.is_empty() {
            return Err(ClientError::invalid_configuration(
                "call_signal_addresses",
                "at least one call signal address is required",
            ));
        }
        if self.discovery_timeout.is_zero() {
            return Err(ClientError::invalid_configuration(
                "discovery_timeout",
                "must be positive",
            ));
        }
        if let Some(ttl) = self.time_to_live {
            if ttl.as_secs() == 0 || ttl.as_secs() > u64::from(u32::MAX) {
                return Err(ClientError::invalid_configuration(
                    "time_to_live",
                    "must be between 1 second and u32::MAX seconds",
                ));
            }
        }
        if self.reregistration_delay.is_zero() {
            return Err(ClientError::invalid_configuration(
                "reregistration_delay",
                "must be positive",
            ));
        }
        if self.max_reregistration_delay < self.reregistration_delay {
            return Err(ClientError::invalid_configuration(
                "max_reregistration_delay",
                "shorter than reregistration_delay",
            ));
        }
        if self.aliases.iter().any(String::is_empty) {
            return Err(ClientError::invalid_configuration("aliases", "empty alias"));
        }
        Ok(())
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn with_endpoint_kind(mut self, kind: EndpointKind) -> Self {
        self.endpoint_kind = kind;
        self
    }

    pub fn with_ras_address(mut self, addr: SocketAddr) -> Self {
        self.ras_address = addr;
        self
    }

    pub fn with_advertised_ras_address(mut self, addr: SocketAddr) -> Self {
        self.advertised_ras_address = Some(addr);
        self
    }

    pub fn with_call_signal_address(mut self, addr: SocketAddr) -> Self {
        self.call_signal_addresses.push(addr);
        self
    }

    pub fn with_voice_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.voice_prefixes.push(prefix.into());
        self
    }

    pub fn with_gatekeeper(mut self, addr: SocketAddr, identifier: Option<String>) -> Self {
        self.gatekeeper_address = Some(addr);
        self.gatekeeper_identifier = identifier;
        self
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn with_time_to_live(mut self, ttl: Option<Duration>) -> Self {
        self.time_to_live = ttl;
        self
    }

    pub fn with_renewal_margin(mut self, margin: Duration) -> Self {
        self.renewal_margin = margin;
        self
    }

    pub fn with_permanent_alternate(mut self, alternate: AlternateGatekeeper) -> Self {
        self.permanent_alternates.push(alternate);
        self
    }

    pub fn with_failover(mut self, enabled: bool) -> Self {
        self.failover = enabled;
        self
    }

    pub fn with_reregister_on_lost_registration(mut self, enabled: bool) -> Self {
        self.reregister_on_lost_registration = enabled;
        self
    }

    pub fn with_reregistration_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reregistration_delay = initial;
        self.max_reregistration_delay = max;
        self
    }

    pub fn with_transaction(mut self, transaction: TransactionConfig) -> Self {
        self.transaction = transaction;
        self
    }

    /// TTL in whole seconds as carried in RRQ.
    pub(crate) fn time_to_live_secs(&self) -> Option<u32> {
        self.time_to_live
            .map(|ttl| u32::try_from(ttl.as_secs()).unwrap_or(u32::MAX))
    }
}
