use std::net::SocketAddr;
use std::sync::Arc;

use crate::registry::EndpointRegistry;

/// Where a call to some aliases should be signalled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub signal_address: SocketAddr,
    /// Call signalling must go through the gatekeeper
    pub gatekeeper_routed: bool,
    /// Registered endpoint the route leads to, if any
    pub endpoint_identifier: Option<String>,
    /// Aliases of the destination
    pub aliases: Vec<String>,
}

/// Routing policy consulted for every originating ARQ.
pub trait AliasResolver: Send + Sync {
    fn resolve(&self, aliases: &[String]) -> Option<Route>;
}

/// Routes to endpoints registered with this gatekeeper.
#[derive(Debug, Clone)]
pub struct RegistryResolver {
    registry: Arc<EndpointRegistry>,
}

impl RegistryResolver {
    pub fn new(registry: Arc<EndpointRegistry>) -> Self {
        Self { registry }
    }
}

impl AliasResolver for RegistryResolver {
    fn resolve(&self, aliases: &[String]) -> Option<Route> {
        let endpoint = self.registry.resolve(aliases)?;
        Some(Route {
            signal_address: endpoint.signal_address()?,
            gatekeeper_routed: false,
            endpoint_identifier: Some(endpoint.identifier().to_string()),
            aliases: endpoint.aliases(),
        })
    }
}
