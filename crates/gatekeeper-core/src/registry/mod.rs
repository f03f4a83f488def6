//! # Endpoint Registry
//!
//! Endpoints are stored once, by identifier, as `Arc<RegisteredEndpoint>`.
//! Secondary indices (exact alias, alias prefix, call signalling address and
//! voice prefix) map to identifiers and live together behind one lock, so an
//! endpoint enters or leaves every index in a single step. Lookups go through
//! an index and then back to the primary map, and never return an endpoint
//! that has been removed.
//!
//! Lock order is: index lock, then an endpoint's own lock.

mod endpoint;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use h323_ras_core::message::{RegistrationRejectReason, RegistrationRequest};
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::RegistrationPolicy;

pub use endpoint::{EndpointInfo, RegisteredEndpoint};
use endpoint::EndpointState;

/// Result of an accepted RRQ.
#[derive(Debug, Clone)]
pub struct Registration {
    pub endpoint: Arc<RegisteredEndpoint>,
    /// A new endpoint was created
    pub created: bool,
    /// Only the TTL was refreshed
    pub keep_alive: bool,
    pub time_to_live: Duration,
    /// Endpoints displaced because they claimed the same signal address
    pub replaced: Vec<Arc<RegisteredEndpoint>>,
}

/// Result of removing aliases from an endpoint.
#[derive(Debug, Clone)]
pub enum AliasRemoval {
    /// The endpoint keeps these aliases
    Shrunk { remaining: Vec<String> },
    /// The last alias went, and the endpoint with it
    Removed(Arc<RegisteredEndpoint>),
}

#[derive(Default)]
struct Indices {
    /// Alias to endpoint identifiers, in registration order
    aliases: BTreeMap<String, Vec<String>>,
    signal_addresses: HashMap<SocketAddr, String>,
    voice_prefixes: BTreeMap<String, String>,
}

impl Indices {
    fn insert(&mut self, identifier: &str, state: &EndpointState) {
        for alias in &state.aliases {
            let owners = self.aliases.entry(alias.clone()).or_default();
            if !owners.iter().any(|id| id == identifier) {
                owners.push(identifier.to_string());
            }
        }
        for addr in &state.call_signal_addresses {
            self.signal_addresses.insert(*addr, identifier.to_string());
        }
        for prefix in &state.voice_prefixes {
            self.voice_prefixes.insert(prefix.clone(), identifier.to_string());
        }
    }

    fn remove(&mut self, identifier: &str, state: &EndpointState) {
        for alias in &state.aliases {
            self.remove_alias(identifier, alias);
        }
        for addr in &state.call_signal_addresses {
            if self.signal_addresses.get(addr).is_some_and(|id| id == identifier) {
                self.signal_addresses.remove(addr);
            }
        }
        for prefix in &state.voice_prefixes {
            if self.voice_prefixes.get(prefix).is_some_and(|id| id == identifier) {
                self.voice_prefixes.remove(prefix);
            }
        }
    }

    fn remove_alias(&mut self, identifier: &str, alias: &str) {
        if let Some(owners) = self.aliases.get_mut(alias) {
            owners.retain(|id| id != identifier);
            if owners.is_empty() {
                self.aliases.remove(alias);
            }
        }
    }
}

/// Registry of endpoints registered with this gatekeeper.
pub struct EndpointRegistry {
    policy: RegistrationPolicy,
    endpoints: DashMap<String, Arc<RegisteredEndpoint>>,
    indices: RwLock<Indices>,
    identifier_base: String,
    next_identifier: AtomicU64,
}

impl EndpointRegistry {
    pub fn new(policy: RegistrationPolicy) -> Self {
        Self {
            policy,
            endpoints: DashMap::new(),
            indices: RwLock::new(Indices::default()),
            identifier_base: format!("{:08x}", rand::random::<u32>()),
            next_identifier: AtomicU64::new(1),
        }
    }

    pub fn policy(&self) -> &RegistrationPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Handle an RRQ received from `source`.
    pub fn register(
        &self,
        request: &RegistrationRequest,
        source: SocketAddr,
    ) -> Result<Registration, RegistrationRejectReason> {
        if request.keep_alive {
            return self.keep_alive(request);
        }
        if request.call_signal_addresses.is_empty() {
            return Err(RegistrationRejectReason::InvalidCallSignalAddress);
        }

        let time_to_live = self.grant_time_to_live(request.time_to_live);
        let ras_addresses = if request.ras_addresses.is_empty() {
            vec![source]
        } else {
            request.ras_addresses.clone()
        };

        let mut indices = self.indices.write();

        let existing = request
            .endpoint_identifier
            .as_deref()
            .and_then(|id| self.find_by_identifier(id));
        let identifier = match &existing {
            Some(endpoint) => endpoint.identifier().to_string(),
            None => self.allocate_identifier(),
        };

        let mut aliases: Vec<String> = Vec::new();
        for alias in &request.terminal_aliases {
            if !alias.is_empty() && !aliases.contains(alias) {
                aliases.push(alias.clone());
            }
        }
        if aliases.is_empty() {
            aliases.push(identifier.clone());
        }

        if !self.policy.allow_duplicate_alias {
            let duplicates: Vec<String> = aliases
                .iter()
                .filter(|alias| {
                    indices.aliases.get(alias.as_str()).is_some_and(|owners| {
                        owners
                            .iter()
                            .any(|id| *id != identifier && self.endpoints.contains_key(id))
                    })
                })
                .cloned()
                .collect();
            if !duplicates.is_empty() {
                debug!("Rejecting registration of {:?}: aliases in use", duplicates);
                return Err(RegistrationRejectReason::DuplicateAlias(duplicates));
            }
        }

        let mut displaced: HashSet<String> = HashSet::new();
        for addr in &request.call_signal_addresses {
            if let Some(owner) = indices.signal_addresses.get(addr) {
                if *owner != identifier {
                    displaced.insert(owner.clone());
                }
            }
        }
        if !displaced.is_empty() && !self.policy.overwrite_on_same_signal_address {
            debug!("Rejecting registration: signal address already registered by {:?}", displaced);
            return Err(RegistrationRejectReason::InvalidCallSignalAddress);
        }
        let replaced: Vec<Arc<RegisteredEndpoint>> = displaced
            .iter()
            .filter_map(|id| self.remove_locked(&mut indices, id))
            .collect();

        let created = existing.is_none();
        let endpoint = match existing {
            Some(endpoint) => {
                let mut state = endpoint.lock();
                indices.remove(&identifier, &state);
                state.aliases = aliases;
                state.call_signal_addresses = request.call_signal_addresses.clone();
                state.ras_addresses = ras_addresses;
                state.voice_prefixes = request.voice_prefixes.clone();
                state.kind = request.endpoint_kind;
                state.time_to_live = time_to_live;
                state.last_seen = Instant::now();
                state.probing = false;
                indices.insert(&identifier, &state);
                drop(state);
                endpoint
            }
            None => {
                let state = EndpointState {
                    aliases,
                    call_signal_addresses: request.call_signal_addresses.clone(),
                    ras_addresses,
                    voice_prefixes: request.voice_prefixes.clone(),
                    kind: request.endpoint_kind,
                    time_to_live,
                    last_seen: Instant::now(),
                    active_calls: HashSet::new(),
                    probing: false,
                    removed: false,
                };
                indices.insert(&identifier, &state);
                let endpoint = Arc::new(RegisteredEndpoint::new(identifier.clone(), state));
                self.endpoints.insert(identifier.clone(), endpoint.clone());
                endpoint
            }
        };
        drop(indices);

        info!(
            endpoint = %identifier,
            created,
            "Registered endpoint with aliases {:?}, ttl {:?}",
            endpoint.aliases(),
            time_to_live
        );
        Ok(Registration {
            endpoint,
            created,
            keep_alive: false,
            time_to_live,
            replaced,
        })
    }

    fn keep_alive(&self, request: &RegistrationRequest) -> Result<Registration, RegistrationRejectReason> {
        let endpoint = request
            .endpoint_identifier
            .as_deref()
            .and_then(|id| self.find_by_identifier(id))
            .ok_or(RegistrationRejectReason::FullRegistrationRequired)?;

        let time_to_live = self.grant_time_to_live(request.time_to_live);
        {
            let mut state = endpoint.lock();
            if state.removed {
                return Err(RegistrationRejectReason::FullRegistrationRequired);
            }
            state.time_to_live = time_to_live;
            state.last_seen = Instant::now();
            state.probing = false;
        }
        debug!(endpoint = %endpoint.identifier(), "Keep-alive, ttl {:?}", time_to_live);

        Ok(Registration {
            endpoint,
            created: false,
            keep_alive: true,
            time_to_live,
            replaced: Vec::new(),
        })
    }

    /// Remove some aliases of an endpoint. Removing the last one removes
    /// the endpoint. Returns `None` if the endpoint is not registered.
    pub fn remove_aliases(&self, identifier: &str, aliases: &[String]) -> Option<AliasRemoval> {
        let mut indices = self.indices.write();
        let endpoint = self.find_by_identifier(identifier)?;

        let remaining: Vec<String> = {
            let state = endpoint.lock();
            state
                .aliases
                .iter()
                .filter(|alias| !aliases.contains(alias))
                .cloned()
                .collect()
        };

        if remaining.is_empty() {
            let removed = self.remove_locked(&mut indices, identifier)?;
            info!(endpoint = %identifier, "Last alias removed, endpoint unregistered");
            return Some(AliasRemoval::Removed(removed));
        }

        let mut state = endpoint.lock();
        for alias in aliases {
            indices.remove_alias(identifier, alias);
        }
        state.aliases = remaining.clone();
        debug!(endpoint = %identifier, "Aliases {:?} removed", aliases);
        Some(AliasRemoval::Shrunk { remaining })
    }

    /// Remove an endpoint from the registry and every index.
    pub fn unregister(&self, identifier: &str) -> Option<Arc<RegisteredEndpoint>> {
        let mut indices = self.indices.write();
        let removed = self.remove_locked(&mut indices, identifier);
        if removed.is_some() {
            info!(endpoint = %identifier, "Endpoint unregistered");
        }
        removed
    }

    /// Remove `endpoint` only if it is still the registered entry for its
    /// identifier and its TTL has lapsed at `now`. A keep-alive that got in
    /// first wins.
    pub fn unregister_lapsed(
        &self,
        endpoint: &Arc<RegisteredEndpoint>,
        now: Instant,
    ) -> Option<Arc<RegisteredEndpoint>> {
        let identifier = endpoint.identifier();
        let mut indices = self.indices.write();
        let current = self.endpoints.get(identifier).map(|e| e.value().clone())?;
        if !Arc::ptr_eq(&current, endpoint) {
            return None;
        }
        {
            let mut state = endpoint.lock();
            if state.removed || now.saturating_duration_since(state.last_seen) <= state.time_to_live {
                return None;
            }
            state.removed = true;
            indices.remove(identifier, &state);
        }
        self.endpoints.remove(identifier);
        info!(endpoint = %identifier, "Endpoint registration lapsed");
        Some(current)
    }

    fn remove_locked(&self, indices: &mut Indices, identifier: &str) -> Option<Arc<RegisteredEndpoint>> {
        let (_, endpoint) = self.endpoints.remove(identifier)?;
        {
            let mut state = endpoint.lock();
            state.removed = true;
            indices.remove(identifier, &state);
        }
        Some(endpoint)
    }

    pub fn find_by_identifier(&self, identifier: &str) -> Option<Arc<RegisteredEndpoint>> {
        let endpoint = self.endpoints.get(identifier).map(|e| e.value().clone())?;
        (!endpoint.is_removed()).then_some(endpoint)
    }

    pub fn find_by_alias(&self, alias: &str) -> Option<Arc<RegisteredEndpoint>> {
        let owners = self.indices.read().aliases.get(alias).cloned()?;
        owners.iter().find_map(|id| self.find_by_identifier(id))
    }

    /// Endpoint with an alias starting with `partial`.
    pub fn find_by_partial_alias(&self, partial: &str) -> Option<Arc<RegisteredEndpoint>> {
        if partial.is_empty() {
            return None;
        }
        let candidates: Vec<String> = {
            let indices = self.indices.read();
            indices
                .aliases
                .range::<str, _>((Bound::Included(partial), Bound::Unbounded))
                .take_while(|(alias, _)| alias.starts_with(partial))
                .flat_map(|(_, owners)| owners.iter().cloned())
                .collect()
        };
        candidates.iter().find_map(|id| self.find_by_identifier(id))
    }

    pub fn find_by_signal_address(&self, addr: &SocketAddr) -> Option<Arc<RegisteredEndpoint>> {
        let owner = self.indices.read().signal_addresses.get(addr).cloned()?;
        self.find_by_identifier(&owner)
    }

    /// Gateway whose voice prefix is the longest prefix of `number`.
    pub fn find_by_voice_prefix(&self, number: &str) -> Option<Arc<RegisteredEndpoint>> {
        let owner = {
            let indices = self.indices.read();
            (1..=number.len())
                .rev()
                .filter(|len| number.is_char_boundary(*len))
                .find_map(|len| indices.voice_prefixes.get(&number[..len]).cloned())
        }?;
        self.find_by_identifier(&owner)
    }

    /// Resolve dialled aliases: exact alias first, then the longest voice
    /// prefix, then a partial alias.
    pub fn resolve(&self, aliases: &[String]) -> Option<Arc<RegisteredEndpoint>> {
        aliases
            .iter()
            .find_map(|alias| self.find_by_alias(alias))
            .or_else(|| aliases.iter().find_map(|alias| self.find_by_voice_prefix(alias)))
            .or_else(|| aliases.iter().find_map(|alias| self.find_by_partial_alias(alias)))
    }

    /// Endpoints whose TTL has lapsed at `now`.
    pub fn expired(&self, now: Instant) -> Vec<Arc<RegisteredEndpoint>> {
        self.endpoints()
            .into_iter()
            .filter(|endpoint| endpoint.is_expired(now))
            .collect()
    }

    pub fn endpoints(&self) -> Vec<Arc<RegisteredEndpoint>> {
        self.endpoints.iter().map(|e| e.value().clone()).collect()
    }

    fn allocate_identifier(&self) -> String {
        let n = self.next_identifier.fetch_add(1, Ordering::Relaxed);
        format!("{}_{}", self.identifier_base, n)
    }

    fn grant_time_to_live(&self, requested: Option<u32>) -> Duration {
        match requested {
            Some(secs) if secs > 0 => Duration::from_secs(secs as u64)
                .max(self.policy.minimum_time_to_live)
                .min(self.policy.time_to_live),
            _ => self.policy.time_to_live,
        }
    }
}

impl std::fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("endpoints", &self.endpoints.len())
            .field("policy", &self.policy)
            .finish()
    }
}
