//! # Gatekeeper Client
//!
//! The endpoint side of RAS. A [`GatekeeperClient`] discovers a gatekeeper,
//! registers with it, keeps the registration alive and asks it for call
//! admission. When the gatekeeper stops answering, or tells the client to
//! go elsewhere, requests are retried against the alternate gatekeepers in
//! priority order.
//!
//! ```no_run
//! use h323_endpoint_core::{AdmissionParams, ClientConfig, GatekeeperClient};
//! use h323_ras_core::AuthenticatorChain;
//!
//! # async fn example() -> h323_endpoint_core::ClientResult<()> {
//! let config = ClientConfig::new(vec!["alice".to_string()])
//!     .with_ras_address("192.168.1.10:1719".parse().unwrap())
//!     .with_call_signal_address("192.168.1.10:1720".parse().unwrap());
//!
//! let client = GatekeeperClient::bind(config, AuthenticatorChain::new()).await?;
//! let endpoint_identifier = client.register().await?;
//! println!("Registered as {}", endpoint_identifier);
//!
//! let call = client
//!     .admission_request(AdmissionParams::outgoing(vec!["bob".to_string()], 640))
//!     .await?;
//! println!("Call bob at {}", call.destination);
//!
//! client.unregister().await?;
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod calls;
mod failover;
mod handler;
mod maintenance;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use h323_ras_core::message::{
    AdmissionRequest, AlternateGatekeeper, Bandwidth, BandwidthRejectReason, BandwidthRequest,
    CallIdentifier, DisengageReason, DisengageRequest, GatekeeperConfirm, GatekeeperRequest,
    InfoRequestResponse, PerCallInfo, RasBody, RegistrationConfirm, RegistrationRejectReason,
    RegistrationRequest, UnregistrationRejectReason, UnregistrationRequest,
};
use h323_ras_core::{
    AuthenticatorChain, RasChannel, RasRequestHandler, RejectReason, TransactionOutcome, Transport,
    TransportEvent, UdpTransport,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::alternates::{AlternateEntry, AlternateList, AlternateRegistrationState};
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::events::ClientEvent;
use crate::state::{ClientState, RegistrationFailure};

pub use calls::{ActiveCall, AdmissionParams};

use calls::CallTable;
use failover::Binding;
use handler::ClientHandler;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Registration state guarded by one lock.
#[derive(Debug, Default)]
struct Session {
    state: ClientState,
    gatekeeper: Option<SocketAddr>,
    gatekeeper_identifier: Option<String>,
    endpoint_identifier: Option<String>,
    /// Granted lifetime in seconds
    time_to_live: Option<u32>,
    /// When the last RCF arrived
    confirmed_at: Option<Instant>,
    alternates: AlternateList,
    last_failure: Option<RegistrationFailure>,
    /// Registered at some point and not unregistered on request since;
    /// failures are then retried in the background
    recovering: bool,
}

struct ClientShared {
    config: ClientConfig,
    /// RAS address put in requests
    ras_address: SocketAddr,
    session: Mutex<Session>,
    calls: CallTable,
    call_references: AtomicU16,
    /// Set while a request is being retried against alternates
    failing_over: AtomicBool,
    events: broadcast::Sender<ClientEvent>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl ClientShared {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, new: ClientState) {
        let old = std::mem::replace(&mut self.session.lock().state, new);
        if old != new {
            debug!("Client state {} -> {}", old, new);
            self.emit(ClientEvent::StateChanged { old, new });
        }
    }

    fn state(&self) -> ClientState {
        self.session.lock().state
    }

    /// The gatekeeper requests go to, once one is known.
    fn binding(&self) -> Option<Binding> {
        let session = self.session.lock();
        session.gatekeeper.map(|gatekeeper| Binding {
            gatekeeper,
            gatekeeper_identifier: session.gatekeeper_identifier.clone(),
            endpoint_identifier: session.endpoint_identifier.clone(),
        })
    }

    fn next_call_reference(&self) -> u16 {
        loop {
            // Call reference zero is reserved
            let reference = self.call_references.fetch_add(1, Ordering::Relaxed) & 0x7fff;
            if reference != 0 {
                return reference;
            }
        }
    }

    /// Drop the registration and every call, and record why.
    fn clear_registration(&self, state: ClientState, failure: RegistrationFailure) {
        {
            let mut session = self.session.lock();
            session.endpoint_identifier = None;
            session.time_to_live = None;
            session.confirmed_at = None;
            if failure == RegistrationFailure::UnregisteredLocally {
                session.recovering = false;
            }
            session.last_failure = Some(failure.clone());
        }
        let dropped = self.calls.clear();
        if !dropped.is_empty() {
            debug!("Dropped {} calls with the registration", dropped.len());
        }
        self.set_state(state);
        self.emit(ClientEvent::Unregistered { failure });
    }

    /// Move requests to another gatekeeper that confirmed for us.
    fn switch_to(&self, binding: &Binding) {
        let previous = {
            let mut session = self.session.lock();
            let previous = session.gatekeeper.replace(binding.gatekeeper);
            if previous != Some(binding.gatekeeper) {
                session.gatekeeper_identifier = binding.gatekeeper_identifier.clone();
            }
            previous
        };
        if let Some(from) = previous {
            if from != binding.gatekeeper {
                info!("Gatekeeper changed from {} to {}", from, binding.gatekeeper);
                self.emit(ClientEvent::GatekeeperChanged {
                    from,
                    to: binding.gatekeeper,
                });
            }
        }
    }

    fn merge_alternates(&self, advertised: &[AlternateGatekeeper], permanent: bool) {
        let alternates = {
            let mut session = self.session.lock();
            let before = session.alternates.clone();
            session.alternates.merge(advertised, permanent);
            if session.alternates == before {
                return;
            }
            session.alternates.entries().to_vec()
        };
        debug!("Alternate gatekeepers now {:?}", alternates.iter().map(|a| a.address).collect::<Vec<_>>());
        self.emit(ClientEvent::AlternatesUpdated { alternates });
    }

    fn set_alternate_state(&self, address: SocketAddr, state: AlternateRegistrationState) {
        self.session.lock().alternates.set_state(address, state);
    }

    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = future => {}
            }
        });
    }
}

/// Handle to a RAS client bound to one local address. Cheap to clone.
#[derive(Clone)]
pub struct GatekeeperClient {
    shared: Arc<ClientShared>,
    channel: RasChannel,
}

impl GatekeeperClient {
    /// Bind a UDP socket at the configured RAS address and start the client.
    pub async fn bind(config: ClientConfig, authenticators: AuthenticatorChain) -> ClientResult<Self> {
        config.validate()?;
        let (transport, events) = UdpTransport::bind(config.ras_address, None).await?;
        Self::start_on(config, authenticators, Arc::new(transport), events)
    }

    /// Start the client on an already bound transport.
    pub fn start_on(
        config: ClientConfig,
        authenticators: AuthenticatorChain,
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> ClientResult<Self> {
        config.validate()?;
        let ras_address = match config.advertised_ras_address {
            Some(addr) => addr,
            None => transport.local_addr()?,
        };

        let mut alternates = AlternateList::new();
        alternates.merge(&config.permanent_alternates, true);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(ClientShared {
            ras_address,
            session: Mutex::new(Session {
                alternates,
                ..Session::default()
            }),
            calls: CallTable::default(),
            call_references: AtomicU16::new(1),
            failing_over: AtomicBool::new(false),
            events: events_tx,
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            config,
        });

        let handler: Arc<dyn RasRequestHandler> = Arc::new(ClientHandler::new(shared.clone()));
        let channel = RasChannel::builder(transport, events)
            .with_config(shared.config.transaction.clone())
            .with_authenticators(authenticators)
            .with_handler(handler)
            .start()?;

        let client = Self { shared, channel };
        client.shared.spawn(maintenance::run(client.clone()));
        info!("Gatekeeper client listening on {}", client.channel.local_addr());
        Ok(client)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ClientState {
        self.shared.state()
    }

    pub fn endpoint_identifier(&self) -> Option<String> {
        self.shared.session.lock().endpoint_identifier.clone()
    }

    /// Gatekeeper currently bound to.
    pub fn gatekeeper(&self) -> Option<SocketAddr> {
        self.shared.session.lock().gatekeeper
    }

    pub fn gatekeeper_identifier(&self) -> Option<String> {
        self.shared.session.lock().gatekeeper_identifier.clone()
    }

    /// Lifetime granted by the last RCF, in seconds.
    pub fn time_to_live(&self) -> Option<u32> {
        self.shared.session.lock().time_to_live
    }

    pub fn alternates(&self) -> Vec<AlternateEntry> {
        self.shared.session.lock().alternates.entries().to_vec()
    }

    pub fn last_failure(&self) -> Option<RegistrationFailure> {
        self.shared.session.lock().last_failure.clone()
    }

    pub fn active_calls(&self) -> Vec<ActiveCall> {
        self.shared.calls.all()
    }

    pub fn active_call_count(&self) -> usize {
        self.shared.calls.len()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.channel.local_addr()
    }

    /// RAS address announced to gatekeepers.
    pub fn ras_address(&self) -> SocketAddr {
        self.shared.ras_address
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Find a gatekeeper with GRQ.
    ///
    /// The GRQ goes to the configured gatekeeper address, or to the
    /// discovery group when there is none. Rejects and silence do not end
    /// discovery; the GRQ is repeated until a confirm arrives or the
    /// discovery timeout passes.
    pub async fn discover(&self) -> ClientResult<SocketAddr> {
        let config = &self.shared.config;
        let target = config.gatekeeper_address.unwrap_or(config.discovery_group);
        let grq = RasBody::GatekeeperRequest(GatekeeperRequest {
            ras_address: self.shared.ras_address,
            endpoint_kind: config.endpoint_kind,
            gatekeeper_identifier: config.gatekeeper_identifier.clone(),
            endpoint_aliases: config.aliases.clone(),
            supports_alt_gk: true,
        });

        self.shared.set_state(ClientState::Discovering);
        let deadline = Instant::now() + config.discovery_timeout;
        debug!("Discovering gatekeeper via {} until {:?}", target, config.discovery_timeout);

        loop {
            let outcome = match tokio::time::timeout_at(deadline, self.channel.request(grq.clone(), &[target])).await {
                Err(_) => break,
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    self.shared.set_state(ClientState::Failed);
                    return Err(e.into());
                }
            };

            match outcome {
                TransactionOutcome::Confirmed(reply) => match reply.body {
                    RasBody::GatekeeperConfirm(gcf) if self.accepts_gatekeeper(&gcf) => {
                        return Ok(self.on_discovered(gcf));
                    }
                    other => debug!("Ignoring discovery answer {}", other.kind()),
                },
                TransactionOutcome::NoResponse => {
                    debug!("No gatekeeper answered GRQ to {}", target);
                    continue;
                }
                other => debug!("Discovery answer ignored: {}", other),
            }

            // Give another gatekeeper time to answer before asking again
            let pause = Instant::now() + config.transaction.request_timeout;
            tokio::time::sleep_until(pause.min(deadline)).await;
            if Instant::now() >= deadline {
                break;
            }
        }

        warn!("Gatekeeper discovery via {} timed out", target);
        self.shared.session.lock().last_failure = Some(RegistrationFailure::TransportError);
        self.shared.set_state(ClientState::Failed);
        Err(ClientError::discovery_failed(format!(
            "no gatekeeper confirmed within {:?}",
            config.discovery_timeout
        )))
    }

    fn accepts_gatekeeper(&self, gcf: &GatekeeperConfirm) -> bool {
        match (&self.shared.config.gatekeeper_identifier, &gcf.gatekeeper_identifier) {
            (Some(wanted), Some(answered)) => wanted == answered,
            _ => true,
        }
    }

    fn on_discovered(&self, gcf: GatekeeperConfirm) -> SocketAddr {
        info!("Discovered gatekeeper {:?} at {}", gcf.gatekeeper_identifier, gcf.ras_address);
        {
            let mut session = self.shared.session.lock();
            session.gatekeeper = Some(gcf.ras_address);
            session.gatekeeper_identifier = gcf
                .gatekeeper_identifier
                .clone()
                .or_else(|| self.shared.config.gatekeeper_identifier.clone());
        }
        self.shared.merge_alternates(&gcf.alternate_gatekeepers, gcf.alt_gk_is_permanent);
        self.shared.emit(ClientEvent::Discovered {
            address: gcf.ras_address,
            identifier: gcf.gatekeeper_identifier,
        });
        gcf.ras_address
    }

    fn full_registration(&self, binding: &Binding) -> RasBody {
        let config = &self.shared.config;
        RasBody::RegistrationRequest(RegistrationRequest {
            discovery_complete: true,
            keep_alive: false,
            endpoint_identifier: binding.endpoint_identifier.clone(),
            gatekeeper_identifier: binding.gatekeeper_identifier.clone(),
            call_signal_addresses: config.call_signal_addresses.clone(),
            ras_addresses: vec![self.shared.ras_address],
            endpoint_kind: config.endpoint_kind,
            terminal_aliases: config.aliases.clone(),
            voice_prefixes: config.voice_prefixes.clone(),
            time_to_live: config.time_to_live_secs(),
            supports_alt_gk: true,
        })
    }

    /// Register with the gatekeeper, discovering one first if needed.
    ///
    /// Returns the endpoint identifier the gatekeeper assigned.
    pub async fn register(&self) -> ClientResult<String> {
        if self.shared.binding().is_none() {
            self.discover().await?;
        }
        if self.state() != ClientState::ReRegistering {
            self.shared.set_state(ClientState::Registering);
        }

        let (outcome, binding) = match self.transact(|binding| self.full_registration(binding)).await {
            Ok(result) => result,
            Err(e) => {
                self.registration_failed(RegistrationFailure::TransportError);
                return Err(e);
            }
        };

        if let TransactionOutcome::Confirmed(reply) = &outcome {
            if let RasBody::RegistrationConfirm(rcf) = &reply.body {
                return Ok(self.on_registered(rcf.clone(), &binding));
            }
        }
        let failure = registration_failure(&outcome);
        Err(self.registration_failed(failure))
    }

    fn on_registered(&self, rcf: RegistrationConfirm, binding: &Binding) -> String {
        self.shared.switch_to(binding);
        {
            let mut session = self.shared.session.lock();
            session.endpoint_identifier = Some(rcf.endpoint_identifier.clone());
            if rcf.gatekeeper_identifier.is_some() {
                session.gatekeeper_identifier = rcf.gatekeeper_identifier.clone();
            }
            session.time_to_live = rcf.time_to_live;
            session.confirmed_at = Some(Instant::now());
            session.last_failure = None;
            session.recovering = true;
        }
        self.shared.merge_alternates(&rcf.alternate_gatekeepers, rcf.alt_gk_is_permanent);
        self.shared
            .set_alternate_state(binding.gatekeeper, AlternateRegistrationState::Registered);

        let refreshed = self.state().is_registered();
        self.shared.set_state(ClientState::Registered);
        if !refreshed {
            info!(
                endpoint = %rcf.endpoint_identifier,
                "Registered with {} (ttl {:?})",
                binding.gatekeeper,
                rcf.time_to_live
            );
            self.shared.emit(ClientEvent::Registered {
                endpoint_identifier: rcf.endpoint_identifier.clone(),
                gatekeeper: binding.gatekeeper,
                time_to_live: rcf.time_to_live,
            });
        }
        rcf.endpoint_identifier
    }

    fn registration_failed(&self, failure: RegistrationFailure) -> ClientError {
        warn!("Registration failed: {}", failure);
        {
            let mut session = self.shared.session.lock();
            session.last_failure = Some(failure.clone());
            session.confirmed_at = None;
        }
        self.shared.set_state(ClientState::Failed);
        self.shared.emit(ClientEvent::RegistrationFailed {
            failure: failure.clone(),
        });
        ClientError::RegistrationFailed(failure)
    }

    /// Binding of a registered client.
    fn registered(&self) -> ClientResult<(Binding, String)> {
        if !self.state().is_registered() {
            return Err(ClientError::NotRegistered);
        }
        let binding = self.shared.binding().ok_or(ClientError::NotRegistered)?;
        let identifier = binding
            .endpoint_identifier
            .clone()
            .ok_or(ClientError::NotRegistered)?;
        Ok((binding, identifier))
    }

    /// Refresh the registration with a lightweight RRQ.
    ///
    /// When the gatekeeper has lost the registration, or cannot be reached,
    /// the client registers again in full, failing over if need be.
    pub async fn keep_alive(&self) -> ClientResult<()> {
        self.registered()?;
        let config = &self.shared.config;
        let (outcome, binding) = self
            .transact(|binding| {
                let mut rrq = RegistrationRequest::keep_alive(
                    binding.endpoint_identifier.clone().unwrap_or_default(),
                    binding.gatekeeper_identifier.clone(),
                    vec![self.shared.ras_address],
                    config.time_to_live_secs(),
                );
                rrq.endpoint_kind = config.endpoint_kind;
                RasBody::RegistrationRequest(rrq)
            })
            .await?;

        if let TransactionOutcome::Confirmed(reply) = &outcome {
            if let RasBody::RegistrationConfirm(rcf) = &reply.body {
                debug!("Keep-alive confirmed by {}", binding.gatekeeper);
                self.on_registered(rcf.clone(), &binding);
                return Ok(());
            }
        }

        let lost = outcome.should_try_alternate()
            || outcome.reject_reason().is_some_and(RejectReason::is_lost_registration);
        if lost && config.reregister_on_lost_registration {
            info!("Keep-alive failed ({}), registering again", outcome);
            self.shared.set_state(ClientState::ReRegistering);
            return self.register().await.map(|_| ());
        }
        Err(self.registration_failed(registration_failure(&outcome)))
    }

    /// Start a full re-registration in the background.
    fn spawn_reregistration(&self, cause: &'static str) {
        if !self.shared.config.reregister_on_lost_registration {
            return;
        }
        {
            let mut session = self.shared.session.lock();
            if matches!(
                session.state,
                ClientState::ReRegistering | ClientState::Unregistering | ClientState::Registering
            ) {
                return;
            }
            session.endpoint_identifier = None;
        }
        info!("Registration lost ({}), registering again", cause);
        self.shared.set_state(ClientState::ReRegistering);
        let client = self.clone();
        self.shared.spawn(async move {
            if let Err(e) = client.register().await {
                warn!("Re-registration failed: {}", e);
            }
        });
    }

    /// Unregister from the gatekeeper.
    ///
    /// The local registration is dropped whatever the gatekeeper answers.
    pub async fn unregister(&self) -> ClientResult<()> {
        let (binding, identifier) = self.registered()?;
        self.shared.set_state(ClientState::Unregistering);

        let urq = RasBody::UnregistrationRequest(UnregistrationRequest {
            call_signal_addresses: self.shared.config.call_signal_addresses.clone(),
            endpoint_identifier: Some(identifier.clone()),
            endpoint_aliases: Vec::new(),
            gatekeeper_identifier: binding.gatekeeper_identifier.clone(),
            reason: None,
        });
        let result = self.channel.request(urq, &[binding.gatekeeper]).await;
        self.shared
            .clear_registration(ClientState::Unregistered, RegistrationFailure::UnregisteredLocally);

        let outcome = result?;
        match &outcome {
            TransactionOutcome::Confirmed(_) => {
                info!(endpoint = %identifier, "Unregistered from {}", binding.gatekeeper);
                Ok(())
            }
            TransactionOutcome::Rejected {
                reason: RejectReason::Unregistration(UnregistrationRejectReason::NotCurrentlyRegistered),
                ..
            } => {
                debug!(endpoint = %identifier, "Gatekeeper had already dropped the registration");
                Ok(())
            }
            _ => {
                warn!(endpoint = %identifier, "URQ to {}: {}", binding.gatekeeper, outcome);
                Err(ClientError::from_outcome(outcome))
            }
        }
    }

    /// Ask the gatekeeper to admit a call.
    pub async fn admission_request(&self, params: AdmissionParams) -> ClientResult<ActiveCall> {
        self.registered()?;
        let config = &self.shared.config;
        let call_reference = params
            .call_reference
            .unwrap_or_else(|| self.shared.next_call_reference());
        let src_info = if params.src_info.is_empty() && !params.answer_call {
            config.aliases.clone()
        } else {
            params.src_info.clone()
        };
        let src_call_signal_address = match params.src_call_signal_address {
            Some(addr) => Some(addr),
            None if !params.answer_call => config.call_signal_addresses.first().copied(),
            None => None,
        };

        let (outcome, _) = self
            .transact(|binding| {
                RasBody::AdmissionRequest(AdmissionRequest {
                    call_identifier: params.call_identifier,
                    call_reference,
                    endpoint_identifier: binding.endpoint_identifier.clone().unwrap_or_default(),
                    answer_call: params.answer_call,
                    destination_info: params.destination_info.clone(),
                    dest_call_signal_address: params.dest_call_signal_address,
                    src_info: src_info.clone(),
                    src_call_signal_address,
                    bandwidth: params.bandwidth,
                    gatekeeper_identifier: binding.gatekeeper_identifier.clone(),
                })
            })
            .await?;

        if let TransactionOutcome::Confirmed(reply) = &outcome {
            if let RasBody::AdmissionConfirm(acf) = &reply.body {
                let call = ActiveCall {
                    call_identifier: params.call_identifier,
                    call_reference,
                    answered_call: params.answer_call,
                    bandwidth: acf.bandwidth,
                    destination: acf.dest_call_signal_address,
                    call_model: acf.call_model,
                    irr_frequency: acf
                        .irr_frequency
                        .map(|secs| std::time::Duration::from_secs(u64::from(secs))),
                };
                debug!(call = %call.call_identifier, "Admitted with {} bandwidth", call.bandwidth);
                self.shared.calls.insert(call.clone());
                return Ok(call);
            }
        }

        if outcome
            .reject_reason()
            .is_some_and(RejectReason::is_lost_registration)
        {
            self.spawn_reregistration("admission refused, caller not registered");
        }
        Err(ClientError::from_outcome(outcome))
    }

    /// Change the bandwidth of an admitted call.
    ///
    /// Returns the bandwidth the gatekeeper granted.
    pub async fn bandwidth_request(
        &self,
        call_identifier: CallIdentifier,
        answered_call: bool,
        bandwidth: Bandwidth,
    ) -> ClientResult<Bandwidth> {
        self.registered()?;
        let key = (call_identifier, answered_call);
        let call = self
            .shared
            .calls
            .get(&key)
            .ok_or(ClientError::CallNotFound(call_identifier))?;

        let (outcome, _) = self
            .transact(|binding| {
                RasBody::BandwidthRequest(BandwidthRequest {
                    endpoint_identifier: binding.endpoint_identifier.clone().unwrap_or_default(),
                    call_identifier,
                    call_reference: call.call_reference,
                    answered_call,
                    bandwidth,
                })
            })
            .await?;

        match outcome {
            TransactionOutcome::Confirmed(reply) => match reply.body {
                RasBody::BandwidthConfirm(bcf) => {
                    self.shared.calls.set_bandwidth(&key, bcf.bandwidth);
                    Ok(bcf.bandwidth)
                }
                _ => Err(ClientError::Rejected {
                    reason: RejectReason::Mismatched,
                }),
            },
            TransactionOutcome::Rejected { reply, reason } => match reply.body {
                RasBody::BandwidthReject(brj) if brj.reason == BandwidthRejectReason::InsufficientResources => {
                    Err(ClientError::InsufficientBandwidth {
                        allowed: brj.allowed_bandwidth,
                    })
                }
                _ => Err(ClientError::Rejected { reason }),
            },
            other => Err(ClientError::from_outcome(other)),
        }
    }

    /// Tell the gatekeeper a call is over.
    ///
    /// The call is forgotten locally whatever the gatekeeper answers.
    pub async fn disengage_request(
        &self,
        call_identifier: CallIdentifier,
        answered_call: bool,
        reason: DisengageReason,
    ) -> ClientResult<()> {
        let call = self
            .shared
            .calls
            .remove(&(call_identifier, answered_call))
            .ok_or(ClientError::CallNotFound(call_identifier))?;
        self.registered()?;

        let (outcome, _) = self
            .transact(|binding| {
                RasBody::DisengageRequest(DisengageRequest {
                    endpoint_identifier: binding.endpoint_identifier.clone().unwrap_or_default(),
                    call_identifier,
                    call_reference: call.call_reference,
                    answered_call,
                    reason,
                })
            })
            .await?;

        if outcome.is_confirmed() {
            debug!(call = %call_identifier, "Disengaged");
            Ok(())
        } else {
            Err(ClientError::from_outcome(outcome))
        }
    }

    /// Send an unsolicited IRR listing every active call.
    pub async fn send_heartbeat(&self) -> ClientResult<()> {
        let per_call_info = self.shared.calls.per_call_info(CallIdentifier::nil());
        self.send_info_response(per_call_info).await
    }

    async fn send_info_response(&self, per_call_info: Vec<PerCallInfo>) -> ClientResult<()> {
        let (binding, identifier) = self.registered()?;
        let irr = RasBody::InfoRequestResponse(InfoRequestResponse {
            endpoint_identifier: identifier,
            ras_address: self.shared.ras_address,
            call_signal_addresses: self.shared.config.call_signal_addresses.clone(),
            endpoint_aliases: self.shared.config.aliases.clone(),
            per_call_info,
            unsolicited: true,
            need_response: false,
        });
        self.channel.send_unsolicited(irr, binding.gatekeeper).await?;
        Ok(())
    }

    /// Stop background tasks and close the transport. Does not unregister.
    pub async fn shutdown(&self) -> ClientResult<()> {
        self.shared.shutdown.cancel();
        self.shared.tasks.close();
        self.channel.shutdown().await?;
        self.shared.tasks.wait().await;
        debug!("Gatekeeper client on {} stopped", self.channel.local_addr());
        Ok(())
    }
}

/// Reason a registration transaction did not produce an RCF.
fn registration_failure(outcome: &TransactionOutcome) -> RegistrationFailure {
    match outcome {
        TransactionOutcome::Rejected { reason, .. } | TransactionOutcome::TryAlternate { reason, .. } => {
            match reason {
                RejectReason::Registration(reason) => RegistrationFailure::from_reject(reason.clone()),
                _ => RegistrationFailure::Rejected(RegistrationRejectReason::UndefinedReason),
            }
        }
        TransactionOutcome::BadCryptoTokens { .. } => RegistrationFailure::SecurityDenied,
        TransactionOutcome::NoResponse => RegistrationFailure::TransportError,
        TransactionOutcome::Confirmed(_) => RegistrationFailure::Rejected(RegistrationRejectReason::UndefinedReason),
    }
}

impl std::fmt::Debug for GatekeeperClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let session = self.shared.session.lock();
        f.debug_struct("GatekeeperClient")
            .field("state", &session.state)
            .field("gatekeeper", &session.gatekeeper)
            .field("endpoint_identifier", &session.endpoint_identifier)
            .finish()
    }
}
