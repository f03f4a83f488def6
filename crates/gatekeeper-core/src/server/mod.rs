//! # Gatekeeper Server
//!
//! Binds the RAS listeners, answers requests through one shared handler and
//! runs the supervision sweeps.
//!
//! ```no_run
//! use h323_gatekeeper_core::{GatekeeperConfig, GatekeeperServer};
//! use h323_ras_core::AuthenticatorChain;
//!
//! # async fn example() -> h323_gatekeeper_core::Result<()> {
//! let config = GatekeeperConfig::new("gk1");
//! let server = GatekeeperServer::start(config, AuthenticatorChain::new()).await?;
//! // ...
//! server.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod handler;
mod supervision;

use std::net::SocketAddr;
use std::sync::Arc;

use h323_ras_core::message::{
    CallIdentifier, DisengageReason, DisengageRequest, RasBody, UnregistrationReason,
    UnregistrationRequest,
};
use h323_ras_core::{
    AuthenticatorChain, RasChannel, RasRequestHandler, Transport, TransportEvent, UdpTransport,
};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::admission::{AdmissionController, CallEndReason, CallInfo};
use crate::config::GatekeeperConfig;
use crate::error::{GatekeeperError, Result};
use crate::events::{GatekeeperEvent, RemovalCause};
use crate::registry::{EndpointInfo, EndpointRegistry};

use handler::GatekeeperCore;
use supervision::spawn_tracked;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A bound transport and its event stream.
pub type Listener = (Arc<dyn Transport>, mpsc::Receiver<TransportEvent>);

pub struct GatekeeperServer {
    core: Arc<GatekeeperCore>,
    channel: RasChannel,
    discovery: Option<RasChannel>,
    /// Sweeps, probes and gatekeeper-initiated requests
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl GatekeeperServer {
    /// Bind the UDP listeners named by `config` and start serving.
    ///
    /// Failing to bind either listener aborts startup.
    pub async fn start(config: GatekeeperConfig, authenticators: AuthenticatorChain) -> Result<Self> {
        config.validate()?;

        let (transport, events) = UdpTransport::bind(config.ras_address, None)
            .await
            .inspect_err(|e| error!("Failed to bind RAS listener {}: {}", config.ras_address, e))?;
        let unicast: Listener = (Arc::new(transport) as Arc<dyn Transport>, events);

        let discovery = if config.discovery.enabled {
            let discovery = &config.discovery;
            let (transport, events) =
                UdpTransport::bind_multicast(discovery.group, discovery.port, discovery.interface, None)
                    .await
                    .inspect_err(|e| error!("Failed to bind discovery listener: {}", e))?;
            Some((Arc::new(transport) as Arc<dyn Transport>, events))
        } else {
            None
        };

        Self::start_on(config, authenticators, unicast, discovery)
    }

    /// Start serving on already bound transports.
    pub fn start_on(
        config: GatekeeperConfig,
        authenticators: AuthenticatorChain,
        unicast: Listener,
        discovery: Option<Listener>,
    ) -> Result<Self> {
        config.validate()?;
        let (transport, events) = unicast;
        let ras_address = match config.advertised_ras_address {
            Some(addr) => addr,
            None => transport.local_addr()?,
        };

        let authenticators = if config.registration.require_security {
            authenticators.with_required_tokens(true)
        } else {
            authenticators
        };

        let registry = Arc::new(EndpointRegistry::new(config.registration.clone()));
        let admission = Arc::new(AdmissionController::with_registry(
            config.admission.clone(),
            config.bandwidth.clone(),
            registry.clone(),
        ));
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let core = Arc::new(GatekeeperCore {
            config,
            registry,
            admission,
            events: events_tx,
            ras_address,
        });

        let handler: Arc<dyn RasRequestHandler> = core.clone();
        let start_channel = |(transport, events): Listener| {
            RasChannel::builder(transport, events)
                .with_config(core.config.transaction.clone())
                .with_authenticators(authenticators.clone())
                .with_handler(handler.clone())
                .start()
        };
        let channel = start_channel((transport, events))?;
        let discovery = discovery.map(start_channel).transpose()?;

        let tasks = TaskTracker::new();
        let shutdown = CancellationToken::new();
        tasks.spawn(supervision::run_ttl_sweep(
            core.clone(),
            channel.clone(),
            tasks.clone(),
            shutdown.clone(),
        ));
        tasks.spawn(supervision::run_heartbeat_sweep(
            core.clone(),
            channel.clone(),
            tasks.clone(),
            shutdown.clone(),
        ));

        info!(
            identifier = %core.config.identifier,
            "Gatekeeper listening on {} (announced as {})",
            channel.local_addr(),
            ras_address
        );
        Ok(Self {
            core,
            channel,
            discovery,
            tasks,
            shutdown,
        })
    }

    pub fn config(&self) -> &GatekeeperConfig {
        &self.core.config
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.core.registry
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.core.admission
    }

    /// Address announced to endpoints.
    pub fn ras_address(&self) -> SocketAddr {
        self.core.ras_address
    }

    /// Address the unicast listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.channel.local_addr()
    }

    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.discovery.as_ref().map(|channel| channel.local_addr())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatekeeperEvent> {
        self.core.events.subscribe()
    }

    /// Clear every leg of a call and tell the owning endpoints with a
    /// forced-drop DRQ.
    pub fn clear_call(&self, call_identifier: CallIdentifier) -> Result<Vec<CallInfo>> {
        let calls = self.core.admission.find_calls(call_identifier);
        if calls.is_empty() {
            return Err(GatekeeperError::CallNotFound(call_identifier));
        }

        let mut cleared = Vec::new();
        for call in calls {
            let Some(call) = self.core.end_call(&call.key(), CallEndReason::AdministrativeClear) else {
                continue;
            };
            info!(call = %call.key(), "Call cleared administratively");
            let drq = RasBody::DisengageRequest(DisengageRequest {
                endpoint_identifier: call.endpoint_identifier().to_string(),
                call_identifier,
                call_reference: call.call_reference(),
                answered_call: call.key().direction.is_answering(),
                reason: DisengageReason::ForcedDrop,
            });
            self.send_request(drq, vec![call.ras_address()]);
            cleared.push(call.info());
        }
        Ok(cleared)
    }

    /// Remove an endpoint and tell it with a URQ.
    pub fn force_unregister(&self, endpoint_identifier: &str) -> Result<EndpointInfo> {
        let endpoint = self
            .core
            .remove_endpoint(
                endpoint_identifier,
                RemovalCause::Administrative,
                CallEndReason::AdministrativeClear,
            )
            .ok_or_else(|| GatekeeperError::EndpointNotFound(endpoint_identifier.to_string()))?;

        let info = endpoint.info();
        let urq = RasBody::UnregistrationRequest(UnregistrationRequest {
            call_signal_addresses: info.call_signal_addresses.clone(),
            endpoint_identifier: Some(info.identifier.clone()),
            endpoint_aliases: Vec::new(),
            gatekeeper_identifier: Some(self.core.config.identifier.clone()),
            reason: Some(UnregistrationReason::Maintenance),
        });
        self.send_request(urq, info.ras_addresses.clone());
        Ok(info)
    }

    fn send_request(&self, body: RasBody, targets: Vec<SocketAddr>) {
        if targets.is_empty() {
            return;
        }
        let channel = self.channel.clone();
        spawn_tracked(&self.tasks, &self.shutdown, async move {
            let kind = body.kind();
            match channel.request(body, &targets).await {
                Ok(outcome) => debug!("{} to {:?}: {}", kind, targets, outcome),
                Err(e) => debug!("{} to {:?} failed: {}", kind, targets, e),
            }
        });
    }

    /// Stop the sweeps, drain the listeners and wait for every task.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down gatekeeper {}", self.core.config.identifier);
        self.shutdown.cancel();
        self.tasks.close();

        if let Some(discovery) = &self.discovery {
            discovery.shutdown().await?;
        }
        self.channel.shutdown().await?;
        self.tasks.wait().await;
        Ok(())
    }
}

impl std::fmt::Debug for GatekeeperServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatekeeperServer")
            .field("identifier", &self.core.config.identifier)
            .field("ras_address", &self.core.ras_address)
            .finish()
    }
}
