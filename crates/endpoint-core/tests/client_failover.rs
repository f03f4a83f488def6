//! Gatekeeper client against real and scripted gatekeepers on the in-memory
//! network, with a paused clock.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use h323_endpoint_core::prelude::*;
use h323_gatekeeper_core::{GatekeeperConfig, GatekeeperServer};
use h323_ras_core::prelude::*;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;
use tokio::time::Instant;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("h323_endpoint_core=debug,h323_ras_core=info")
        .with_test_writer()
        .try_init();
}

fn gk_addr(host: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, host], 1719))
}

fn ras_addr(host: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 1, host], 1719))
}

fn signal_addr(host: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 1, host], 1720))
}

fn alternate(host: u8, identifier: &str, priority: u8) -> AlternateGatekeeper {
    let mut alternate = AlternateGatekeeper::new(gk_addr(host), priority);
    alternate.gatekeeper_identifier = Some(identifier.to_string());
    alternate
}

fn start_gatekeeper(network: &Arc<MemoryNetwork>, host: u8, config: GatekeeperConfig) -> GatekeeperServer {
    let (transport, events) = network.bind(gk_addr(host)).unwrap();
    GatekeeperServer::start_on(
        config,
        AuthenticatorChain::new(),
        (Arc::new(transport), events),
        None,
    )
    .unwrap()
}

fn client_config(host: u8, alias: &str, gatekeeper: SocketAddr) -> ClientConfig {
    ClientConfig::new(vec![alias.to_string()])
        .with_call_signal_address(signal_addr(host))
        .with_gatekeeper(gatekeeper, None)
        .with_discovery_timeout(Duration::from_secs(30))
}

fn start_client(network: &Arc<MemoryNetwork>, host: u8, config: ClientConfig) -> GatekeeperClient {
    let (transport, events) = network.bind(ras_addr(host)).unwrap();
    GatekeeperClient::start_on(config, AuthenticatorChain::new(), Arc::new(transport), events).unwrap()
}

async fn wait_for<F>(events: &mut broadcast::Receiver<ClientEvent>, matches: F) -> ClientEvent
where
    F: Fn(&ClientEvent) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("Event channel closed: {}", e),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(120), wait)
        .await
        .expect("Timed out waiting for client event")
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum StubMode {
    /// RRQ answered with RRJ resourceUnavailable
    Busy,
    /// RRQ never answered
    Silent,
}

/// Gatekeeper that confirms discovery and refuses registration.
struct StubGatekeeper {
    address: SocketAddr,
    identifier: String,
    alternates: Vec<AlternateGatekeeper>,
    mode: StubMode,
    /// GRQs left to reject before confirming
    grq_rejects: AtomicU32,
    log: Arc<Mutex<Vec<(SocketAddr, RasKind)>>>,
}

#[async_trait]
impl RasRequestHandler for StubGatekeeper {
    async fn handle_request(&self, _channel: RasChannel, request: InboundRequest) -> Option<RasBody> {
        self.log.lock().push((self.address, request.message.kind()));
        match request.message.body {
            RasBody::GatekeeperRequest(_) => {
                let rejected = self
                    .grq_rejects
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                    .is_ok();
                if rejected {
                    return Some(RasBody::GatekeeperReject(GatekeeperReject {
                        reason: GatekeeperRejectReason::ResourceUnavailable,
                        gatekeeper_identifier: Some(self.identifier.clone()),
                        alternate_gatekeepers: Vec::new(),
                    }));
                }
                Some(RasBody::GatekeeperConfirm(GatekeeperConfirm {
                    gatekeeper_identifier: Some(self.identifier.clone()),
                    ras_address: self.address,
                    alternate_gatekeepers: self.alternates.clone(),
                    alt_gk_is_permanent: false,
                }))
            }
            RasBody::RegistrationRequest(_) if self.mode == StubMode::Busy => {
                Some(RasBody::RegistrationReject(RegistrationReject {
                    reason: RegistrationRejectReason::ResourceUnavailable,
                    gatekeeper_identifier: Some(self.identifier.clone()),
                    alternate_gatekeepers: Vec::new(),
                }))
            }
            _ => None,
        }
    }
}

fn start_stub(
    network: &Arc<MemoryNetwork>,
    host: u8,
    mode: StubMode,
    alternates: Vec<AlternateGatekeeper>,
    log: &Arc<Mutex<Vec<(SocketAddr, RasKind)>>>,
) -> RasChannel {
    start_rejecting_stub(network, host, mode, alternates, log, 0)
}

fn start_rejecting_stub(
    network: &Arc<MemoryNetwork>,
    host: u8,
    mode: StubMode,
    alternates: Vec<AlternateGatekeeper>,
    log: &Arc<Mutex<Vec<(SocketAddr, RasKind)>>>,
    grq_rejects: u32,
) -> RasChannel {
    let handler = Arc::new(StubGatekeeper {
        address: gk_addr(host),
        identifier: format!("stub{}", host),
        alternates,
        mode,
        grq_rejects: AtomicU32::new(grq_rejects),
        log: log.clone(),
    });
    let (transport, events) = network.bind(gk_addr(host)).unwrap();
    RasChannel::builder(Arc::new(transport), events)
        .with_handler(handler)
        .start()
        .unwrap()
}

/// Gatekeepers that saw an RRQ, in order, retransmissions folded.
fn registration_attempts(log: &Mutex<Vec<(SocketAddr, RasKind)>>) -> Vec<SocketAddr> {
    let mut attempts: Vec<SocketAddr> = Vec::new();
    for (address, kind) in log.lock().iter() {
        if *kind == RasKind::Rrq && attempts.last() != Some(address) {
            attempts.push(*address);
        }
    }
    attempts
}

#[tokio::test(start_paused = true)]
async fn test_failover_walks_alternates_in_priority_order() {
    init_tracing();
    let network = MemoryNetwork::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    // Advertised out of order; A has the better priority
    let alternates = vec![alternate(3, "gkB", 2), alternate(2, "stub2", 1)];
    let _primary = start_stub(&network, 1, StubMode::Busy, alternates, &log);
    let _a = start_stub(&network, 2, StubMode::Busy, Vec::new(), &log);
    let b = start_gatekeeper(&network, 3, GatekeeperConfig::new("gkB"));

    let client = start_client(&network, 10, client_config(10, "alice", gk_addr(1)));
    let mut events = client.subscribe();

    let identifier = client.register().await.unwrap();

    assert_eq!(registration_attempts(&log), vec![gk_addr(1), gk_addr(2)]);
    assert_eq!(client.state(), ClientState::Registered);
    assert_eq!(client.gatekeeper(), Some(gk_addr(3)));
    assert_eq!(client.gatekeeper_identifier().as_deref(), Some("gkB"));
    assert!(b.registry().find_by_identifier(&identifier).is_some());

    let changed = wait_for(&mut events, |e| matches!(e, ClientEvent::GatekeeperChanged { .. })).await;
    assert_eq!(
        changed,
        ClientEvent::GatekeeperChanged {
            from: gk_addr(1),
            to: gk_addr(3),
        }
    );
    client.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_silent_gatekeeper_fails_over() {
    init_tracing();
    let network = MemoryNetwork::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    let _primary = start_stub(&network, 1, StubMode::Silent, vec![alternate(3, "gkB", 1)], &log);
    let b = start_gatekeeper(&network, 3, GatekeeperConfig::new("gkB"));

    let client = start_client(&network, 10, client_config(10, "alice", gk_addr(1)));
    client.register().await.unwrap();

    assert_eq!(client.gatekeeper(), Some(gk_addr(3)));
    assert_eq!(b.registry().len(), 1);
    client.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_alternates_surface_first_failure() {
    init_tracing();
    let network = MemoryNetwork::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    // Nothing listens at host 3
    let alternates = vec![alternate(2, "stub2", 1), alternate(3, "gone", 2)];
    let _primary = start_stub(&network, 1, StubMode::Busy, alternates, &log);
    let _a = start_stub(&network, 2, StubMode::Busy, Vec::new(), &log);

    let client = start_client(&network, 10, client_config(10, "alice", gk_addr(1)));
    let error = client.register().await.unwrap_err();

    assert!(matches!(
        error,
        ClientError::RegistrationFailed(RegistrationFailure::Rejected(
            RegistrationRejectReason::ResourceUnavailable
        ))
    ));
    assert_eq!(client.state(), ClientState::Failed);
    assert_eq!(registration_attempts(&log), vec![gk_addr(1), gk_addr(2)]);
    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failover_disabled_stays_put() {
    init_tracing();
    let network = MemoryNetwork::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    let _primary = start_stub(&network, 1, StubMode::Busy, vec![alternate(2, "stub2", 1)], &log);
    let _a = start_stub(&network, 2, StubMode::Busy, Vec::new(), &log);

    let config = client_config(10, "alice", gk_addr(1)).with_failover(false);
    let client = start_client(&network, 10, config);
    assert!(client.register().await.is_err());
    assert_eq!(registration_attempts(&log), vec![gk_addr(1)]);
    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_discovery_waits_through_rejects() {
    init_tracing();
    let network = MemoryNetwork::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let _gk = start_rejecting_stub(&network, 1, StubMode::Busy, Vec::new(), &log, 2);

    let client = start_client(&network, 10, client_config(10, "alice", gk_addr(1)));
    let discovered = client.discover().await.unwrap();

    assert_eq!(discovered, gk_addr(1));
    assert_eq!(client.gatekeeper_identifier().as_deref(), Some("stub1"));
    let grqs = log.lock().iter().filter(|(_, kind)| *kind == RasKind::Grq).count();
    assert_eq!(grqs, 3);
    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_discovery_times_out() {
    init_tracing();
    let network = MemoryNetwork::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let _gk = start_rejecting_stub(&network, 1, StubMode::Busy, Vec::new(), &log, u32::MAX);

    let config = client_config(10, "alice", gk_addr(1)).with_discovery_timeout(Duration::from_secs(10));
    let client = start_client(&network, 10, config);
    let started = Instant::now();
    let error = client.discover().await.unwrap_err();

    assert!(matches!(error, ClientError::DiscoveryFailed { .. }));
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(client.state(), ClientState::Failed);
    client.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_alternate_registered_before_admission() {
    init_tracing();
    let network = MemoryNetwork::new();

    let gk1 = start_gatekeeper(
        &network,
        1,
        GatekeeperConfig::new("gk1").with_alternate(alternate(3, "gkB", 1)),
    );
    let b = start_gatekeeper(&network, 3, GatekeeperConfig::new("gkB"));

    let client = start_client(&network, 10, client_config(10, "alice", gk_addr(1)));
    let first = client.register().await.unwrap();
    assert_eq!(client.alternates().len(), 1);

    gk1.shutdown().await.unwrap();

    let params = AdmissionParams::outgoing(Vec::new(), 640).with_destination_address(signal_addr(20));
    let call = client.admission_request(params).await.unwrap();

    assert_eq!(call.destination, signal_addr(20));
    assert_eq!(client.gatekeeper(), Some(gk_addr(3)));
    let second = client.endpoint_identifier().unwrap();
    assert!(b.registry().find_by_identifier(&second).is_some());
    assert_eq!(b.admission().call_count(), 1);
    assert_ne!(first, second);
    client.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_lost_registration_on_keep_alive_reregisters() {
    init_tracing();
    let network = MemoryNetwork::new();
    let gk = start_gatekeeper(&network, 1, GatekeeperConfig::new("gk1"));

    let client = start_client(&network, 10, client_config(10, "alice", gk_addr(1)));
    let mut events = client.subscribe();
    let old = client.register().await.unwrap();

    client.keep_alive().await.unwrap();
    assert_eq!(client.endpoint_identifier(), Some(old.clone()));

    gk.registry().unregister(&old).unwrap();
    client.keep_alive().await.unwrap();

    wait_for(&mut events, |e| {
        matches!(e, ClientEvent::StateChanged { new: ClientState::ReRegistering, .. })
    })
    .await;
    let new = client.endpoint_identifier().unwrap();
    assert_ne!(new, old);
    assert_eq!(client.state(), ClientState::Registered);
    assert!(gk.registry().find_by_identifier(&new).is_some());
    client.shutdown().await.unwrap();
    gk.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_renews_before_expiry() {
    init_tracing();
    let network = MemoryNetwork::new();
    let gk = start_gatekeeper(
        &network,
        1,
        GatekeeperConfig::new("gk1").with_time_to_live(Duration::from_secs(60)),
    );

    let config = client_config(10, "alice", gk_addr(1))
        .with_time_to_live(Some(Duration::from_secs(60)))
        .with_renewal_margin(Duration::from_secs(10));
    let client = start_client(&network, 10, config);
    let identifier = client.register().await.unwrap();
    assert_eq!(client.time_to_live(), Some(60));

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_secs(55)).await;
        let endpoint = gk.registry().find_by_identifier(&identifier).unwrap();
        assert!(!endpoint.is_expired(Instant::now()));
    }
    assert_eq!(client.endpoint_identifier(), Some(identifier));
    client.shutdown().await.unwrap();
    gk.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_registers_again_once_gatekeeper_returns() {
    init_tracing();
    let network = MemoryNetwork::new();
    let gk = start_gatekeeper(
        &network,
        1,
        GatekeeperConfig::new("gk1").with_time_to_live(Duration::from_secs(60)),
    );
    let config = client_config(10, "alice", gk_addr(1))
        .with_time_to_live(Some(Duration::from_secs(60)))
        .with_renewal_margin(Duration::from_secs(10))
        .with_reregistration_backoff(Duration::from_secs(5), Duration::from_secs(20));
    let client = start_client(&network, 10, config);
    let mut events = client.subscribe();
    client.register().await.unwrap();

    gk.shutdown().await.unwrap();
    wait_for(&mut events, |e| matches!(e, ClientEvent::RegistrationFailed { .. })).await;
    assert_eq!(client.state(), ClientState::Failed);

    // Several attempts fail while nothing listens
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(client.state(), ClientState::Failed);

    let gk = start_gatekeeper(&network, 1, GatekeeperConfig::new("gk1"));
    let registered = wait_for(&mut events, |e| matches!(e, ClientEvent::Registered { .. })).await;
    match registered {
        ClientEvent::Registered { gatekeeper, .. } => assert_eq!(gatekeeper, gk_addr(1)),
        other => panic!("Unexpected {:?}", other),
    }
    assert_eq!(client.state(), ClientState::Registered);
    let identifier = client.endpoint_identifier().unwrap();
    assert!(gk.registry().find_by_identifier(&identifier).is_some());
    client.shutdown().await.unwrap();
    gk.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_local_unregistration_is_not_retried() {
    init_tracing();
    let network = MemoryNetwork::new();
    let gk = start_gatekeeper(&network, 1, GatekeeperConfig::new("gk1"));
    let client = start_client(&network, 10, client_config(10, "alice", gk_addr(1)));
    client.register().await.unwrap();
    client.unregister().await.unwrap();

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(client.state(), ClientState::Unregistered);
    assert!(gk.registry().is_empty());
    client.shutdown().await.unwrap();
    gk.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_gatekeeper_unregistration_triggers_reregistration() {
    init_tracing();
    let network = MemoryNetwork::new();
    let gk = start_gatekeeper(&network, 1, GatekeeperConfig::new("gk1"));

    let client = start_client(&network, 10, client_config(10, "alice", gk_addr(1)));
    let old = client.register().await.unwrap();
    let mut events = client.subscribe();

    gk.force_unregister(&old).unwrap();

    let unregistered = wait_for(&mut events, |e| matches!(e, ClientEvent::Unregistered { .. })).await;
    assert_eq!(
        unregistered,
        ClientEvent::Unregistered {
            failure: RegistrationFailure::UnregisteredByGatekeeper,
        }
    );
    wait_for(&mut events, |e| matches!(e, ClientEvent::Registered { .. })).await;

    let new = client.endpoint_identifier().unwrap();
    assert_ne!(new, old);
    assert!(gk.registry().find_by_identifier(&new).is_some());
    assert!(gk.registry().find_by_identifier(&old).is_none());
    client.shutdown().await.unwrap();
    gk.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_anonymous_urq_from_stranger_rejected() {
    init_tracing();
    let network = MemoryNetwork::new();
    let gk = start_gatekeeper(&network, 1, GatekeeperConfig::new("gk1"));
    let client = start_client(&network, 10, client_config(10, "alice", gk_addr(1)));
    let identifier = client.register().await.unwrap();

    let (transport, events) = network.bind(gk_addr(66)).unwrap();
    let stranger = RasChannel::builder(Arc::new(transport), events).start().unwrap();
    let urq = UnregistrationRequest {
        call_signal_addresses: vec![signal_addr(10)],
        endpoint_identifier: None,
        endpoint_aliases: Vec::new(),
        gatekeeper_identifier: None,
        reason: None,
    };
    let outcome = stranger
        .request(RasBody::UnregistrationRequest(urq), &[ras_addr(10)])
        .await
        .unwrap();
    assert_eq!(
        outcome.reject_reason(),
        Some(&RejectReason::Unregistration(UnregistrationRejectReason::NotCurrentlyRegistered))
    );

    assert_eq!(client.state(), ClientState::Registered);
    assert_eq!(client.endpoint_identifier(), Some(identifier.clone()));
    assert!(gk.registry().find_by_identifier(&identifier).is_some());
    stranger.shutdown().await.unwrap();
    client.shutdown().await.unwrap();
    gk.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_calls_and_forced_drop() {
    init_tracing();
    let network = MemoryNetwork::new();
    let gk = start_gatekeeper(
        &network,
        1,
        GatekeeperConfig::new("gk1").with_total_bandwidth(1000),
    );

    let alice = start_client(&network, 10, client_config(10, "alice", gk_addr(1)));
    let bob = start_client(&network, 11, client_config(11, "bob", gk_addr(1)));
    alice.register().await.unwrap();
    bob.register().await.unwrap();
    let mut events = alice.subscribe();

    let call = alice
        .admission_request(AdmissionParams::outgoing(vec!["bob".into()], 500))
        .await
        .unwrap();
    assert_eq!(call.destination, signal_addr(11));
    assert_eq!(call.bandwidth, 500);
    assert_eq!(alice.active_call_count(), 1);

    let error = alice
        .bandwidth_request(call.call_identifier, false, 1200)
        .await
        .unwrap_err();
    assert!(matches!(error, ClientError::InsufficientBandwidth { .. }));
    assert_eq!(alice.bandwidth_request(call.call_identifier, false, 800).await.unwrap(), 800);
    assert_eq!(alice.active_calls()[0].bandwidth, 800);

    gk.clear_call(call.call_identifier).unwrap();
    let dropped = wait_for(&mut events, |e| matches!(e, ClientEvent::CallDisengaged { .. })).await;
    assert_eq!(
        dropped,
        ClientEvent::CallDisengaged {
            call_identifier: call.call_identifier,
            reason: DisengageReason::ForcedDrop,
        }
    );
    assert_eq!(alice.active_call_count(), 0);

    let again = alice
        .admission_request(AdmissionParams::outgoing(vec!["bob".into()], 500))
        .await
        .unwrap();
    alice
        .disengage_request(again.call_identifier, false, DisengageReason::NormalDrop)
        .await
        .unwrap();
    assert_eq!(gk.admission().call_count(), 0);
    assert!(matches!(
        alice
            .disengage_request(again.call_identifier, false, DisengageReason::NormalDrop)
            .await,
        Err(ClientError::CallNotFound(_))
    ));

    alice.shutdown().await.unwrap();
    bob.shutdown().await.unwrap();
    gk.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_heartbeats_keep_calls_admitted() {
    init_tracing();
    let network = MemoryNetwork::new();
    let gk = start_gatekeeper(
        &network,
        1,
        GatekeeperConfig::new("gk1").with_info_response_rate(Duration::from_secs(10)),
    );

    let alice = start_client(&network, 10, client_config(10, "alice", gk_addr(1)));
    let bob = start_client(&network, 11, client_config(11, "bob", gk_addr(1)));
    alice.register().await.unwrap();
    bob.register().await.unwrap();

    let call = alice
        .admission_request(AdmissionParams::outgoing(vec!["bob".into()], 500))
        .await
        .unwrap();
    assert_eq!(call.irr_frequency, Some(Duration::from_secs(10)));

    tokio::time::sleep(Duration::from_secs(100)).await;
    assert_eq!(gk.admission().call_count(), 1);
    assert_eq!(alice.active_call_count(), 1);

    alice.send_heartbeat().await.unwrap();
    alice.unregister().await.unwrap();
    assert_eq!(alice.state(), ClientState::Unregistered);
    assert_eq!(alice.last_failure(), Some(RegistrationFailure::UnregisteredLocally));
    assert!(matches!(alice.keep_alive().await, Err(ClientError::NotRegistered)));

    alice.shutdown().await.unwrap();
    bob.shutdown().await.unwrap();
    gk.shutdown().await.unwrap();
}
