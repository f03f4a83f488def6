//! Gatekeeper behaviour seen from endpoints on the in-memory network.
//!
//! Endpoints here are bare RAS channels whose handler answers the
//! gatekeeper's IRQ, DRQ and URQ. The clock is paused, so TTLs and heartbeat
//! periods pass instantly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use h323_gatekeeper_core::prelude::*;
use h323_gatekeeper_core::{AdmissionPolicy, RegistrationPolicy};
use h323_ras_core::prelude::*;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

const GK: &str = "gk1";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("h323_gatekeeper_core=debug,h323_ras_core=info")
        .with_test_writer()
        .try_init();
}

fn gk_addr() -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 254], 1719))
}

fn ras_addr(host: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, host], 1719))
}

fn signal_addr(host: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, host], 1720))
}

fn start_gatekeeper(network: &Arc<MemoryNetwork>, config: GatekeeperConfig) -> GatekeeperServer {
    let (transport, events) = network.bind(gk_addr()).unwrap();
    GatekeeperServer::start_on(
        config,
        AuthenticatorChain::new(),
        (Arc::new(transport), events),
        None,
    )
    .unwrap()
}

/// What a test endpoint received from the gatekeeper.
#[derive(Default)]
struct Inbox {
    disengages: Vec<DisengageRequest>,
    unregistrations: Vec<UnregistrationRequest>,
}

/// Endpoint side of the gatekeeper's requests.
struct EndpointHandler {
    identifier: Mutex<String>,
    aliases: Vec<String>,
    host: u8,
    /// Whether IRQs are answered
    alive: AtomicBool,
    calls: Mutex<Vec<PerCallInfo>>,
    inbox: Mutex<Inbox>,
}

#[async_trait]
impl RasRequestHandler for EndpointHandler {
    async fn handle_request(&self, _channel: RasChannel, request: InboundRequest) -> Option<RasBody> {
        match request.message.body {
            RasBody::InfoRequest(_) if self.alive.load(Ordering::SeqCst) => {
                Some(RasBody::InfoRequestResponse(InfoRequestResponse {
                    endpoint_identifier: self.identifier.lock().clone(),
                    ras_address: ras_addr(self.host),
                    call_signal_addresses: vec![signal_addr(self.host)],
                    endpoint_aliases: self.aliases.clone(),
                    per_call_info: self.calls.lock().clone(),
                    unsolicited: false,
                    need_response: false,
                }))
            }
            RasBody::DisengageRequest(drq) => {
                self.inbox.lock().disengages.push(drq);
                Some(RasBody::DisengageConfirm)
            }
            RasBody::UnregistrationRequest(urq) => {
                self.inbox.lock().unregistrations.push(urq);
                Some(RasBody::UnregistrationConfirm)
            }
            _ => None,
        }
    }
}

struct TestEndpoint {
    channel: RasChannel,
    handler: Arc<EndpointHandler>,
}

impl TestEndpoint {
    fn new(network: &Arc<MemoryNetwork>, host: u8, aliases: &[&str]) -> Self {
        let handler = Arc::new(EndpointHandler {
            identifier: Mutex::new(String::new()),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            host,
            alive: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            inbox: Mutex::new(Inbox::default()),
        });
        let (transport, events) = network.bind(ras_addr(host)).unwrap();
        let channel = RasChannel::builder(Arc::new(transport), events)
            .with_handler(handler.clone())
            .start()
            .unwrap();
        Self { channel, handler }
    }

    fn identifier(&self) -> String {
        self.handler.identifier.lock().clone()
    }

    fn rrq(&self, time_to_live: u32) -> RegistrationRequest {
        RegistrationRequest {
            discovery_complete: true,
            keep_alive: false,
            endpoint_identifier: None,
            gatekeeper_identifier: Some(GK.into()),
            call_signal_addresses: vec![signal_addr(self.handler.host)],
            ras_addresses: vec![ras_addr(self.handler.host)],
            endpoint_kind: EndpointKind::Terminal,
            terminal_aliases: self.handler.aliases.clone(),
            voice_prefixes: vec![],
            time_to_live: Some(time_to_live),
            supports_alt_gk: true,
        }
    }

    async fn request(&self, body: RasBody) -> TransactionOutcome {
        self.channel.request(body, &[gk_addr()]).await.unwrap()
    }

    async fn register(&self, time_to_live: u32) -> RegistrationConfirm {
        let outcome = self.request(RasBody::RegistrationRequest(self.rrq(time_to_live))).await;
        match outcome.into_confirmed().map(|reply| reply.body) {
            Some(RasBody::RegistrationConfirm(rcf)) => {
                *self.handler.identifier.lock() = rcf.endpoint_identifier.clone();
                rcf
            }
            other => panic!("Expected RCF, got {:?}", other),
        }
    }

    fn arq(&self, destination: &str, bandwidth: Bandwidth) -> AdmissionRequest {
        AdmissionRequest {
            call_identifier: CallIdentifier::new(),
            call_reference: 1,
            endpoint_identifier: self.identifier(),
            answer_call: false,
            destination_info: vec![destination.to_string()],
            dest_call_signal_address: None,
            src_info: self.handler.aliases.clone(),
            src_call_signal_address: Some(signal_addr(self.handler.host)),
            bandwidth,
            gatekeeper_identifier: None,
        }
    }

    /// Place a call and report it in IRRs from now on.
    async fn call(&self, destination: &str, bandwidth: Bandwidth) -> (AdmissionRequest, TransactionOutcome) {
        let arq = self.arq(destination, bandwidth);
        let outcome = self.request(RasBody::AdmissionRequest(arq.clone())).await;
        if outcome.is_confirmed() {
            self.handler.calls.lock().push(PerCallInfo {
                call_identifier: arq.call_identifier,
                call_reference: arq.call_reference,
                bandwidth,
                answered_call: false,
                alerting: true,
                connected: true,
            });
        }
        (arq, outcome)
    }

    async fn unregister_aliases(&self, aliases: &[&str]) -> TransactionOutcome {
        self.request(RasBody::UnregistrationRequest(UnregistrationRequest {
            call_signal_addresses: vec![signal_addr(self.handler.host)],
            endpoint_identifier: Some(self.identifier()),
            endpoint_aliases: aliases.iter().map(|a| a.to_string()).collect(),
            gatekeeper_identifier: Some(GK.into()),
            reason: None,
        }))
        .await
    }

    fn go_silent(&self) {
        self.handler.alive.store(false, Ordering::SeqCst);
    }
}

fn ended_calls(events: &mut broadcast::Receiver<GatekeeperEvent>) -> Vec<CallInfo> {
    let mut ended = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let GatekeeperEvent::CallEnded { call } = event {
            ended.push(call);
        }
    }
    ended
}

#[tokio::test(start_paused = true)]
async fn test_alias_removal_keeps_endpoint_until_last_alias() {
    init_tracing();
    let network = MemoryNetwork::new();
    let gk = start_gatekeeper(&network, GatekeeperConfig::new(GK));
    let endpoint = TestEndpoint::new(&network, 1, &["a", "b"]);
    let rcf = endpoint.register(60).await;

    let registry = gk.registry();
    let by_a = registry.find_by_alias("a").unwrap();
    let by_b = registry.find_by_alias("b").unwrap();
    assert_eq!(by_a.identifier(), rcf.endpoint_identifier);
    assert!(Arc::ptr_eq(&by_a, &by_b));

    assert!(endpoint.unregister_aliases(&["b"]).await.is_confirmed());
    assert!(registry.find_by_alias("b").is_none());
    assert_eq!(registry.find_by_alias("a").unwrap().identifier(), rcf.endpoint_identifier);

    assert!(endpoint.unregister_aliases(&["a"]).await.is_confirmed());
    assert!(registry.find_by_alias("a").is_none());
    assert!(registry.find_by_identifier(&rcf.endpoint_identifier).is_none());
    assert!(registry.find_by_signal_address(&signal_addr(1)).is_none());
    assert!(registry.is_empty());

    let outcome = endpoint.unregister_aliases(&["a"]).await;
    assert_eq!(
        outcome.reject_reason(),
        Some(&RejectReason::Unregistration(UnregistrationRejectReason::NotCurrentlyRegistered))
    );
    gk.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_admission_rejected_when_bandwidth_exhausted() {
    init_tracing();
    let network = MemoryNetwork::new();
    let gk = start_gatekeeper(
        &network,
        GatekeeperConfig::new(GK)
            .with_total_bandwidth(1000)
            .with_call_bandwidth(100, 1000),
    );
    let alice = TestEndpoint::new(&network, 1, &["alice"]);
    let bob = TestEndpoint::new(&network, 2, &["bob"]);
    alice.register(60).await;
    bob.register(60).await;

    let (_, first) = alice.call("bob", 500).await;
    match first.confirmed().map(|reply| &reply.body) {
        Some(RasBody::AdmissionConfirm(acf)) => {
            assert_eq!(acf.bandwidth, 500);
            assert_eq!(acf.dest_call_signal_address, signal_addr(2));
        }
        other => panic!("Expected ACF, got {:?}", other),
    }

    let (_, second) = bob.call("alice", 640).await;
    assert_eq!(
        second.reject_reason(),
        Some(&RejectReason::Admission(AdmissionRejectReason::RequestDenied))
    );
    assert!(!second.should_try_alternate());
    assert_eq!(gk.admission().ledger().used(), 500);
    assert_eq!(gk.admission().call_count(), 1);
    gk.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_expired_endpoint_is_probed_then_removed() {
    init_tracing();
    let network = MemoryNetwork::new();
    let gk = start_gatekeeper(&network, GatekeeperConfig::new(GK).with_total_bandwidth(1000));
    let mut events = gk.subscribe();
    let alice = TestEndpoint::new(&network, 1, &["alice"]);
    let bob = TestEndpoint::new(&network, 2, &["bob"]);
    assert_eq!(alice.register(60).await.time_to_live, Some(60));
    bob.register(600).await;
    alice.call("bob", 300).await;

    alice.go_silent();
    tokio::time::sleep(Duration::from_secs(59)).await;
    assert!(gk.registry().find_by_alias("alice").is_some());

    // TTL lapses at 60s; the probe needs two attempts of 3s each
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(gk.registry().find_by_alias("alice").is_none());
    assert!(gk.registry().find_by_alias("bob").is_some());
    assert_eq!(gk.admission().call_count(), 0);
    assert_eq!(gk.admission().ledger().used(), 0);

    let ended = ended_calls(&mut events);
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].end_reason, Some(CallEndReason::EndpointExpired));
    gk.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_during_liveness_check_keeps_endpoint() {
    init_tracing();
    let network = MemoryNetwork::new();
    let gk = start_gatekeeper(&network, GatekeeperConfig::new(GK));
    let mut events = gk.subscribe();
    let alice = TestEndpoint::new(&network, 1, &["alice"]);
    let rcf = alice.register(60).await;
    alice.go_silent();

    // Lapsed at 60s; the IRQ goes unanswered until about 67s
    tokio::time::sleep(Duration::from_secs(63)).await;
    let keep_alive = RegistrationRequest::keep_alive(
        rcf.endpoint_identifier.clone(),
        Some(GK.into()),
        vec![ras_addr(1)],
        Some(60),
    );
    let outcome = alice.request(RasBody::RegistrationRequest(keep_alive)).await;
    assert!(outcome.is_confirmed());

    tokio::time::sleep(Duration::from_secs(10)).await;
    let endpoint = gk.registry().find_by_alias("alice").unwrap();
    assert_eq!(endpoint.identifier(), rcf.endpoint_identifier);
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, GatekeeperEvent::EndpointUnregistered { .. }),
            "Renewed endpoint was removed: {:?}",
            event
        );
    }

    // Without further renewals the next lapse still removes it
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(gk.registry().find_by_alias("alice").is_none());
    gk.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_endpoint_answering_probe_stays_registered() {
    init_tracing();
    let network = MemoryNetwork::new();
    let gk = start_gatekeeper(&network, GatekeeperConfig::new(GK));
    let alice = TestEndpoint::new(&network, 1, &["alice"]);
    alice.register(60).await;

    tokio::time::sleep(Duration::from_secs(200)).await;
    assert!(gk.registry().find_by_alias("alice").is_some());
    gk.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_rrq_datagram_registers_once() {
    init_tracing();
    let network = MemoryNetwork::new();
    let gk = start_gatekeeper(&network, GatekeeperConfig::new(GK));
    let mut events = gk.subscribe();
    let (transport, mut inbound) = network.bind(ras_addr(1)).unwrap();

    let endpoint = TestEndpoint::new(&network, 2, &["alice"]);
    let request = RasMessage::new(77, RasBody::RegistrationRequest(endpoint.rrq(60)));
    let datagram = JsonCodec::new().encode(&request).unwrap();
    transport.send_datagram(&datagram, gk_addr()).await.unwrap();
    transport.send_datagram(&datagram, gk_addr()).await.unwrap();

    let mut replies = Vec::new();
    for _ in 0..2 {
        match inbound.recv().await {
            Some(TransportEvent::DatagramReceived { data, .. }) => replies.push(data),
            other => panic!("Expected a reply, got {:?}", other),
        }
    }
    assert_eq!(replies[0], replies[1]);
    let reply = JsonCodec::new().decode(&replies[0]).unwrap();
    assert_eq!(reply.sequence_number, 77);
    assert_eq!(reply.kind(), RasKind::Rcf);

    assert_eq!(gk.registry().len(), 1);
    let registrations = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|event| matches!(event, GatekeeperEvent::EndpointRegistered { .. }))
        .count();
    assert_eq!(registrations, 1);
    gk.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reregistration_keeps_identifier() {
    init_tracing();
    let network = MemoryNetwork::new();
    let gk = start_gatekeeper(&network, GatekeeperConfig::new(GK));
    let alice = TestEndpoint::new(&network, 1, &["alice"]);
    let first = alice.register(60).await;

    let keep_alive = RegistrationRequest::keep_alive(
        first.endpoint_identifier.clone(),
        Some(GK.into()),
        vec![ras_addr(1)],
        Some(60),
    );
    let outcome = alice.request(RasBody::RegistrationRequest(keep_alive)).await;
    assert!(outcome.is_confirmed());

    // A full registration naming the identifier updates the same endpoint
    let mut rrq = alice.rrq(120);
    rrq.endpoint_identifier = Some(first.endpoint_identifier.clone());
    rrq.terminal_aliases.push("alice2".into());
    match alice.request(RasBody::RegistrationRequest(rrq)).await.into_confirmed().map(|reply| reply.body) {
        Some(RasBody::RegistrationConfirm(second)) => {
            assert_eq!(second.endpoint_identifier, first.endpoint_identifier);
            assert_eq!(second.time_to_live, Some(120));
        }
        other => panic!("Expected RCF, got {:?}", other),
    }
    assert_eq!(gk.registry().len(), 1);
    assert!(gk.registry().find_by_alias("alice2").is_some());

    // Without the identifier it takes over the signal address as a new endpoint
    let third = alice.register(60).await;
    assert_ne!(third.endpoint_identifier, first.endpoint_identifier);
    assert_eq!(gk.registry().len(), 1);
    assert!(gk.registry().find_by_identifier(&first.endpoint_identifier).is_none());

    let unknown = RegistrationRequest::keep_alive("nobody", None, vec![ras_addr(1)], None);
    let outcome = alice.request(RasBody::RegistrationRequest(unknown)).await;
    assert_eq!(
        outcome.reject_reason(),
        Some(&RejectReason::Registration(RegistrationRejectReason::FullRegistrationRequired))
    );
    gk.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_silent_call_fails_heartbeat() {
    init_tracing();
    let network = MemoryNetwork::new();
    let gk = start_gatekeeper(
        &network,
        GatekeeperConfig::new(GK).with_info_response_rate(Duration::from_secs(10)),
    );
    let mut events = gk.subscribe();
    let alice = TestEndpoint::new(&network, 1, &["alice"]);
    let bob = TestEndpoint::new(&network, 2, &["bob"]);
    alice.register(600).await;
    bob.register(600).await;

    let (arq, outcome) = alice.call("bob", 200).await;
    match outcome.confirmed().map(|reply| &reply.body) {
        Some(RasBody::AdmissionConfirm(acf)) => assert_eq!(acf.irr_frequency, Some(10)),
        other => panic!("Expected ACF, got {:?}", other),
    }

    // Probes are answered while the endpoint is alive
    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(gk.admission().call_count(), 1);

    alice.go_silent();
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(gk.admission().call_count(), 0);
    assert_eq!(gk.admission().ledger().used(), 0);
    assert!(gk.registry().find_by_alias("alice").is_some());

    let ended = ended_calls(&mut events);
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0].key.call_identifier, arq.call_identifier);
    assert_eq!(ended[0].end_reason, Some(CallEndReason::HeartbeatFailure));
    gk.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_failure_can_unregister_endpoint() {
    init_tracing();
    let network = MemoryNetwork::new();
    let policy = AdmissionPolicy {
        info_response_rate: Some(Duration::from_secs(10)),
        unregister_on_heartbeat_failure: true,
        ..Default::default()
    };
    let gk = start_gatekeeper(&network, GatekeeperConfig::new(GK).with_admission_policy(policy));
    let alice = TestEndpoint::new(&network, 1, &["alice"]);
    let bob = TestEndpoint::new(&network, 2, &["bob"]);
    alice.register(600).await;
    bob.register(600).await;
    alice.call("bob", 200).await;

    alice.go_silent();
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert!(gk.registry().find_by_alias("alice").is_none());
    assert!(gk.registry().find_by_alias("bob").is_some());
    gk.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_administrative_clear_sends_forced_drop() {
    init_tracing();
    let network = MemoryNetwork::new();
    let gk = start_gatekeeper(&network, GatekeeperConfig::new(GK));
    let alice = TestEndpoint::new(&network, 1, &["alice"]);
    let bob = TestEndpoint::new(&network, 2, &["bob"]);
    alice.register(600).await;
    bob.register(600).await;
    let (arq, _) = alice.call("bob", 200).await;

    let cleared = gk.clear_call(arq.call_identifier).unwrap();
    assert_eq!(cleared.len(), 1);
    assert_eq!(cleared[0].end_reason, Some(CallEndReason::AdministrativeClear));
    assert_eq!(gk.admission().ledger().used(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let inbox = alice.handler.inbox.lock();
    assert_eq!(inbox.disengages.len(), 1);
    assert_eq!(inbox.disengages[0].reason, DisengageReason::ForcedDrop);
    assert_eq!(inbox.disengages[0].call_identifier, arq.call_identifier);
    drop(inbox);

    assert!(matches!(
        gk.clear_call(arq.call_identifier),
        Err(GatekeeperError::CallNotFound(_))
    ));
    gk.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_forced_unregistration_notifies_endpoint() {
    init_tracing();
    let network = MemoryNetwork::new();
    let gk = start_gatekeeper(&network, GatekeeperConfig::new(GK));
    let alice = TestEndpoint::new(&network, 1, &["alice"]);
    let rcf = alice.register(600).await;

    let info = gk.force_unregister(&rcf.endpoint_identifier).unwrap();
    assert_eq!(info.aliases, vec!["alice".to_string()]);
    assert!(gk.registry().is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let inbox = alice.handler.inbox.lock();
    assert_eq!(inbox.unregistrations.len(), 1);
    assert_eq!(
        inbox.unregistrations[0].endpoint_identifier.as_deref(),
        Some(rcf.endpoint_identifier.as_str())
    );
    drop(inbox);
    gk.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_gatekeeper_identifier_checks() {
    init_tracing();
    let network = MemoryNetwork::new();
    let alternate = AlternateGatekeeper::new(SocketAddr::from(([10, 0, 1, 1], 1719)), 1);
    let gk = start_gatekeeper(&network, GatekeeperConfig::new(GK).with_alternate(alternate.clone()));
    let alice = TestEndpoint::new(&network, 1, &["alice"]);

    let grq = |gatekeeper_identifier: Option<&str>| {
        RasBody::GatekeeperRequest(GatekeeperRequest {
            ras_address: ras_addr(1),
            endpoint_kind: EndpointKind::Terminal,
            gatekeeper_identifier: gatekeeper_identifier.map(str::to_string),
            endpoint_aliases: vec!["alice".into()],
            supports_alt_gk: true,
        })
    };

    match alice.request(grq(None)).await.into_confirmed().map(|reply| reply.body) {
        Some(RasBody::GatekeeperConfirm(gcf)) => {
            assert_eq!(gcf.gatekeeper_identifier.as_deref(), Some(GK));
            assert_eq!(gcf.ras_address, gk_addr());
            assert_eq!(gcf.alternate_gatekeepers, vec![alternate]);
        }
        other => panic!("Expected GCF, got {:?}", other),
    }

    let outcome = alice.request(grq(Some("other"))).await;
    assert_eq!(
        outcome.reject_reason(),
        Some(&RejectReason::Gatekeeper(GatekeeperRejectReason::UndefinedReason))
    );

    let mut rrq = alice.rrq(60);
    rrq.gatekeeper_identifier = Some("other".into());
    let outcome = alice.request(RasBody::RegistrationRequest(rrq)).await;
    assert_eq!(
        outcome.reject_reason(),
        Some(&RejectReason::Registration(RegistrationRejectReason::UndefinedReason))
    );
    assert!(gk.registry().is_empty());
    gk.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_alias_rejected() {
    init_tracing();
    let network = MemoryNetwork::new();
    let gk = start_gatekeeper(
        &network,
        GatekeeperConfig::new(GK).with_registration_policy(RegistrationPolicy::default()),
    );
    let first = TestEndpoint::new(&network, 1, &["alice"]);
    let second = TestEndpoint::new(&network, 2, &["alice", "bob"]);
    first.register(60).await;

    let outcome = second.request(RasBody::RegistrationRequest(second.rrq(60))).await;
    assert_eq!(
        outcome.reject_reason(),
        Some(&RejectReason::Registration(RegistrationRejectReason::DuplicateAlias(vec![
            "alice".to_string()
        ])))
    );
    assert!(gk.registry().find_by_alias("bob").is_none());
    gk.shutdown().await.unwrap();
}
