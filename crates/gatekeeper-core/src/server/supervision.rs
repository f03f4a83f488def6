//! Periodic liveness checks.
//!
//! The TTL sweep probes endpoints whose registration lapsed; the heartbeat
//! sweep probes calls whose unsolicited IRRs stopped. Each subject gets one
//! IRQ and is removed if it goes unanswered.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use h323_ras_core::RasChannel;
use h323_ras_core::message::{CallIdentifier, InfoRequest, RasBody};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::handler::GatekeeperCore;
use crate::admission::{CallEndReason, CallKey, GatekeeperCall};
use crate::events::RemovalCause;
use crate::registry::RegisteredEndpoint;

/// Runs `future` on `tasks` until it completes or `shutdown` fires.
pub(crate) fn spawn_tracked<F>(tasks: &TaskTracker, shutdown: &CancellationToken, future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let shutdown = shutdown.clone();
    tasks.spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = future => {}
        }
    });
}

fn sweep_interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

pub(crate) async fn run_ttl_sweep(
    core: Arc<GatekeeperCore>,
    channel: RasChannel,
    tasks: TaskTracker,
    shutdown: CancellationToken,
) {
    let mut interval = sweep_interval(core.config.ttl_sweep_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        for endpoint in core.registry.expired(Instant::now()) {
            if !endpoint.begin_probe() {
                continue;
            }
            spawn_tracked(&tasks, &shutdown, probe_endpoint(core.clone(), channel.clone(), endpoint));
        }
    }
    debug!("TTL sweep stopped");
}

async fn probe_endpoint(core: Arc<GatekeeperCore>, channel: RasChannel, endpoint: Arc<RegisteredEndpoint>) {
    let identifier = endpoint.identifier().to_string();
    let targets = endpoint.ras_addresses();
    debug!(endpoint = %identifier, "Registration lapsed, probing {:?}", targets);

    let irq = RasBody::InfoRequest(InfoRequest {
        call_reference: 0,
        call_identifier: CallIdentifier::nil(),
        reply_address: Some(core.ras_address),
    });
    let alive = if targets.is_empty() {
        false
    } else {
        match channel.request(irq, &targets).await {
            Ok(outcome) => match outcome.into_confirmed().map(|reply| reply.body) {
                Some(RasBody::InfoRequestResponse(irr)) if irr.endpoint_identifier == identifier => {
                    core.admission.on_info_response(&irr);
                    true
                }
                _ => false,
            },
            Err(e) => {
                debug!(endpoint = %identifier, "Liveness probe abandoned: {}", e);
                endpoint.end_probe();
                return;
            }
        }
    };

    if alive {
        debug!(endpoint = %identifier, "Endpoint answered liveness probe");
        return;
    }
    match core.registry.unregister_lapsed(&endpoint, Instant::now()) {
        Some(removed) => {
            info!(endpoint = %identifier, "Endpoint did not answer liveness probe, removing");
            core.retire_endpoint(&removed, RemovalCause::Expired, CallEndReason::EndpointExpired);
        }
        None => {
            debug!(endpoint = %identifier, "Endpoint renewed during the liveness check, keeping it");
            endpoint.end_probe();
        }
    }
}

pub(crate) async fn run_heartbeat_sweep(
    core: Arc<GatekeeperCore>,
    channel: RasChannel,
    tasks: TaskTracker,
    shutdown: CancellationToken,
) {
    let mut interval = sweep_interval(core.config.heartbeat_sweep_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        for call in core.admission.claim_stale_calls(Instant::now()) {
            spawn_tracked(&tasks, &shutdown, probe_call(core.clone(), channel.clone(), call));
        }
    }
    debug!("Heartbeat sweep stopped");
}

async fn probe_call(core: Arc<GatekeeperCore>, channel: RasChannel, call: Arc<GatekeeperCall>) {
    let key = call.key();
    debug!(call = %key, "Heartbeat overdue, probing {}", call.ras_address());

    let irq = RasBody::InfoRequest(InfoRequest {
        call_reference: call.call_reference(),
        call_identifier: call.call_identifier(),
        reply_address: Some(core.ras_address),
    });
    let outcome = match channel.request(irq, &[call.ras_address()]).await {
        Ok(outcome) => outcome,
        Err(e) => {
            debug!(call = %key, "Heartbeat probe abandoned: {}", e);
            call.end_probe();
            return;
        }
    };

    if let Some(RasBody::InfoRequestResponse(irr)) = outcome.into_confirmed().map(|reply| reply.body) {
        let listed = irr
            .per_call_info
            .iter()
            .any(|info| CallKey::new(info.call_identifier, info.answered_call) == key);
        if listed && irr.endpoint_identifier == call.endpoint_identifier() {
            core.admission.on_info_response(&irr);
            debug!(call = %key, "Call answered heartbeat probe");
            return;
        }
    }

    warn!(call = %key, endpoint = %call.endpoint_identifier(), "Heartbeat probe failed, clearing call");
    core.end_call(&key, CallEndReason::HeartbeatFailure);
    if core.config.admission.unregister_on_heartbeat_failure {
        core.remove_endpoint(
            call.endpoint_identifier(),
            RemovalCause::HeartbeatFailure,
            CallEndReason::EndpointUnregistered,
        );
    }
}
