//! Background upkeep: registration renewal, recovery of a lost
//! registration, and call heartbeats.

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::GatekeeperClient;
use crate::state::ClientState;

const TICK: Duration = Duration::from_secs(1);

/// When a registration confirmed at `confirmed_at` for `ttl` should be
/// refreshed: `margin` before it lapses, but never earlier than half-way.
pub(crate) fn renewal_deadline(confirmed_at: Instant, ttl: Duration, margin: Duration) -> Instant {
    confirmed_at + ttl.saturating_sub(margin).max(ttl / 2)
}

/// Exponential pause between attempts to get registered again.
#[derive(Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    next_attempt: Option<Instant>,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            next_attempt: None,
        }
    }

    /// Whether an attempt may start at `now`. The first call only arms the
    /// timer.
    fn due(&mut self, now: Instant) -> bool {
        match self.next_attempt {
            Some(at) => now >= at,
            None => {
                self.next_attempt = Some(now + self.current);
                false
            }
        }
    }

    /// Record a failed attempt and return the pause before the next one.
    fn failed(&mut self, now: Instant) -> Duration {
        self.current = (self.current * 2).min(self.max);
        self.next_attempt = Some(now + self.current);
        self.current
    }

    fn reset(&mut self) {
        self.current = self.initial;
        self.next_attempt = None;
    }
}

pub(crate) async fn run(client: GatekeeperClient) {
    let config = &client.shared.config;
    let mut backoff = Backoff::new(config.reregistration_delay, config.max_reregistration_delay);
    let mut interval = tokio::time::interval(TICK);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let now = Instant::now();

        if client.renewal_due(now) {
            debug!("Registration renewal due");
            if let Err(e) = client.keep_alive().await {
                warn!("Registration renewal failed: {}", e);
            }
        } else if !client.recovery_due() {
            backoff.reset();
        } else if backoff.due(now) {
            info!("Registering again after failure");
            client.shared.session.lock().endpoint_identifier = None;
            match client.register().await {
                Ok(_) => backoff.reset(),
                Err(e) => {
                    let pause = backoff.failed(Instant::now());
                    warn!("Registration still failing, next attempt in {:?}: {}", pause, e);
                }
            }
        }

        let due = client.shared.calls.claim_heartbeats(now);
        if !due.is_empty() {
            if let Err(e) = client.send_info_response(due).await {
                debug!("Heartbeat not sent: {}", e);
            }
        }
    }
}

impl GatekeeperClient {
    /// A registration that used to exist has failed and nobody asked to
    /// leave.
    fn recovery_due(&self) -> bool {
        let session = self.shared.session.lock();
        session.state == ClientState::Failed
            && session.recovering
            && self.shared.config.reregister_on_lost_registration
    }

    fn renewal_due(&self, now: Instant) -> bool {
        let session = self.shared.session.lock();
        if !session.state.is_registered() {
            return false;
        }
        match (session.confirmed_at, session.time_to_live) {
            (Some(confirmed_at), Some(ttl)) => {
                let ttl = Duration::from_secs(u64::from(ttl));
                now >= renewal_deadline(confirmed_at, ttl, self.shared.config.renewal_margin)
            }
            _ => false,
        }
    }
}
