//! Retrying requests against alternate gatekeepers.
//!
//! A request goes to the current gatekeeper first. If the outcome is a
//! try-alternate reject or no response at all, the same logical request is
//! rebuilt for each alternate, in priority order, until one confirms. When
//! every alternate fails the caller sees the outcome of the first attempt.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use h323_ras_core::message::{RasBody, RasKind};
use h323_ras_core::{Error, TransactionOutcome};
use tracing::{debug, info, warn};

use super::GatekeeperClient;
use crate::alternates::{AlternateEntry, AlternateRegistrationState};
use crate::error::{ClientError, ClientResult};

/// Where a request is addressed and who we are there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Binding {
    pub(crate) gatekeeper: SocketAddr,
    pub(crate) gatekeeper_identifier: Option<String>,
    pub(crate) endpoint_identifier: Option<String>,
}

impl Binding {
    fn for_alternate(alternate: &AlternateEntry, endpoint_identifier: Option<String>) -> Self {
        Self {
            gatekeeper: alternate.address,
            gatekeeper_identifier: alternate.identifier.clone(),
            endpoint_identifier,
        }
    }
}

/// Holds the client's failover flag for the duration of one walk.
struct FailoverWalk<'a> {
    flag: &'a AtomicBool,
}

impl<'a> FailoverWalk<'a> {
    /// `None` if another walk is already in progress.
    fn begin(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Self { flag })
        }
    }
}

impl Drop for FailoverWalk<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl GatekeeperClient {
    /// Run a request against the current gatekeeper, failing over to the
    /// alternates when it is unavailable.
    ///
    /// `build` is called once per gatekeeper tried. Returns the final outcome
    /// and the binding that produced it.
    pub(crate) async fn transact<F>(&self, build: F) -> ClientResult<(TransactionOutcome, Binding)>
    where
        F: Fn(&Binding) -> RasBody,
    {
        let primary = self.shared.binding().ok_or(ClientError::NotRegistered)?;
        let body = build(&primary);
        let kind = body.kind();

        let outcome = match self.channel.request(body, &[primary.gatekeeper]).await {
            Ok(outcome) => outcome,
            Err(e @ (Error::ShuttingDown | Error::InvalidRequest { .. } | Error::Codec(_))) => {
                return Err(e.into());
            }
            Err(e) => {
                warn!("{:?} to {} failed: {}", kind, primary.gatekeeper, e);
                TransactionOutcome::NoResponse
            }
        };
        self.learn_alternates(&outcome);

        if !outcome.should_try_alternate() || !self.shared.config.failover {
            return Ok((outcome, primary));
        }
        let Some(_walk) = FailoverWalk::begin(&self.shared.failing_over) else {
            debug!("{:?} to {}: {}, failover already in progress", kind, primary.gatekeeper, outcome);
            return Ok((outcome, primary));
        };

        let candidates = self.shared.session.lock().alternates.candidates(primary.gatekeeper);
        if candidates.is_empty() {
            return Ok((outcome, primary));
        }
        info!(
            "{:?} to {}: {}, trying {} alternate gatekeepers",
            kind,
            primary.gatekeeper,
            outcome,
            candidates.len()
        );

        let registers_itself = matches!(kind, RasKind::Grq | RasKind::Rrq);
        for alternate in candidates {
            let mut binding = Binding::for_alternate(&alternate, primary.endpoint_identifier.clone());
            if alternate.needs_registration() && !registers_itself {
                match self.register_with_alternate(&binding).await {
                    Some(identifier) => binding.endpoint_identifier = Some(identifier),
                    None => continue,
                }
            }

            match self.channel.request(build(&binding), &[binding.gatekeeper]).await {
                Ok(TransactionOutcome::Confirmed(reply)) => {
                    info!("{:?} confirmed by alternate gatekeeper {}", kind, binding.gatekeeper);
                    if !registers_itself {
                        self.shared.switch_to(&binding);
                    }
                    return Ok((TransactionOutcome::Confirmed(reply), binding));
                }
                Ok(other) => debug!("Alternate {} answered {:?}: {}", binding.gatekeeper, kind, other),
                Err(Error::ShuttingDown) => return Err(Error::ShuttingDown.into()),
                Err(e) => debug!("{:?} to alternate {} failed: {}", kind, binding.gatekeeper, e),
            }
        }

        warn!("No alternate gatekeeper confirmed {:?}", kind);
        Ok((outcome, primary))
    }

    /// Full registration with an alternate before sending it other requests.
    async fn register_with_alternate(&self, binding: &Binding) -> Option<String> {
        let address = binding.gatekeeper;
        self.shared
            .set_alternate_state(address, AlternateRegistrationState::Registering);
        debug!("Registering with alternate gatekeeper {}", address);

        let outcome = self.channel.request(self.full_registration(binding), &[address]).await;
        if let Ok(TransactionOutcome::Confirmed(reply)) = outcome {
            if let RasBody::RegistrationConfirm(rcf) = reply.body {
                return Some(self.on_registered(rcf, binding));
            }
        }

        debug!("Registration with alternate {} failed", address);
        self.shared
            .set_alternate_state(address, AlternateRegistrationState::Failed);
        None
    }

    /// Rejects may carry alternates of their own.
    fn learn_alternates(&self, outcome: &TransactionOutcome) {
        let reply = match outcome {
            TransactionOutcome::Rejected { reply, .. } | TransactionOutcome::TryAlternate { reply, .. } => reply,
            _ => return,
        };
        let advertised = match &reply.body {
            RasBody::GatekeeperReject(grj) => &grj.alternate_gatekeepers,
            RasBody::RegistrationReject(rrj) => &rrj.alternate_gatekeepers,
            _ => return,
        };
        if !advertised.is_empty() {
            self.shared.merge_alternates(advertised, false);
        }
    }
}
