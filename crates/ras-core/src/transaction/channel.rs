use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use super::cache::{CacheKey, CacheLookup, ResponseCache};
use super::pending::{PendingEntry, PendingGuard, PendingSignal, PendingTable};
use super::sequence::SequenceAllocator;
use super::{TransactionConfig, TransactionOutcome};
use crate::auth::AuthenticatorChain;
use crate::codec::{JsonCodec, RasCodec};
use crate::error::{Error, Result};
use crate::message::{
    ExpectedReply, RasBody, RasMessage, RejectReason, RequestInProgress,
};
use crate::transport::{Transport, TransportEvent};

/// A request received from a peer.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub message: RasMessage,
    pub source: SocketAddr,
}

/// Application logic answering inbound requests.
///
/// Returning `None` sends nothing; the request is forgotten and a
/// retransmission will be handled again.
#[async_trait::async_trait]
pub trait RasRequestHandler: Send + Sync + 'static {
    async fn handle_request(&self, channel: RasChannel, request: InboundRequest) -> Option<RasBody>;
}

/// Builder for [`RasChannel`].
pub struct RasChannelBuilder {
    transport: Arc<dyn Transport>,
    events: mpsc::Receiver<TransportEvent>,
    codec: Arc<dyn RasCodec>,
    authenticators: AuthenticatorChain,
    config: TransactionConfig,
    handler: Option<Arc<dyn RasRequestHandler>>,
}

impl RasChannelBuilder {
    pub fn new(transport: Arc<dyn Transport>, events: mpsc::Receiver<TransportEvent>) -> Self {
        Self {
            transport,
            events,
            codec: Arc::new(JsonCodec::new()),
            authenticators: AuthenticatorChain::new(),
            config: TransactionConfig::default(),
            handler: None,
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn RasCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_authenticators(mut self, authenticators: AuthenticatorChain) -> Self {
        self.authenticators = authenticators;
        self
    }

    pub fn with_config(mut self, config: TransactionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn RasRequestHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Start the receive loop and the cache sweeper.
    pub fn start(self) -> Result<RasChannel> {
        let local_addr = self.transport.local_addr()?;
        let inner = Arc::new(ChannelInner {
            local_addr,
            transport: self.transport,
            codec: self.codec,
            authenticators: self.authenticators,
            cache: ResponseCache::new(self.config.response_retire_period),
            config: self.config,
            sequence: SequenceAllocator::new(),
            pending: Arc::new(PendingTable::default()),
            handler: self.handler,
            accepting: AtomicBool::new(true),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        });

        let channel = RasChannel { inner };
        channel.spawn_receive_loop(self.events);
        channel.spawn_cache_sweeper();
        info!("RAS channel started on {}", local_addr);
        Ok(channel)
    }
}

/// One RAS listener: client transactions, server dispatch and the response
/// cache for a single transport.
#[derive(Clone)]
pub struct RasChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    local_addr: SocketAddr,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn RasCodec>,
    authenticators: AuthenticatorChain,
    config: TransactionConfig,
    sequence: SequenceAllocator,
    pending: Arc<PendingTable>,
    cache: ResponseCache,
    handler: Option<Arc<dyn RasRequestHandler>>,
    accepting: AtomicBool,
    /// In-flight request dispatches and handlers
    tasks: TaskTracker,
    /// Stops the receive loop and sweeper
    shutdown: CancellationToken,
}

impl RasChannel {
    pub fn builder(
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> RasChannelBuilder {
        RasChannelBuilder::new(transport, events)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.inner.config
    }

    /// Number of client requests currently awaiting a reply
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Number of entries in the response cache
    pub fn cached_responses(&self) -> usize {
        self.inner.cache.len()
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Run a client transaction against `targets`.
    ///
    /// Every attempt sends the same encoded request to all targets. Returns
    /// once a terminal reply arrives or every attempt has timed out.
    pub async fn request(&self, body: RasBody, targets: &[SocketAddr]) -> Result<TransactionOutcome> {
        if !self.is_accepting() {
            return Err(Error::ShuttingDown);
        }
        let expected = body
            .expected_reply()
            .ok_or_else(|| Error::invalid_request(format!("{} expects no reply", body.kind())))?;
        if targets.is_empty() {
            return Err(Error::invalid_request("no destination for request"));
        }

        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let seq = self.inner.pending.insert(
            &self.inner.sequence,
            PendingEntry {
                expected,
                signal: signal_tx,
            },
        )?;
        let _guard = PendingGuard {
            table: self.inner.pending.clone(),
            seq,
        };

        let mut message = RasMessage::new(seq, body);
        self.inner.authenticators.prepare_tokens(&mut message);
        let encoded = self.inner.codec.encode(&message)?;

        let config = &self.inner.config;
        let attempts = config.max_attempts.max(1);
        for attempt in 1..=attempts {
            debug!(seq, attempt, "Sending {} to {:?}", message, targets);
            self.send_to_all(&encoded, targets).await;

            let mut deadline = Instant::now() + config.request_timeout;
            loop {
                match tokio::time::timeout_at(deadline, signal_rx.recv()).await {
                    Ok(Some(PendingSignal::Final(outcome))) => {
                        debug!(seq, "{} finished: {}", message, outcome);
                        return Ok(outcome);
                    }
                    Ok(Some(PendingSignal::InProgress(delay))) => {
                        // Extend, never shorten, and do not count an attempt
                        deadline = deadline.max(Instant::now() + delay);
                        debug!(seq, "{} in progress, waiting {:?} more", message, delay);
                    }
                    Ok(None) => return Ok(TransactionOutcome::NoResponse),
                    Err(_) => break,
                }
            }

            if attempt < attempts {
                debug!(seq, attempt, "Timeout on {}, retrying", message);
            }
        }

        warn!(seq, "No response to {} from {:?} after {} attempts", message, targets, attempts);
        Ok(TransactionOutcome::NoResponse)
    }

    /// Send a message that expects no reply, such as an unsolicited IRR
    /// without `need_response`.
    pub async fn send_unsolicited(&self, body: RasBody, destination: SocketAddr) -> Result<()> {
        let mut message = RasMessage::new(self.inner.sequence.next(), body);
        self.inner.authenticators.prepare_tokens(&mut message);
        let encoded = self.inner.codec.encode(&message)?;
        self.inner.transport.send_datagram(&encoded, destination).await
    }

    /// Stop accepting requests, wait for in-flight handlers, then close the
    /// transport.
    pub async fn shutdown(&self) -> Result<()> {
        if !self.inner.accepting.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutting down RAS channel on {}", self.inner.local_addr);

        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        self.inner.shutdown.cancel();
        self.inner.transport.close().await?;
        debug!("RAS channel on {} closed", self.inner.local_addr);
        Ok(())
    }

    async fn send_to_all(&self, data: &[u8], targets: &[SocketAddr]) {
        for target in targets {
            if let Err(e) = self.inner.transport.send_datagram(data, *target).await {
                // Retried on the next attempt like any lost datagram
                warn!("Failed to send RAS request to {}: {}", target, e);
            }
        }
    }

    async fn send_bytes(&self, data: &[u8], destination: SocketAddr) {
        if let Err(e) = self.inner.transport.send_datagram(data, destination).await {
            warn!("Failed to send RAS reply to {}: {}", destination, e);
        }
    }

    fn spawn_receive_loop(&self, mut events: mpsc::Receiver<TransportEvent>) {
        let channel = self.clone();
        tokio::spawn(async move {
            let shutdown = channel.inner.shutdown.clone();
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };

                match event {
                    Some(TransportEvent::DatagramReceived { data, source, .. }) => {
                        channel.on_datagram(data, source).await;
                    }
                    Some(TransportEvent::Error { error }) => {
                        warn!("Transport error on {}: {}", channel.inner.local_addr, error);
                    }
                    Some(TransportEvent::Closed) | None => break,
                }
            }
            debug!("RAS receive loop on {} terminated", channel.inner.local_addr);
        });
    }

    fn spawn_cache_sweeper(&self) {
        let inner = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let interval = self.inner.config.cache_sweep_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(inner) = inner.upgrade() else { break };
                let retired = inner.cache.retire_expired(Instant::now());
                if retired > 0 {
                    trace!("Retired {} cached responses on {}", retired, inner.local_addr);
                }
            }
        });
    }

    async fn on_datagram(&self, data: Bytes, source: SocketAddr) {
        let message = match self.inner.codec.decode(&data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Undecodable datagram from {}: {}", source, e);
                if let Some(seq) = self.inner.codec.peek_sequence_number(&data) {
                    let reply = RasMessage::new(seq, RasBody::UnknownMessageResponse);
                    if let Ok(encoded) = self.inner.codec.encode(&reply) {
                        self.send_bytes(&encoded, source).await;
                    }
                }
                return;
            }
        };

        trace!("Received {} from {}", message, source);
        if message.is_request() {
            self.on_request(message, data, source);
        } else {
            self.on_response(message, &data, source);
        }
    }

    fn on_response(&self, message: RasMessage, raw: &[u8], source: SocketAddr) {
        let seq = message.sequence_number;
        let Some((expected, signal)) = self.inner.pending.lookup(seq) else {
            debug!("Ignoring {} from {}: no pending request", message, source);
            return;
        };

        let signal_value = if let RasBody::RequestInProgress(RequestInProgress { delay_ms }) = message.body {
            PendingSignal::InProgress(Duration::from_millis(delay_ms as u64))
        } else {
            match self.inner.authenticators.accepts(&message, raw) {
                Err(result) => {
                    warn!("{} from {} failed token validation: {}", message, source, result);
                    PendingSignal::Final(TransactionOutcome::BadCryptoTokens {
                        reply: message,
                        result,
                    })
                }
                Ok(()) => PendingSignal::Final(classify_reply(expected, message)),
            }
        };

        // The requester may have stopped waiting already
        let _ = signal.send(signal_value);
    }

    fn on_request(&self, message: RasMessage, raw: Bytes, source: SocketAddr) {
        if !self.is_accepting() {
            debug!("Dropping {} from {}: shutting down", message, source);
            return;
        }
        let channel = self.clone();
        self.inner.tasks.spawn(async move {
            channel.dispatch_request(message, raw, source).await;
        });
    }

    async fn dispatch_request(&self, message: RasMessage, raw: Bytes, source: SocketAddr) {
        let key: CacheKey = (source, message.sequence_number);

        match self.inner.cache.begin(key) {
            CacheLookup::New => {}
            CacheLookup::Replay(reply) => {
                debug!("Retransmitted {} from {}, resending cached reply", message, source);
                self.send_bytes(&reply, source).await;
                return;
            }
            CacheLookup::Wait(mut rx) => {
                debug!("Duplicate {} from {} while in progress, holding", message, source);
                let reply = match rx.wait_for(Option::is_some).await {
                    Ok(reply) => reply.clone(),
                    Err(_) => None,
                };
                if let Some(reply) = reply {
                    self.send_bytes(&reply, source).await;
                }
                return;
            }
        }

        if let Err(result) = self.inner.authenticators.accepts(&message, &raw) {
            warn!("{} from {} failed token validation: {}", message, source, result);
            match message.body.security_reject() {
                Some(reject) => self.finish(key, message.reply(reject)).await,
                None => self.inner.cache.abandon(key),
            }
            return;
        }

        let Some(handler) = self.inner.handler.clone() else {
            debug!("No handler for {} from {}", message, source);
            self.inner.cache.abandon(key);
            return;
        };

        let seq = message.sequence_number;
        let request = InboundRequest { message, source };
        let channel = self.clone();
        let mut task = self
            .inner
            .tasks
            .spawn(async move { handler.handle_request(channel, request).await });

        let joined = match tokio::time::timeout(self.inner.config.fast_response_budget, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                let delay = self.inner.config.request_in_progress_delay;
                debug!(seq, "Handler for request from {} is slow, sending RIP", source);
                self.send_in_progress(seq, delay, source).await;
                self.inner.cache.extend(key, delay);
                task.await
            }
        };

        match joined {
            Ok(Some(body)) => self.finish(key, RasMessage::new(seq, body)).await,
            Ok(None) => self.inner.cache.abandon(key),
            Err(e) => {
                error!(seq, "Handler for request from {} failed: {}", source, e);
                self.inner.cache.abandon(key);
            }
        }
    }

    /// Cache the final reply, then send it.
    async fn finish(&self, key: CacheKey, mut reply: RasMessage) {
        self.inner.authenticators.prepare_tokens(&mut reply);
        match self.inner.codec.encode(&reply) {
            Ok(encoded) => {
                self.inner.cache.complete(key, encoded.clone());
                debug!("Sending {} to {}", reply, key.0);
                self.send_bytes(&encoded, key.0).await;
            }
            Err(e) => {
                error!("Failed to encode {}: {}", reply, e);
                self.inner.cache.abandon(key);
            }
        }
    }

    async fn send_in_progress(&self, seq: u16, delay: Duration, destination: SocketAddr) {
        let delay_ms = delay.as_millis().min(u16::MAX as u128) as u32;
        let mut rip = RasMessage::new(seq, RasBody::RequestInProgress(RequestInProgress { delay_ms }));
        self.inner.authenticators.prepare_tokens(&mut rip);
        match self.inner.codec.encode(&rip) {
            Ok(encoded) => self.send_bytes(&encoded, destination).await,
            Err(e) => error!("Failed to encode {}: {}", rip, e),
        }
    }
}

/// Map a validated reply onto the outcome of the request it answers.
fn classify_reply(expected: ExpectedReply, reply: RasMessage) -> TransactionOutcome {
    let kind = reply.kind();
    if kind == expected.confirm {
        return TransactionOutcome::Confirmed(reply);
    }
    if Some(kind) == expected.reject {
        let reason = reply.body.reject_reason().unwrap_or(RejectReason::Mismatched);
        return if reason.is_try_alternate() {
            TransactionOutcome::TryAlternate { reply, reason }
        } else {
            TransactionOutcome::Rejected { reply, reason }
        };
    }
    warn!("Reply {} does not answer a request expecting {}", reply, expected.confirm);
    TransactionOutcome::Rejected {
        reply,
        reason: RejectReason::Mismatched,
    }
}

impl fmt::Debug for RasChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RasChannel")
            .field("local_addr", &self.inner.local_addr)
            .field("transport", &self.inner.transport)
            .field("codec", &self.inner.codec.name())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}
