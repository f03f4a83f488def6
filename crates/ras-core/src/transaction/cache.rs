//! Cache of replies sent for inbound requests, keyed by `(source, sequence)`.
//!
//! An entry is created the moment a request is first dispatched and stays
//! *in flight* until its reply is known. Retransmissions of a request whose
//! reply is cached get that exact reply again; retransmissions arriving while
//! the entry is in flight wait for it. Ready entries are retired once they
//! have been idle for their retirement age.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::trace;

use crate::message::SequenceNumber;

pub(crate) type CacheKey = (SocketAddr, SequenceNumber);

enum ResponseState {
    InFlight(watch::Sender<Option<Bytes>>),
    Ready(Bytes),
}

struct CachedResponse {
    state: ResponseState,
    last_used: Instant,
    retirement_age: Duration,
}

/// Result of looking up an inbound request.
pub(crate) enum CacheLookup {
    /// First sighting; the caller now owns the in-flight entry
    New,
    /// Reply already known; resend it
    Replay(Bytes),
    /// First copy still being handled; wait for its reply
    Wait(watch::Receiver<Option<Bytes>>),
}

pub(crate) struct ResponseCache {
    entries: Mutex<HashMap<CacheKey, CachedResponse>>,
    retire_period: Duration,
}

impl ResponseCache {
    pub fn new(retire_period: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retire_period,
        }
    }

    pub fn begin(&self, key: CacheKey) -> CacheLookup {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&key) {
            entry.last_used = Instant::now();
            return match &entry.state {
                ResponseState::Ready(bytes) => CacheLookup::Replay(bytes.clone()),
                ResponseState::InFlight(tx) => CacheLookup::Wait(tx.subscribe()),
            };
        }

        let (tx, _rx) = watch::channel(None);
        entries.insert(
            key,
            CachedResponse {
                state: ResponseState::InFlight(tx),
                last_used: Instant::now(),
                retirement_age: self.retire_period,
            },
        );
        CacheLookup::New
    }

    /// Store the final reply and release any held duplicates.
    pub fn complete(&self, key: CacheKey, reply: Bytes) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key).or_insert_with(|| CachedResponse {
            state: ResponseState::Ready(reply.clone()),
            last_used: Instant::now(),
            retirement_age: self.retire_period,
        });
        let previous = std::mem::replace(&mut entry.state, ResponseState::Ready(reply.clone()));
        entry.last_used = Instant::now();
        if let ResponseState::InFlight(tx) = previous {
            tx.send_replace(Some(reply));
        }
    }

    /// Forget an in-flight entry whose request produced no reply. Held
    /// duplicates observe the closed channel and give up.
    pub fn abandon(&self, key: CacheKey) {
        self.entries.lock().remove(&key);
    }

    /// A RIP was announced: keep the entry around for the extra delay too.
    pub fn extend(&self, key: CacheKey, delay: Duration) {
        if let Some(entry) = self.entries.lock().get_mut(&key) {
            entry.retirement_age = self.retire_period + delay;
        }
    }

    /// Drop ready entries idle for longer than their retirement age.
    pub fn retire_expired(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, entry| {
            let keep = matches!(entry.state, ResponseState::InFlight(_))
                || now.saturating_duration_since(entry.last_used) <= entry.retirement_age;
            if !keep {
                trace!("Retiring cached response for {:?}", key);
            }
            keep
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
