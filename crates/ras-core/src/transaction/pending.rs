//! Table of client requests awaiting a reply, keyed by sequence number.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::TransactionOutcome;
use super::sequence::SequenceAllocator;
use crate::error::{Error, Result};
use crate::message::{ExpectedReply, SequenceNumber};

/// Delivered by the receive loop to the task waiting on a request.
#[derive(Debug)]
pub(crate) enum PendingSignal {
    /// The peer sent RIP; wait at least this much longer
    InProgress(Duration),
    /// The transaction is over
    Final(TransactionOutcome),
}

pub(crate) struct PendingEntry {
    pub expected: ExpectedReply,
    pub signal: mpsc::UnboundedSender<PendingSignal>,
}

#[derive(Default)]
pub(crate) struct PendingTable {
    entries: Mutex<HashMap<SequenceNumber, PendingEntry>>,
}

impl PendingTable {
    /// Register a request under a fresh sequence number that is not in use
    /// by any other pending request.
    pub fn insert(&self, allocator: &SequenceAllocator, entry: PendingEntry) -> Result<SequenceNumber> {
        let mut entries = self.entries.lock();
        for _ in 0..=u16::MAX {
            let seq = allocator.next();
            if !entries.contains_key(&seq) {
                entries.insert(seq, entry);
                return Ok(seq);
            }
        }
        Err(Error::SequenceExhausted)
    }

    /// What the request with `seq` expects, and how to signal it.
    pub fn lookup(
        &self,
        seq: SequenceNumber,
    ) -> Option<(ExpectedReply, mpsc::UnboundedSender<PendingSignal>)> {
        self.entries
            .lock()
            .get(&seq)
            .map(|entry| (entry.expected, entry.signal.clone()))
    }

    pub fn remove(&self, seq: SequenceNumber) {
        self.entries.lock().remove(&seq);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Removes a request from the table when its owner stops waiting.
pub(crate) struct PendingGuard {
    pub table: Arc<PendingTable>,
    pub seq: SequenceNumber,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.remove(self.seq);
    }
}
