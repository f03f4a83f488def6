//! In-process datagram network.
//!
//! Every [`MemoryTransport`] bound on a [`MemoryNetwork`] can reach every
//! other by address. Delivery is immediate and ordered unless a drop filter
//! discards the datagram, which lets tests reproduce packet loss without
//! sockets and under a paused tokio clock.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{DEFAULT_CHANNEL_CAPACITY, Transport, TransportEvent};
use crate::error::{Error, Result};

/// Decides whether a datagram is lost: `(source, destination, data)`.
pub type DropFilter = Box<dyn Fn(SocketAddr, SocketAddr, &[u8]) -> bool + Send + Sync>;

/// Shared in-memory network.
pub struct MemoryNetwork {
    endpoints: DashMap<SocketAddr, mpsc::Sender<TransportEvent>>,
    drop_filter: RwLock<Option<DropFilter>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: DashMap::new(),
            drop_filter: RwLock::new(None),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Bind a transport at `addr`.
    pub fn bind(
        self: &Arc<Self>,
        addr: SocketAddr,
    ) -> Result<(MemoryTransport, mpsc::Receiver<TransportEvent>)> {
        let (events_tx, events_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        match self.endpoints.entry(addr) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Err(Error::AddressInUse(addr)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(events_tx.clone());
            }
        }
        debug!("Memory transport bound to {}", addr);

        let transport = MemoryTransport {
            inner: Arc::new(MemoryTransportInner {
                network: self.clone(),
                local_addr: addr,
                closed: AtomicBool::new(false),
                events_tx,
            }),
        };
        Ok((transport, events_rx))
    }

    /// Install a filter; datagrams for which it returns `true` are lost.
    pub fn set_drop_filter<F>(&self, filter: F)
    where
        F: Fn(SocketAddr, SocketAddr, &[u8]) -> bool + Send + Sync + 'static,
    {
        *self.drop_filter.write() = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        *self.drop_filter.write() = None;
    }

    /// Datagrams delivered so far
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Datagrams lost so far, by filter or missing destination
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn deliver(&self, source: SocketAddr, destination: SocketAddr, data: &[u8]) {
        if let Some(filter) = self.drop_filter.read().as_ref() {
            if filter(source, destination, data) {
                trace!("Dropping datagram {} -> {}", source, destination);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let Some(sender) = self.endpoints.get(&destination).map(|s| s.clone()) else {
            // Nobody listening: lost, as on a real network
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let event = TransportEvent::DatagramReceived {
            data: Bytes::copy_from_slice(data),
            source,
            destination,
        };
        if sender.try_send(event).is_ok() {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Transport bound on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<MemoryTransportInner>,
}

struct MemoryTransportInner {
    network: Arc<MemoryNetwork>,
    local_addr: SocketAddr,
    closed: AtomicBool,
    events_tx: mpsc::Sender<TransportEvent>,
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr)
    }

    async fn send_datagram(&self, data: &[u8], destination: SocketAddr) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }
        self.inner.network.deliver(self.inner.local_addr, destination, data);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.network.endpoints.remove(&self.inner.local_addr);
            let _ = self.inner.events_tx.send(TransportEvent::Closed).await;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryTransport({})", self.inner.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivery_and_drop_filter() {
        let network = MemoryNetwork::new();
        let a_addr: SocketAddr = "10.0.0.1:1719".parse().unwrap();
        let b_addr: SocketAddr = "10.0.0.2:1719".parse().unwrap();
        let (a, _a_rx) = network.bind(a_addr).unwrap();
        let (_b, mut b_rx) = network.bind(b_addr).unwrap();

        a.send_datagram(b"one", b_addr).await.unwrap();
        match b_rx.recv().await.unwrap() {
            TransportEvent::DatagramReceived { data, source, .. } => {
                assert_eq!(&data[..], b"one");
                assert_eq!(source, a_addr);
            }
            other => panic!("Unexpected event: {:?}", other),
        }

        network.set_drop_filter(|_, _, data| data == b"lost");
        a.send_datagram(b"lost", b_addr).await.unwrap();
        a.send_datagram(b"two", b_addr).await.unwrap();
        match b_rx.recv().await.unwrap() {
            TransportEvent::DatagramReceived { data, .. } => assert_eq!(&data[..], b"two"),
            other => panic!("Unexpected event: {:?}", other),
        }
        assert_eq!(network.dropped(), 1);
        assert_eq!(network.delivered(), 2);
    }

    #[tokio::test]
    async fn test_rebind_after_close() {
        let network = MemoryNetwork::new();
        let addr: SocketAddr = "10.0.0.1:1719".parse().unwrap();
        let (a, _rx) = network.bind(addr).unwrap();
        assert!(matches!(network.bind(addr), Err(Error::AddressInUse(_))));
        a.close().await.unwrap();
        assert!(network.bind(addr).is_ok());
    }
}
